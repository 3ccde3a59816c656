pub mod request;

pub use request::{REQUEST_ID_HEADER, http_metrics_middleware, request_id_middleware};
