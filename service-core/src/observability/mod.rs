pub mod logging;

pub use logging::{LoggingOptions, init_tracing};
