use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::policies::PolicyResult;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementQuery {
    pub required_level: Option<i64>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CheckEntitlementsRequest {
    #[validate(length(min = 1, max = 50, message = "between 1 and 50 keys per check"))]
    pub keys: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckEntitlementsResponse {
    pub results: HashMap<String, PolicyResult>,
}
