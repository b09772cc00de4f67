use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Response for an error
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub code: u16,
    pub status: String,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(code: u16, status: &str, error: impl Into<String>) -> Self {
        Self {
            code,
            status: status.to_string(),
            error: error.into(),
        }
    }
}
