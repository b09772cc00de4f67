

use axum::{http::StatusCode, Json};
use crate::models::ErrorResponse;

const CLOUD_ADMIN_PRPL: &str = "r/Colabri-CloudAdmin";

pub fn _is_authenticated(prpls: &Vec<String>) -> bool {
    !prpls.is_empty()
}

pub fn is_cloud_admin(prpls: &Vec<String>) -> bool {
    prpls.iter().any(|p| p == CLOUD_ADMIN_PRPL)
}

pub fn ensure_cloud_admin(prpls: &Vec<String>) -> Result<String, (StatusCode, Json<ErrorResponse>)> {
    if is_cloud_admin(prpls) {
        return Ok(CLOUD_ADMIN_PRPL.to_string());
    }

    let status = StatusCode::FORBIDDEN;
    Err((status, Json(ErrorResponse {
        code: status.as_u16(),
        status: status.to_string(),
        error: "Cloud Admin access required".to_string(),
    })))
}
