use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{StatusCode},
    middleware::Next,
    response::Response,
};
use tracing::{error, info};
use crate::services::auth_service::{get_auth_token, AuthError};
use crate::AppState;

pub async fn auth_middleware(
    State(app_state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {

    // 1. Get the auth token from the request
    let token = match get_auth_token(&req) {
        Ok(token) => token,
        Err(_) => return Err(StatusCode::UNAUTHORIZED),
    };

    // 2. Validate the token
    let identity = match app_state.verifier.verify(&token).await {
        Ok(identity) => identity,
        Err(AuthError::NotConfigured) => {
            error!("Cloud auth JWT secret not configured");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
        Err(e) => {
            error!("JWT validation failed: {}", e);
            return Err(StatusCode::UNAUTHORIZED);
        }
    };

    // Log the validation of the user token
    info!("User token validated successfully");

    // 3. Set the caller's principals and UID into request extensions for
    //    downstream handlers
    {
        let extensions = req.extensions_mut();
        extensions.insert(identity.roles);
        extensions.insert(identity.user_id);
    }

    // Token is valid, proceed to next middleware/handler
    Ok(next.run(req).await)
}
