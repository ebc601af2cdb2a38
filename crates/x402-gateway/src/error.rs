use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;

use crate::cors;

/// Glue-layer failures surfaced outside the payment state machine (which
/// builds its 400/402 responses directly).
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Request named a route key that is not configured.
    #[error("Unknown route: {0}")]
    UnknownRoute(String),

    #[error("proxy error: {0}")]
    ProxyError(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ResponseError for GatewayError {
    fn error_response(&self) -> HttpResponse {
        match self {
            GatewayError::UnknownRoute(key) => {
                cors::apply(&mut HttpResponse::InternalServerError()).json(serde_json::json!({
                    "error": format!("Unknown route: {key}"),
                }))
            }
            GatewayError::ProxyError(msg) => {
                tracing::error!("proxy error: {msg}");
                cors::apply(&mut HttpResponse::BadGateway()).json(serde_json::json!({
                    "error": "proxy_error",
                    "message": "Failed to reach upstream service",
                }))
            }
            GatewayError::Internal(msg) => {
                tracing::error!("internal error: {msg}");
                cors::apply(&mut HttpResponse::InternalServerError()).json(serde_json::json!({
                    "error": "internal_error",
                    "message": "An internal error occurred",
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_route_body_names_key() {
        let resp = GatewayError::UnknownRoute("nonexistent".to_string()).error_response();
        assert_eq!(resp.status(), actix_web::http::StatusCode::INTERNAL_SERVER_ERROR);
    }
}
