pub mod auth;

pub mod health;
pub use self::health::health;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Every failure answers JSON with a `message` field so the client never
/// has to parse an HTML error page.
#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    pub message: String,
}

pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            message: message.into(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn error_response_is_json_with_message() {
        let response = error_response(StatusCode::BAD_REQUEST, "Email is required");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let parsed: ErrorResponse = serde_json::from_slice(&body).expect("json body");
        assert_eq!(parsed.message, "Email is required");
    }
}
