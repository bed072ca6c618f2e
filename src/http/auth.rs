use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::auth::AllowList;

/// Reject requests whose `Authorization` header is not on the allow-list.
pub async fn require_token(
    State(tokens): State<AllowList>,
    request: Request,
    next: Next,
) -> Response {
    let allowed = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|token| tokens.allows(token));

    if !allowed {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Invalid or missing token" })),
        )
            .into_response();
    }

    next.run(request).await
}
