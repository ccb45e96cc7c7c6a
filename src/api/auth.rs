use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use crate::engine::tokens_match;
use crate::AppState;

/// Pull the presented credential from a request.
///
/// Accepts `Authorization: Bearer <token>`, `X-API-Key`, or a `token` query
/// parameter (EventSource clients cannot set headers).
fn presented_token(request: &Request<Body>) -> Option<String> {
    if let Some(header) = request
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
    {
        let token = header.strip_prefix("Bearer ").unwrap_or(header);
        return Some(token.to_string());
    }

    if let Some(api_key) = request.headers().get("X-API-Key").and_then(|h| h.to_str().ok()) {
        return Some(api_key.to_string());
    }

    request.uri().query().and_then(|q| {
        q.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            (key == "token").then(|| value.to_string())
        })
    })
}

/// Admin token gate for the management API
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = presented_token(&request).ok_or(StatusCode::UNAUTHORIZED)?;

    if tokens_match(&token, &state.config.auth.admin_token) {
        Ok(next.run(request).await)
    } else {
        tracing::debug!(path = %request.uri().path(), "Rejected request with bad admin token");
        Err(StatusCode::UNAUTHORIZED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(builder: axum::http::request::Builder) -> Request<Body> {
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_presented_token_sources() {
        let bearer = request(Request::get("/api/services").header("Authorization", "Bearer abc"));
        assert_eq!(presented_token(&bearer).as_deref(), Some("abc"));

        let api_key = request(Request::get("/api/services").header("X-API-Key", "k"));
        assert_eq!(presented_token(&api_key).as_deref(), Some("k"));

        let query = request(Request::get("/api/logs/stream?path=a&token=q"));
        assert_eq!(presented_token(&query).as_deref(), Some("q"));

        let none = request(Request::get("/api/services"));
        assert!(presented_token(&none).is_none());
    }
}
