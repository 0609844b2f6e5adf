//! services/chat_api/src/web/middleware.rs
//!
//! Identity middleware for protecting routes.
//!
//! Authentication is handled by the hosted auth service in front of this API;
//! it forwards the authenticated principal as `x-user-id` and `x-user-role`.

use axum::{
    extract::Request,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use campus_chat_core::{Identity, Role};
use tracing::warn;
use uuid::Uuid;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

/// Reads the forwarded identity from the request headers.
pub fn identity_from_headers(headers: &HeaderMap) -> Option<Identity> {
    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v.trim()).ok())?;
    let role = headers
        .get(USER_ROLE_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(Role::parse)?;
    Some(Identity { user_id, role })
}

/// Middleware that extracts the forwarded identity.
///
/// If valid, inserts the `Identity` into request extensions for handlers to use.
/// If invalid or missing, returns 401 Unauthorized.
pub async fn require_identity(mut req: Request, next: Next) -> Result<Response, StatusCode> {
    let identity = identity_from_headers(req.headers()).ok_or_else(|| {
        warn!(path = %req.uri().path(), "Request without a valid forwarded identity");
        StatusCode::UNAUTHORIZED
    })?;

    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(user_id: &str, role: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, HeaderValue::from_str(user_id).unwrap());
        headers.insert(USER_ROLE_HEADER, HeaderValue::from_str(role).unwrap());
        headers
    }

    #[test]
    fn parses_a_forwarded_identity() {
        let user_id = Uuid::new_v4();
        let identity = identity_from_headers(&headers(&user_id.to_string(), "recruiter")).unwrap();

        assert_eq!(identity, Identity::recruiter(user_id));
    }

    #[test]
    fn rejects_missing_or_malformed_headers() {
        assert!(identity_from_headers(&HeaderMap::new()).is_none());
        assert!(identity_from_headers(&headers("not-a-uuid", "student")).is_none());
        assert!(identity_from_headers(&headers(&Uuid::new_v4().to_string(), "admin")).is_none());
    }
}
