//! Bearer token check in front of every command route.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use scriptgate_api::api::{ACCESS_TOKEN_FIELD, SUCCESS_HEADER};
use serde_json::Value;

use crate::request::{parse_body, BodyKind, RequestError, BODY_LIMIT};

/// Holds the token every request has to present.
#[derive(Clone)]
pub struct AccessGuard {
    token: Arc<str>,
}

impl std::fmt::Debug for AccessGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessGuard").finish_non_exhaustive()
    }
}

impl AccessGuard {
    pub fn new(token: impl Into<Arc<str>>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn accepts(&self, candidate: Option<&str>) -> bool {
        candidate.is_some_and(|candidate| candidate == &*self.token)
    }
}

/// The first token found in the body field, the query parameter or the
/// `Authorization: Bearer` header.
pub fn find_token(body: &Value, query: Option<&str>, headers: &HeaderMap) -> Option<String> {
    if let Some(token) = body.get(ACCESS_TOKEN_FIELD).and_then(Value::as_str) {
        return Some(token.to_owned());
    }

    if let Some(query) = query {
        let pairs: Vec<(String, String)> = serde_urlencoded::from_str(query).unwrap_or_default();
        if let Some((_, token)) = pairs.into_iter().find(|(key, _)| key == ACCESS_TOKEN_FIELD) {
            return Some(token);
        }
    }

    let authorization = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = (authorization.get(..7)?, authorization.get(7..)?);
    scheme
        .eq_ignore_ascii_case("bearer ")
        .then(|| token.trim().to_owned())
}

/// Rejects requests without the configured token with `401`.
///
/// Json and url encoded bodies are read to look for the token and put back
/// for the handler.
pub async fn access_guard(
    State(guard): State<AccessGuard>,
    request: Request,
    next: Next,
) -> Response {
    let kind = BodyKind::of(request.headers());
    let (parts, body) = request.into_parts();

    let (fields, body) = match kind {
        BodyKind::Json | BodyKind::Form => {
            if content_length(&parts.headers).is_some_and(|length| length > BODY_LIMIT) {
                return RequestError::Body {
                    status: StatusCode::PAYLOAD_TOO_LARGE,
                    message: format!("body exceeds {BODY_LIMIT} bytes"),
                }
                .into_response();
            }
            match to_bytes(body, BODY_LIMIT).await {
                Ok(bytes) => (
                    parse_body(kind, &bytes).unwrap_or(Value::Null),
                    Body::from(bytes),
                ),
                Err(e) => {
                    log::info!(e:display; "failed to read body while authenticating");
                    return RequestError::Body {
                        status: StatusCode::BAD_REQUEST,
                        message: e.to_string(),
                    }
                    .into_response();
                }
            }
        }
        BodyKind::Multipart | BodyKind::Other => (Value::Null, body),
    };

    let token = find_token(&fields, parts.uri.query(), &parts.headers);
    if !guard.accepts(token.as_deref()) {
        log::warn!(
            path = parts.uri.path(),
            token_present = token.is_some();
            "rejecting request without valid access token"
        );
        return unauthorized();
    }

    next.run(Request::from_parts(parts, body)).await
}

fn content_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(SUCCESS_HEADER, HeaderValue::from_static("false"))],
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bearer(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn token_from_each_source() {
        let none = HeaderMap::new();
        assert_eq!(
            find_token(&json!({ "access_token": "B" }), None, &none).as_deref(),
            Some("B")
        );
        assert_eq!(
            find_token(&Value::Null, Some("x=1&access_token=Q"), &none).as_deref(),
            Some("Q")
        );
        assert_eq!(
            find_token(&Value::Null, None, &bearer("Bearer H")).as_deref(),
            Some("H")
        );
        assert_eq!(
            find_token(&Value::Null, None, &bearer("bEaReR H")).as_deref(),
            Some("H")
        );
        assert_eq!(find_token(&Value::Null, Some("x=1"), &none), None);
    }

    #[test]
    fn body_wins_over_query_and_header() {
        let token = find_token(
            &json!({ "access_token": "body" }),
            Some("access_token=query"),
            &bearer("Bearer header"),
        );
        assert_eq!(token.as_deref(), Some("body"));

        let token = find_token(&Value::Null, Some("access_token=query"), &bearer("Bearer header"));
        assert_eq!(token.as_deref(), Some("query"));
    }

    #[test]
    fn other_schemes_are_ignored() {
        assert_eq!(find_token(&Value::Null, None, &bearer("Basic dXNlcg==")), None);
        assert_eq!(find_token(&Value::Null, None, &bearer("Bear")), None);
    }

    fn guarded() -> axum::Router {
        axum::Router::new()
            .route("/", axum::routing::post(|| async { "ok" }))
            .route_layer(axum::middleware::from_fn_with_state(
                AccessGuard::new("T"),
                access_guard,
            ))
    }

    #[tokio::test]
    async fn oversized_bodies_are_not_unauthorized() {
        use tower::ServiceExt;

        let request = Request::builder()
            .method("POST")
            .uri("/?access_token=T")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::CONTENT_LENGTH, (BODY_LIMIT + 1).to_string())
            .body(Body::from("{}"))
            .unwrap();
        let response = guarded().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(response.headers()[SUCCESS_HEADER], "false");
    }

    #[tokio::test]
    async fn body_token_reaches_the_handler() {
        use tower::ServiceExt;

        let request = Request::builder()
            .method("POST")
            .uri("/")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"access_token":"T"}"#))
            .unwrap();
        let response = guarded().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let request = Request::builder()
            .method("POST")
            .uri("/")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"access_token":"F"}"#))
            .unwrap();
        let response = guarded().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn exact_match_only() {
        let guard = AccessGuard::new("T");
        assert!(guard.accepts(Some("T")));
        assert!(!guard.accepts(Some("t")));
        assert!(!guard.accepts(Some("TT")));
        assert!(!guard.accepts(None));
    }
}
