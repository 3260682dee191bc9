//! Registers every discovered command on the router.
//!
//! Per route the request passes the access guard (if a bearer is
//! configured), has its input collected (uploads only for methods other than
//! GET, HEAD and OPTIONS), runs the command, is offered to the extensions in
//! order and is finally translated into a response.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Request};
use axum::handler::Handler;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::MethodRouter;
use axum::{middleware, Router};
use scriptgate_api::api::Verb;

use crate::args::CommandFlags;
use crate::config::{ConfigError, ServerConfig};
use crate::discovery::{self, Route};
use crate::guard::{access_guard, AccessGuard};
use crate::process::ProcessRunner;
use crate::request::{self, BODY_LIMIT};
use crate::response::{self, Outcome};

/// What an [`Extension`] can see of a finished execution.
#[derive(Debug)]
pub struct ExecutionContext<'a> {
    pub id: u64,
    pub route: &'a Route,
    pub flags: &'a CommandFlags,
}

/// Hook that runs after every execution, before the response is built.
pub trait Extension: Send + Sync {
    /// Returning a response replaces the default one and skips the
    /// extensions registered after this one.
    fn after_execution(&self, context: &ExecutionContext<'_>, outcome: &Outcome) -> Option<Response>;
}

impl<F> Extension for F
where
    F: Fn(&ExecutionContext<'_>, &Outcome) -> Option<Response> + Send + Sync,
{
    fn after_execution(&self, context: &ExecutionContext<'_>, outcome: &Outcome) -> Option<Response> {
        self(context, outcome)
    }
}

/// Shared by all requests of one route, never mutated.
#[derive(Clone)]
struct RouteState {
    route: Arc<Route>,
    runner: Arc<ProcessRunner>,
    extensions: Arc<[Arc<dyn Extension>]>,
}

/// Scans the commands root and builds the router serving it.
pub fn router(config: &ServerConfig) -> Result<Router, ConfigError> {
    let routes = discovery::discover(&config.path, config.shebang.is_some())?;
    Ok(mount(routes, config))
}

/// Builds the router for already discovered routes.
pub fn mount(routes: Vec<Route>, config: &ServerConfig) -> Router {
    let runner = Arc::new(ProcessRunner::from_config(config));
    let extensions: Arc<[Arc<dyn Extension>]> = config.extensions.clone().into();

    // Files of the same directory share one method router.
    let mut patterns: Vec<(String, Vec<RouteState>)> = Vec::new();
    for route in routes {
        log::info!(route:display = route, target:debug = route.target; "mounting");
        let state = RouteState {
            route: Arc::new(route),
            runner: Arc::clone(&runner),
            extensions: Arc::clone(&extensions),
        };
        match patterns
            .iter_mut()
            .find(|(pattern, _)| *pattern == state.route.url_pattern)
        {
            Some((_, states)) => states.push(state),
            None => patterns.push((state.route.url_pattern.clone(), vec![state])),
        }
    }

    let mut router = Router::new();
    for (pattern, states) in patterns {
        // Methods without a file are missing routes, not 405.
        let method_router = MethodRouter::new().fallback(not_found);
        let method_router = states.into_iter().fold(method_router, |method_router, state| {
            let verb = state.route.verb;
            register(verb, method_router, move |request: Request| execute(state, request))
        });
        router = router.route(&pattern, method_router);
    }
    if let Some(bearer) = &config.bearer {
        router = router.route_layer(middleware::from_fn_with_state(
            AccessGuard::new(bearer.as_str()),
            access_guard,
        ));
    }
    router.fallback(not_found).layer(DefaultBodyLimit::max(BODY_LIMIT))
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Dispatch table from verb to method router registration.
fn register<H, T>(verb: Verb, method_router: MethodRouter, handler: H) -> MethodRouter
where
    H: Handler<T, ()>,
    T: 'static,
{
    match verb {
        Verb::All => method_router.fallback(handler),
        Verb::Get => method_router.get(handler),
        Verb::Post => method_router.post(handler),
        Verb::Put => method_router.put(handler),
        Verb::Delete => method_router.delete(handler),
        Verb::Head => method_router.head(handler),
        Verb::Options => method_router.options(handler),
    }
}

async fn execute(state: RouteState, request: Request) -> Response {
    let id = fastrand::u64(..);
    let route = &state.route;
    log::info!(id, method = request.method().as_str(), route:display = route; "received request");

    let accept_uploads = ![Method::GET, Method::HEAD, Method::OPTIONS].contains(request.method());
    let (input, uploads) = match request::collect(id, request, accept_uploads).await {
        Ok(collected) => collected,
        Err(e) => {
            log::info!(id, e:display; "rejecting malformed request");
            return e.into_response();
        }
    };

    let flags = CommandFlags::from_request(&input);
    let command_line = state.runner.command_line(&route.target, &flags);
    let outcome = state.runner.run(id, &command_line).await;

    let context = ExecutionContext {
        id,
        route,
        flags: &flags,
    };
    let intercepted = state
        .extensions
        .iter()
        .find_map(|extension| extension.after_execution(&context, &outcome));
    let response = match intercepted {
        Some(response) => {
            log::debug!(id; "response provided by extension");
            response
        }
        None => response::translate(id, outcome).await,
    };

    if let Some(uploads) = uploads {
        uploads.remove().await;
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, HeaderValue};
    use scriptgate_api::api::SUCCESS_HEADER;
    use serde_json::{json, Value};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    const HELLO: &str = r#"
name=World
while [ $# -gt 0 ]; do
    case "$1" in
        --name) name="$2"; shift; shift ;;
        *) shift ;;
    esac
done
echo "Hello $name"
"#;

    fn write(root: &Path, relative: &str, script: &str) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, script).unwrap();
    }

    fn commands() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "hello/get.sh", HELLO);
        write(root, "hello/post.sh", HELLO);
        write(root, "hello/:name/get.sh", HELLO);
        write(root, "bye/get.sh", "echo 'Bye World' >&2\nexit 11\n");
        write(root, "broken/get.sh", "echo 'it broke'\nexit 3\n");
        write(root, "slow/get.sh", "sleep 5\n");
        write(
            root,
            "report/get.sh",
            "printf 'numbers' > \"$TMPDIR/scriptgate-report.txt\"\necho \"$TMPDIR/scriptgate-report.txt\"\nexit 10\n",
        );
        write(root, "args/all.sh", "echo \"$@\"\n");
        write(root, "args/get.sh", "echo get\n");
        write(
            root,
            "upload/post.sh",
            "while [ $# -gt 0 ]; do\n  if [ \"$1\" = --file ]; then cat \"$2\"; fi\n  shift\ndone\n",
        );
        dir
    }

    fn config(root: &Path) -> ServerConfig {
        let tmp = std::env::temp_dir().to_string_lossy().into_owned();
        ServerConfig::new(root)
            .unwrap()
            .with_shebang("sh")
            .unwrap()
            .with_env([(String::from("TMPDIR"), tmp)].into_iter().collect())
    }

    async fn call(router: &Router, request: Request) -> (StatusCode, Option<String>, Vec<u8>) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let success = response
            .headers()
            .get(SUCCESS_HEADER)
            .map(|v| v.to_str().unwrap().to_owned());
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, success, body.to_vec())
    }

    fn get(uri: &str) -> Request {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn json_body(body: &[u8]) -> Value {
        serde_json::from_slice(body).unwrap()
    }

    #[tokio::test]
    async fn hello_world() {
        let dir = commands();
        let router = router(&config(dir.path())).unwrap();

        let (status, success, body) = call(&router, get("/hello")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(success.as_deref(), Some("true"));
        assert_eq!(
            json_body(&body),
            json!({ "success": true, "result": "Hello World" })
        );
    }

    #[tokio::test]
    async fn quotes_survive_the_round_trip() {
        let dir = commands();
        let router = router(&config(dir.path())).unwrap();

        let (_, _, body) = call(&router, get("/hello?name=Sarah%20%22Connor%22")).await;
        assert_eq!(json_body(&body)["result"], "Hello Sarah \"Connor\"");
    }

    #[tokio::test]
    async fn path_params_headers_and_bodies() {
        let dir = commands();
        let router = router(&config(dir.path())).unwrap();

        let (_, _, body) = call(&router, get("/hello/Jhon")).await;
        assert_eq!(json_body(&body)["result"], "Hello Jhon");

        let request = Request::builder()
            .uri("/hello")
            .header("X-Arg-Name", "Header")
            .body(Body::empty())
            .unwrap();
        let (_, _, body) = call(&router, request).await;
        assert_eq!(json_body(&body)["result"], "Hello Header");

        let request = Request::builder()
            .method("POST")
            .uri("/hello?name=Query")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"name":"Body"}"#))
            .unwrap();
        let (_, _, body) = call(&router, request).await;
        assert_eq!(json_body(&body)["result"], "Hello Body");

        let request = Request::builder()
            .method("POST")
            .uri("/hello")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from("name=Form"))
            .unwrap();
        let (_, _, body) = call(&router, request).await;
        assert_eq!(json_body(&body)["result"], "Hello Form");
    }

    #[tokio::test]
    async fn exit_code_protocol() {
        let dir = commands();
        let router = router(&config(dir.path())).unwrap();

        let (status, success, body) = call(&router, get("/bye")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(success.as_deref(), Some("false"));
        assert_eq!(
            json_body(&body),
            json!({ "success": false, "message": "Bye World" })
        );

        let (status, success, body) = call(&router, get("/broken")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(success.as_deref(), Some("false"));
        assert_eq!(body, b"it broke");

        let (status, success, body) = call(&router, get("/report")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(success.as_deref(), Some("true"));
        assert_eq!(body, b"numbers");
    }

    #[tokio::test]
    async fn timeouts_are_errors() {
        let dir = commands();
        let router = router(&config(dir.path()).with_timeout_ms(100)).unwrap();

        let (status, success, body) = call(&router, get("/slow")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(success.as_deref(), Some("false"));
        assert!(String::from_utf8(body).unwrap().contains("timeout"));
    }

    #[tokio::test]
    async fn unknown_routes_are_404() {
        let dir = commands();
        let router = router(&config(dir.path())).unwrap();

        let (status, success, body) = call(&router, get("/nothing/here")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(success, None);
        assert!(body.is_empty());

        // Known path, but no file for the method.
        let request = Request::builder()
            .method("POST")
            .uri("/bye")
            .body(Body::empty())
            .unwrap();
        let (status, success, body) = call(&router, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(success, None);
        assert!(body.is_empty());

        let request = Request::builder()
            .method("DELETE")
            .uri("/hello/Jhon")
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = call(&router, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn all_answers_remaining_methods() {
        let dir = commands();
        let router = router(&config(dir.path())).unwrap();

        let (_, _, body) = call(&router, get("/args")).await;
        assert_eq!(json_body(&body)["result"], "get");

        let request = Request::builder()
            .method("PATCH")
            .uri("/args?x=1")
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = call(&router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(&body)["result"], "--x 1");
    }

    #[tokio::test]
    async fn bearer_token() {
        let dir = commands();
        let router = router(&config(dir.path()).with_bearer("T").unwrap()).unwrap();

        let (status, success, _) = call(&router, get("/hello")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(success.as_deref(), Some("false"));

        let (status, _, _) = call(&router, get("/hello?access_token=wrong")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _, _) = call(&router, get("/hello?access_token=T")).await;
        assert_eq!(status, StatusCode::OK);

        let request = Request::builder()
            .uri("/hello")
            .header(header::AUTHORIZATION, HeaderValue::from_static("Bearer T"))
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = call(&router, request).await;
        assert_eq!(status, StatusCode::OK);

        let request = Request::builder()
            .method("POST")
            .uri("/hello")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"access_token":"T","name":"Guarded"}"#))
            .unwrap();
        let (status, _, body) = call(&router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(&body)["result"], "Hello Guarded");

        // Missing routes stay 404 with a bearer.
        let (status, _, _) = call(&router, get("/nothing")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let request = Request::builder()
            .method("PUT")
            .uri("/bye?access_token=T")
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = call(&router, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn uploads_are_passed_as_paths() {
        let dir = commands();
        let router = router(&config(dir.path())).unwrap();

        let body = "--B\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"hello.txt\"\r\n\r\n\
             file contents\r\n\
             --B--\r\n";
        let request = Request::builder()
            .method("POST")
            .uri("/upload")
            .header(header::CONTENT_TYPE, "multipart/form-data; boundary=B")
            .body(Body::from(body))
            .unwrap();
        let (status, _, body) = call(&router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(&body)["result"], "file contents");
    }

    #[tokio::test]
    async fn extensions_run_in_order() {
        let dir = commands();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let config = config(dir.path())
            .with_extension(move |context: &ExecutionContext<'_>, outcome: &Outcome| -> Option<Response> {
                assert_eq!(context.route.url_pattern, "/hello");
                assert!(outcome.as_ref().is_ok_and(|result| result.success()));
                counter.fetch_add(1, Ordering::SeqCst);
                None
            })
            .with_extension(|context: &ExecutionContext<'_>, _: &Outcome| -> Option<Response> {
                context
                    .flags
                    .get("name")
                    .map(|_| (StatusCode::ACCEPTED, "intercepted").into_response())
            });
        let router = router(&config).unwrap();

        let (status, _, _) = call(&router, get("/hello")).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _, body) = call(&router, get("/hello?name=x")).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body, b"intercepted");
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
