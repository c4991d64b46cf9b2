use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use engine::{Engine, ServerConfig};
use pool::{Handler, HandlerError, HandlerFactory, InvokeContext, Reply, Response};

struct Routes {
    closes: Arc<AtomicUsize>,
}

impl Handler for Routes {
    fn invoke(&mut self, request: &pool::Request, ctx: &mut InvokeContext) -> Result<Reply, HandlerError> {
        let response = match request.path.as_str() {
            "/" => Response::ok("hello").with_header("Content-Type", "text/plain"),
            "/echo" => Response::ok(request.body.clone())
                .with_header("X-Method", request.method.clone())
                .with_header("X-Query", request.query.clone()),
            "/cookies" => Response::ok("two")
                .with_header("Set-Cookie", "a=1")
                .with_header("Set-Cookie", "b=2"),
            "/block/" => Response::ok("bye").with_header("X-Block", "30"),
            "/close/" => {
                let closes = Arc::clone(&self.closes);
                ctx.on_close(move |_| {
                    closes.fetch_add(1, Ordering::SeqCst);
                });
                Response::ok("closing")
            }
            "/slow" => {
                ctx.sleep(Duration::from_secs(5))?;
                Response::ok("late")
            }
            _ => Response::text(404, "not found"),
        };
        Ok(Reply::Respond(response))
    }
}

fn router() -> (axum::Router, Arc<AtomicUsize>) {
    let closes = Arc::new(AtomicUsize::new(0));
    let shared = Arc::clone(&closes);
    let factory: HandlerFactory = Arc::new(move |_| {
        Box::new(Routes {
            closes: Arc::clone(&shared),
        })
    });
    let config = ServerConfig {
        workers: 2,
        request_timeout_ms: 200,
        reclaim_grace_ms: 100,
        ..ServerConfig::default()
    };
    (http::app_router(Engine::new(config, factory)), closes)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).expect("request")
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.expect("body").to_bytes();
    String::from_utf8_lossy(&bytes).into_owned()
}

#[tokio::test]
async fn serves_handler_response() {
    let (app, _) = router();
    let response = app.oneshot(get("/")).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/plain");
    assert_eq!(body_text(response).await, "hello");
}

#[tokio::test]
async fn passes_method_query_and_body_through() {
    let (app, _) = router();
    let request = Request::builder()
        .method("PUT")
        .uri("/echo?x=1")
        .body(Body::from("payload"))
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.headers()["x-method"], "PUT");
    assert_eq!(response.headers()["x-query"], "x=1");
    assert_eq!(body_text(response).await, "payload");
}

#[tokio::test]
async fn repeated_headers_are_kept() {
    let (app, _) = router();
    let response = app.oneshot(get("/cookies")).await.expect("response");
    let cookies: Vec<_> = response.headers().get_all("set-cookie").iter().collect();
    assert_eq!(cookies.len(), 2);
}

#[tokio::test]
async fn head_keeps_length_and_drops_body() {
    let (app, _) = router();
    let request = Request::builder()
        .method("HEAD")
        .uri("/")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-length"], "5");
    assert_eq!(body_text(response).await, "");
}

#[tokio::test]
async fn close_runs_after_the_body_is_released() {
    let (app, closes) = router();
    let response = app.oneshot(get("/close/")).await.expect("response");
    assert_eq!(closes.load(Ordering::SeqCst), 0);
    assert_eq!(body_text(response).await, "closing");
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn block_header_is_stripped_and_enforced() {
    let (app, _) = router();
    let blocking = Request::builder()
        .uri("/block/")
        .header("X-Forwarded-For", "198.51.100.7")
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(blocking).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-block").is_none());

    let other = Request::builder()
        .uri("/")
        .header("X-Forwarded-For", "203.0.113.9")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(other).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn slow_handler_gets_gateway_error() {
    let (app, _) = router();
    let response = app.oneshot(get("/slow")).await.expect("response");
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn unknown_route_is_the_handlers_decision() {
    let (app, _) = router();
    let response = app.oneshot(get("/missing")).await.expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
