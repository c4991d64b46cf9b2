use std::sync::Arc;

use axum::body::Body;
use axum::http::header::CONTENT_LENGTH;
use axum::http::{HeaderName, HeaderValue, Method, StatusCode};
use axum::{
    Router,
    extract::{Request, State},
    response::{IntoResponse, Response},
};
use http_body_util::{BodyExt, LengthLimitError, Limited};

use crate::body::ClosingBody;
use engine::{Delivery, Engine};

/// Largest request body accepted before answering 413 without dispatching.
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

pub fn app_router(engine: Arc<Engine>) -> Router {
    Router::new().fallback(handle_request).with_state(engine)
}

async fn handle_request(State(engine): State<Arc<Engine>>, request: Request) -> Response {
    let head = request.method() == Method::HEAD;
    let request = match into_engine_request(request).await {
        Ok(request) => request,
        Err(response) => return response,
    };

    tracing::debug!("{} {}", request.method, request.target());
    let delivery = engine.dispatch(request).await;
    into_http_response(delivery, head)
}

async fn into_engine_request(request: Request) -> Result<pool::Request, Response> {
    let (parts, body) = request.into_parts();

    let body = match Limited::new(body, MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) if err.is::<LengthLimitError>() => {
            return Err((StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large").into_response());
        }
        Err(err) => {
            tracing::warn!("failed to read request body: {}", err);
            return Err((StatusCode::BAD_REQUEST, "Bad Request").into_response());
        }
    };

    let mut converted = pool::Request::new(parts.method.as_str(), parts.uri.path())
        .with_query(parts.uri.query().unwrap_or(""))
        .with_body(body);
    for (name, value) in parts.headers.iter() {
        converted = converted.with_header(
            name.as_str(),
            String::from_utf8_lossy(value.as_bytes()).into_owned(),
        );
    }
    Ok(converted)
}

fn into_http_response(delivery: Delivery, head: bool) -> Response {
    let (response, completion) = delivery.into_parts();
    let status = StatusCode::from_u16(response.status).unwrap_or_else(|_| {
        tracing::warn!("handler returned invalid status {}", response.status);
        StatusCode::INTERNAL_SERVER_ERROR
    });

    let mut builder = Response::builder().status(status);
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in &response.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => tracing::warn!("dropping invalid response header {:?}", name),
            }
        }
        if head && !headers.contains_key(CONTENT_LENGTH) {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(response.body.len()));
        }
    }

    let data = if head { bytes::Bytes::new() } else { response.body };
    match builder.body(Body::new(ClosingBody::new(data, completion))) {
        Ok(response) => response,
        Err(err) => {
            tracing::error!("failed to build response: {}", err);
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn converts_uri_and_headers() {
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/echo/x?a=1&b=2")
            .header("X-Forwarded-For", "10.0.0.1, 10.0.0.2")
            .header("Accept", "text/plain")
            .body(Body::from("payload"))
            .expect("request");

        let converted = into_engine_request(request).await.expect("converted");
        assert_eq!(converted.method, "POST");
        assert_eq!(converted.path, "/echo/x");
        assert_eq!(converted.query, "a=1&b=2");
        assert_eq!(converted.header("x-forwarded-for"), Some("10.0.0.1, 10.0.0.2"));
        assert_eq!(converted.body, "payload");
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/")
            .body(Body::from(vec![b'x'; MAX_BODY_BYTES + 1]))
            .expect("request");

        let response = into_engine_request(request).await.expect_err("too large");
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
