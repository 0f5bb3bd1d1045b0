//! Bridge behavior through the full host router stack.

use std::sync::atomic::Ordering;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::get;
use axum::{middleware, Router};
use bytes::Bytes;
use serde_json::json;
use tower::ServiceExt;

use owin_bridge::bridge::{keys, EnvValue, PipelineExtensions};
use owin_bridge::pipeline::PipelineError;
use owin_bridge::HttpServer;

mod common;
use common::{config_for, ScriptedPipeline};

async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_declined_request_reaches_host_fallback() {
    let pipeline = ScriptedPipeline::declining();
    let server = HttpServer::new(config_for("myapp.dll"), pipeline.clone()).unwrap();

    let response = server
        .router(false)
        .oneshot(Request::builder().uri("/missing").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(response.headers().contains_key("x-request-id"));
    assert_eq!(body_text(response).await, "Not Found");
    assert_eq!(pipeline.dispatch_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_declined_request_reaches_host_route() {
    let pipeline = ScriptedPipeline::declining();
    let host = Router::new().route("/health", get(|| async { "ok" }));
    let server = HttpServer::with_routes(config_for("myapp.dll"), pipeline, host).unwrap();

    let response = server
        .router(false)
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "ok");
}

#[tokio::test]
async fn test_pipeline_writes_response() {
    let pipeline = ScriptedPipeline::new(|env| async move {
        let path = env.get(keys::REQUEST_PATH).and_then(EnvValue::as_str).unwrap_or_default().to_string();
        env.function(keys::SET_STATUS).unwrap().call(EnvValue::from(202u64)).await.ok();
        env.function(keys::SET_HEADERS)
            .unwrap()
            .call(EnvValue::from(json!({ "Content-Type": ["text/plain"] })))
            .await
            .ok();
        env.function(keys::WRITE)
            .unwrap()
            .call(EnvValue::Bytes(Bytes::from(format!("handled {path}"))))
            .await
            .ok();
        Ok(EnvValue::Bool(true))
    });
    let server = HttpServer::new(config_for("myapp.dll"), pipeline).unwrap();

    let response = server
        .router(false)
        .oneshot(Request::builder().uri("/orders").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(response.headers()["content-type"], "text/plain");
    assert_eq!(body_text(response).await, "handled /orders");
}

#[tokio::test]
async fn test_scheme_follows_listener() {
    let pipeline = ScriptedPipeline::new(|env| async move {
        let scheme = env.get(keys::REQUEST_SCHEME).and_then(EnvValue::as_str).unwrap_or_default().to_string();
        env.function(keys::WRITE).unwrap().call(EnvValue::Bytes(Bytes::from(scheme))).await.ok();
        Ok(EnvValue::Bool(true))
    });
    let server = HttpServer::new(config_for("myapp.dll"), pipeline).unwrap();

    for (encrypted, expected) in [(false, "http"), (true, "https")] {
        let response = server
            .router(encrypted)
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_text(response).await, expected);
    }
}

#[tokio::test]
async fn test_extensions_from_host_middleware() {
    let pipeline = ScriptedPipeline::new(|env| async move {
        let user = env.get("node.user").and_then(EnvValue::as_str).unwrap_or("anonymous").to_string();
        env.function(keys::WRITE).unwrap().call(EnvValue::Bytes(Bytes::from(user))).await.ok();
        Ok(EnvValue::Bool(true))
    });
    let server = HttpServer::new(config_for("myapp.dll"), pipeline).unwrap();

    // Outer host middleware attaches per-request data before the bridge runs.
    let app = server.router(false).layer(middleware::from_fn(
        |mut request: axum::extract::Request, next: middleware::Next| async move {
            request.extensions_mut().insert(PipelineExtensions::new().with("user", "alice"));
            next.run(request).await
        },
    ));

    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(body_text(response).await, "alice");
}

#[tokio::test]
async fn test_initialization_receives_options() {
    let pipeline = ScriptedPipeline::declining();
    let mut config = config_for("unused");
    config.pipeline.options = json!({ "assemblyFile": "myapp.dll", "greeting": "hello" });
    let server = HttpServer::new(config, pipeline.clone()).unwrap();

    for _ in 0..2 {
        server
            .router(false)
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
    }

    assert_eq!(pipeline.init_calls.load(Ordering::SeqCst), 1);
    let options = pipeline.last_options.lock().unwrap().clone().unwrap();
    assert_eq!(options.assembly_file(), "myapp.dll");
    assert_eq!(options.get("greeting"), Some(&EnvValue::from("hello")));
}

#[tokio::test]
async fn test_remote_status_is_used_for_errors() {
    let pipeline = ScriptedPipeline::new(|_| async {
        Err(PipelineError::Remote { message: "service unavailable".into(), status: Some(503) })
    });
    let server = HttpServer::new(config_for("myapp.dll"), pipeline).unwrap();

    let response = server
        .router(false)
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let payload: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(payload["status"], 503);
}

#[tokio::test]
async fn test_oversized_body_rejected() {
    let pipeline = ScriptedPipeline::declining();
    let mut config = config_for("myapp.dll");
    config.limits.max_body_size = 4;
    let server = HttpServer::new(config, pipeline.clone()).unwrap();

    let response = server
        .router(false)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/")
                .header("content-length", "11")
                .body(Body::from("hello world"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(pipeline.dispatch_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_rejects_invalid_options() {
    let mut config = config_for("myapp.dll");
    config.pipeline.options = json!(["myapp.dll"]);
    assert!(HttpServer::new(config, ScriptedPipeline::declining()).is_err());
}

