//! Bridge adapter: axum middleware in front of the host router.
//!
//! # Per-Request Flow
//! ```text
//! request
//!     → body.rs (buffer payload)
//!     → ensure_initialized (lazy, retried until it succeeds)
//!     → build_environment + response callbacks
//!     → Pipeline::dispatch
//!     → truthy: send the buffered response
//!       falsy:  Next::run (host router handles the request)
//!       error:  BridgeError response, partial response discarded
//! ```
//!
//! # Design Decisions
//! - The application id lives in a single-slot `ArcSwapOption` owned by the
//!   adapter. Initialization is not serialized: concurrent first requests each
//!   run `initialize` and the last successful result is kept
//! - The adapter imposes no timeout on pipeline calls; the host router's
//!   timeout layer bounds the whole request

use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwapOption;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, Version};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::Bytes;

use crate::bridge::body::{collect_body, RequestBody};
use crate::bridge::environment::{keys, EnvValue, Environment, PipelineExtensions};
use crate::bridge::error::BridgeError;
use crate::bridge::options::BridgeOptions;
use crate::bridge::response::ResponseCallbacks;
use crate::config::ConfigError;
use crate::http::request::{ConnectionInfo, RequestIdExt};
use crate::observability::metrics;
use crate::pipeline::{AppId, Pipeline};

/// Default cap on buffered request bodies.
pub const DEFAULT_BODY_LIMIT: usize = 2 * 1024 * 1024;

/// What the host should do after the bridge ran.
#[derive(Debug)]
pub enum Outcome {
    /// The pipeline produced the full response.
    Complete(Response),
    /// The pipeline declined; continue with the host chain.
    Continue(Request),
}

struct Inner {
    options: BridgeOptions,
    pipeline: Arc<dyn Pipeline>,
    app_id: ArcSwapOption<AppId>,
}

/// Adapter between the host router and an external pipeline.
#[derive(Clone)]
pub struct OwinBridge {
    inner: Arc<Inner>,
    body_limit: usize,
}

impl OwinBridge {
    /// Validate `options` and build the adapter.
    ///
    /// `options` is either the assembly file name or a map with an
    /// `assemblyFile` entry; anything else is rejected here.
    pub fn register<P: Pipeline>(options: impl Into<EnvValue>, pipeline: P) -> Result<Self, ConfigError> {
        let options = BridgeOptions::from_value(options.into())?;
        Ok(Self::new(options, Arc::new(pipeline)))
    }

    pub fn new(options: BridgeOptions, pipeline: Arc<dyn Pipeline>) -> Self {
        tracing::debug!(assembly_file = options.assembly_file(), "Pipeline bridge registered");
        Self {
            inner: Arc::new(Inner {
                options,
                pipeline,
                app_id: ArcSwapOption::empty(),
            }),
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }

    pub fn with_body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }

    pub fn options(&self) -> &BridgeOptions {
        &self.inner.options
    }

    /// The memoized application id, if initialization has succeeded.
    pub fn app_id(&self) -> Option<AppId> {
        self.inner.app_id.load_full().map(|id| (*id).clone())
    }

    /// Wrap `router` so every request passes through the bridge first.
    pub fn attach(&self, router: Router) -> Router {
        router.layer(middleware::from_fn_with_state(self.clone(), owin_middleware))
    }

    /// Return the application id, initializing the pipeline if needed.
    pub async fn ensure_initialized(&self) -> Result<AppId, BridgeError> {
        if let Some(id) = self.inner.app_id.load_full() {
            return Ok((*id).clone());
        }

        tracing::debug!(assembly_file = self.inner.options.assembly_file(), "Initializing pipeline application");
        match self.inner.pipeline.initialize(&self.inner.options).await {
            Ok(id) => {
                self.inner.app_id.store(Some(Arc::new(id.clone())));
                metrics::record_initialization("success");
                tracing::info!(app_id = %id, "Pipeline application initialized");
                Ok(id)
            }
            Err(e) => {
                metrics::record_initialization("failure");
                tracing::error!(error = %e, "Pipeline initialization failed");
                Err(BridgeError::Initialization(e))
            }
        }
    }

    /// Build the request environment, without response callbacks.
    pub fn build_environment(&self, app_id: &AppId, request: &Request) -> Result<Environment, BridgeError> {
        let mut env = Environment::new();
        let uri = request.uri();

        env.insert(keys::APP_ID, app_id.0.clone());
        env.insert(keys::REQUEST_METHOD, request.method().as_str());
        env.insert(keys::REQUEST_PATH, uri.path());
        env.insert(keys::REQUEST_PATH_BASE, "");
        env.insert(keys::REQUEST_PROTOCOL, protocol(request.version()));
        env.insert(keys::REQUEST_QUERY_STRING, uri.query().unwrap_or(""));
        env.insert(keys::REQUEST_SCHEME, scheme(request));
        env.insert(keys::REQUEST_HEADERS, header_map(request.headers()));
        env.insert(keys::REQUEST_BODY, resolve_body(request.extensions().get::<RequestBody>())?);

        env.merge_prefixed(keys::HOST_PREFIX, &self.inner.options.to_map());

        if let Some(extensions) = request.extensions().get::<PipelineExtensions>() {
            env.merge_prefixed(keys::HOST_PREFIX, &extensions.0);
        }

        Ok(env)
    }

    /// Run one request through the pipeline.
    pub async fn process(&self, request: Request) -> Result<Outcome, BridgeError> {
        let request = collect_body(request, self.body_limit).await?;
        let app_id = self.ensure_initialized().await?;

        let mut env = self.build_environment(&app_id, &request)?;
        let callbacks = ResponseCallbacks::new();
        callbacks.install(&mut env);

        tracing::debug!(app_id = %app_id, "Calling pipeline");
        let result = self
            .inner
            .pipeline
            .dispatch(env)
            .await
            .map_err(BridgeError::ExternalCall)?;

        if result.is_truthy() {
            Ok(Outcome::Complete(callbacks.take_response()))
        } else {
            Ok(Outcome::Continue(request))
        }
    }
}

/// Middleware entry point registered on the host router.
pub async fn owin_middleware(State(bridge): State<OwinBridge>, request: Request, next: Next) -> Response {
    let start = Instant::now();
    let request_id = request.request_id().unwrap_or("unknown").to_string();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    match bridge.process(request).await {
        Ok(Outcome::Complete(response)) => {
            tracing::debug!(
                request_id = %request_id,
                method = %method,
                path = %path,
                status = response.status().as_u16(),
                "Pipeline completed response"
            );
            metrics::record_request("complete", response.status().as_u16(), start);
            response
        }
        Ok(Outcome::Continue(request)) => {
            tracing::debug!(request_id = %request_id, method = %method, path = %path, "Pipeline deferred to host");
            let response = next.run(request).await;
            metrics::record_request("continue", response.status().as_u16(), start);
            response
        }
        Err(e) => {
            tracing::warn!(
                request_id = %request_id,
                method = %method,
                path = %path,
                kind = e.kind(),
                error = %e,
                "Pipeline bridge error"
            );
            let response = e.into_response();
            metrics::record_request("error", response.status().as_u16(), start);
            response
        }
    }
}

fn protocol(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}

fn scheme(request: &Request) -> &'static str {
    let encrypted = request
        .extensions()
        .get::<ConnectionInfo>()
        .is_some_and(|conn| conn.encrypted);
    if encrypted {
        "https"
    } else {
        "http"
    }
}

/// Header name → value; repeated headers are joined with ", ".
fn header_map(headers: &HeaderMap) -> EnvValue {
    let mut map = std::collections::BTreeMap::new();
    for name in headers.keys() {
        let joined = headers
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect::<Vec<_>>()
            .join(", ");
        map.insert(name.as_str().to_string(), EnvValue::String(joined));
    }
    EnvValue::Map(map)
}

/// Bytes pass through, objects are serialized as JSON, anything else is
/// rejected.
fn resolve_body(body: Option<&RequestBody>) -> Result<Bytes, BridgeError> {
    match body.map(|b| &b.0) {
        Some(EnvValue::Bytes(bytes)) => Ok(bytes.clone()),
        Some(value) if value.is_object() => Ok(Bytes::from(value.to_json().to_string())),
        other => Err(BridgeError::InvalidBody {
            body: other.cloned().unwrap_or_default(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineError;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{StatusCode, Uri};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tower::ServiceExt;

    /// Completes with `result` after writing `body`; fails the first
    /// `init_failures` initializations.
    struct TestPipeline {
        init_calls: AtomicUsize,
        init_failures: usize,
        result: EnvValue,
        body: &'static str,
        fail_dispatch: bool,
        seen: Mutex<Option<Environment>>,
    }

    impl TestPipeline {
        fn new(result: bool) -> Self {
            Self {
                init_calls: AtomicUsize::new(0),
                init_failures: 0,
                result: EnvValue::Bool(result),
                body: "from pipeline",
                fail_dispatch: false,
                seen: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl Pipeline for TestPipeline {
        async fn initialize(&self, options: &BridgeOptions) -> Result<AppId, PipelineError> {
            let n = self.init_calls.fetch_add(1, Ordering::SeqCst);
            if n < self.init_failures {
                return Err(PipelineError::Remote { message: "assembly not found".into(), status: None });
            }
            Ok(AppId::new(format!("{}#{}", options.assembly_file(), n)))
        }

        async fn dispatch(&self, env: Environment) -> Result<EnvValue, PipelineError> {
            *self.seen.lock().unwrap() = Some(env.clone());
            env.function(keys::SET_STATUS).unwrap().call(EnvValue::from(201u64)).await.unwrap();
            env.function(keys::SET_HEADERS)
                .unwrap()
                .call(EnvValue::from(json!({ "X-Foo": ["a", "b"] })))
                .await
                .unwrap();
            env.function(keys::WRITE)
                .unwrap()
                .call(EnvValue::Bytes(Bytes::from_static(self.body.as_bytes())))
                .await
                .unwrap();
            if self.fail_dispatch {
                return Err(PipelineError::Remote { message: "handler threw".into(), status: None });
            }
            Ok(self.result.clone())
        }
    }

    fn host_router(bridge: &OwinBridge) -> Router {
        bridge.attach(Router::new().fallback(|| async { (StatusCode::NOT_FOUND, "host fallback") }))
    }

    async fn send(router: Router, request: Request) -> (StatusCode, HeaderMap, Bytes) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, body)
    }

    fn get(uri: &str) -> Request {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_environment_contents() {
        let bridge = OwinBridge::register(json!({ "assemblyFile": "app.dll", "greeting": "hi" }), TestPipeline::new(true))
            .unwrap();

        let mut request = Request::builder()
            .method("POST")
            .uri(Uri::from_static("/orders/7?expand=items&x=1"))
            .version(Version::HTTP_10)
            .header("x-trace", "one")
            .header("x-trace", "two")
            .header("content-type", "text/plain")
            .body(Body::empty())
            .unwrap();
        request.extensions_mut().insert(ConnectionInfo { encrypted: true });
        request.extensions_mut().insert(RequestBody(EnvValue::Bytes(Bytes::from_static(b"payload"))));
        request
            .extensions_mut()
            .insert(PipelineExtensions::new().with("user", "alice").with("greeting", "override"));

        let env = bridge.build_environment(&AppId::new("app-1"), &request).unwrap();

        assert_eq!(env.get(keys::APP_ID), Some(&EnvValue::from("app-1")));
        assert_eq!(env.get(keys::REQUEST_METHOD), Some(&EnvValue::from("POST")));
        assert_eq!(env.get(keys::REQUEST_PATH), Some(&EnvValue::from("/orders/7")));
        assert_eq!(env.get(keys::REQUEST_PATH_BASE), Some(&EnvValue::from("")));
        assert_eq!(env.get(keys::REQUEST_PROTOCOL), Some(&EnvValue::from("HTTP/1.0")));
        assert_eq!(env.get(keys::REQUEST_QUERY_STRING), Some(&EnvValue::from("expand=items&x=1")));
        assert_eq!(env.get(keys::REQUEST_SCHEME), Some(&EnvValue::from("https")));
        assert_eq!(env.get(keys::REQUEST_BODY), Some(&EnvValue::Bytes(Bytes::from_static(b"payload"))));

        let headers = env.get(keys::REQUEST_HEADERS).and_then(EnvValue::as_map).unwrap();
        assert_eq!(headers.get("x-trace"), Some(&EnvValue::from("one, two")));
        assert_eq!(headers.get("content-type"), Some(&EnvValue::from("text/plain")));

        assert_eq!(env.get("node.assemblyFile"), Some(&EnvValue::from("app.dll")));
        assert_eq!(env.get("node.user"), Some(&EnvValue::from("alice")));
        assert_eq!(env.get("node.greeting"), Some(&EnvValue::from("override")));
    }

    #[tokio::test]
    async fn test_defaults_without_query_or_tls() {
        let bridge = OwinBridge::register("app.dll", TestPipeline::new(true)).unwrap();
        let request = collect_body(get("/plain"), DEFAULT_BODY_LIMIT).await.unwrap();

        let env = bridge.build_environment(&AppId::new(1i64), &request).unwrap();
        assert_eq!(env.get(keys::REQUEST_QUERY_STRING), Some(&EnvValue::from("")));
        assert_eq!(env.get(keys::REQUEST_SCHEME), Some(&EnvValue::from("http")));
        assert_eq!(env.get(keys::REQUEST_PROTOCOL), Some(&EnvValue::from("HTTP/1.1")));
        assert_eq!(env.get(keys::REQUEST_BODY), Some(&EnvValue::Bytes(Bytes::new())));
    }

    #[tokio::test]
    async fn test_object_body_is_serialized() {
        let bridge = OwinBridge::register("app.dll", TestPipeline::new(true)).unwrap();
        let mut request = get("/");
        request.extensions_mut().insert(RequestBody(EnvValue::from(json!({ "name": "widget" }))));

        let env = bridge.build_environment(&AppId::new(1i64), &request).unwrap();
        let body = env.get(keys::REQUEST_BODY).and_then(EnvValue::as_bytes).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(body).unwrap();
        assert_eq!(parsed, json!({ "name": "widget" }));
    }

    #[tokio::test]
    async fn test_invalid_body_is_rejected() {
        let bridge = OwinBridge::register("app.dll", TestPipeline::new(true)).unwrap();
        let mut request = get("/");
        request.extensions_mut().insert(RequestBody(EnvValue::from(42i64)));

        let (status, _, body) = send(host_router(&bridge), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let payload: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload["status"], 400);
        assert_eq!(payload["body"], 42);
    }

    #[tokio::test]
    async fn test_truthy_result_completes_response() {
        let bridge = OwinBridge::register("app.dll", TestPipeline::new(true)).unwrap();

        let (status, headers, body) = send(host_router(&bridge), get("/hello")).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(headers.get("x-foo").unwrap(), "a,b");
        assert_eq!(&body[..], b"from pipeline");
    }

    #[tokio::test]
    async fn test_falsy_result_continues_host_chain() {
        let bridge = OwinBridge::register("app.dll", TestPipeline::new(false)).unwrap();

        let (status, headers, body) = send(host_router(&bridge), get("/hello")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(headers.get("x-foo").is_none());
        assert_eq!(&body[..], b"host fallback");
    }

    #[tokio::test]
    async fn test_host_sees_buffered_body_after_continue() {
        let bridge = OwinBridge::register("app.dll", TestPipeline::new(false)).unwrap();
        let router = bridge.attach(Router::new().fallback(|body: String| async move { body }));

        let request = Request::builder()
            .method("POST")
            .uri("/echo")
            .header("content-length", "5")
            .body(Body::from("hello"))
            .unwrap();
        let (status, _, body) = send(router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"hello");
    }

    #[tokio::test]
    async fn test_initializes_once() {
        let pipeline = Arc::new(TestPipeline::new(true));
        let bridge = OwinBridge::new(BridgeOptions::new("app.dll"), pipeline.clone());

        for _ in 0..3 {
            let (status, _, _) = send(host_router(&bridge), get("/")).await;
            assert_eq!(status, StatusCode::CREATED);
        }
        assert_eq!(pipeline.init_calls.load(Ordering::SeqCst), 1);
        assert_eq!(bridge.app_id(), Some(AppId::new("app.dll#0")));
    }

    #[tokio::test]
    async fn test_failed_initialization_is_retried() {
        let pipeline = Arc::new(TestPipeline { init_failures: 1, ..TestPipeline::new(true) });
        let bridge = OwinBridge::new(BridgeOptions::new("app.dll"), pipeline.clone());

        let (status, _, body) = send(host_router(&bridge), get("/")).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(String::from_utf8_lossy(&body).contains("assembly not found"));
        assert!(bridge.app_id().is_none());

        let (status, _, _) = send(host_router(&bridge), get("/")).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(pipeline.init_calls.load(Ordering::SeqCst), 2);
        assert_eq!(bridge.app_id(), Some(AppId::new("app.dll#1")));
    }

    #[tokio::test]
    async fn test_dispatch_error_discards_partial_response() {
        let pipeline = TestPipeline { fail_dispatch: true, ..TestPipeline::new(true) };
        let bridge = OwinBridge::register("app.dll", pipeline).unwrap();

        let (status, headers, body) = send(host_router(&bridge), get("/")).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(headers.get("x-foo").is_none());
        assert!(String::from_utf8_lossy(&body).contains("handler threw"));
    }

    #[tokio::test]
    async fn test_pipeline_sees_callbacks_and_options() {
        let pipeline = Arc::new(TestPipeline::new(true));
        let bridge = OwinBridge::new(BridgeOptions::new("app.dll").with("region", "eu"), pipeline.clone());

        send(host_router(&bridge), get("/")).await;

        let env = pipeline.seen.lock().unwrap().take().unwrap();
        for key in [keys::SET_STATUS, keys::SET_HEADERS, keys::REMOVE_HEADER, keys::REMOVE_ALL_HEADERS, keys::WRITE] {
            assert!(env.function(key).is_some(), "missing {key}");
        }
        assert_eq!(env.get("node.region"), Some(&EnvValue::from("eu")));
    }

    #[test]
    fn test_register_rejects_bad_options() {
        assert!(matches!(
            OwinBridge::register(json!(7), TestPipeline::new(true)),
            Err(ConfigError::UnsupportedOptions { .. })
        ));
        assert!(matches!(
            OwinBridge::register(json!({}), TestPipeline::new(true)),
            Err(ConfigError::MissingAssemblyFile)
        ));
    }
}
