//! Shared utilities for integration tests.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::net::TcpListener;

use owin_bridge::bridge::{BridgeOptions, EnvValue, Environment};
use owin_bridge::config::BridgeConfig;
use owin_bridge::pipeline::{AppId, Pipeline, PipelineError};
use owin_bridge::{HttpServer, Shutdown};

type Handler = dyn Fn(Environment) -> BoxFuture<'static, Result<EnvValue, PipelineError>> + Send + Sync;

/// Pipeline whose dispatch behavior is supplied by the test.
pub struct ScriptedPipeline {
    pub init_calls: AtomicUsize,
    pub dispatch_calls: AtomicUsize,
    pub last_options: Mutex<Option<BridgeOptions>>,
    handler: Box<Handler>,
}

impl ScriptedPipeline {
    #[allow(dead_code)]
    pub fn new<F, Fut>(handler: F) -> Arc<Self>
    where
        F: Fn(Environment) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<EnvValue, PipelineError>> + Send + 'static,
    {
        Arc::new(Self {
            init_calls: AtomicUsize::new(0),
            dispatch_calls: AtomicUsize::new(0),
            last_options: Mutex::new(None),
            handler: Box::new(move |env: Environment| handler(env).boxed()),
        })
    }

    /// Pipeline that always declines.
    #[allow(dead_code)]
    pub fn declining() -> Arc<Self> {
        Self::new(|_| async { Ok(EnvValue::Bool(false)) })
    }
}

#[async_trait]
impl Pipeline for ScriptedPipeline {
    async fn initialize(&self, options: &BridgeOptions) -> Result<AppId, PipelineError> {
        let n = self.init_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_options.lock().unwrap() = Some(options.clone());
        Ok(AppId::new(format!("app-{n}")))
    }

    async fn dispatch(&self, env: Environment) -> Result<EnvValue, PipelineError> {
        self.dispatch_calls.fetch_add(1, Ordering::SeqCst);
        (self.handler)(env).await
    }
}

/// Config pointing at `assembly` with everything else defaulted.
pub fn config_for(assembly: &str) -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.pipeline.options = serde_json::Value::String(assembly.to_string());
    config
}

/// Start a server on an ephemeral port; returns its address and the
/// shutdown handle.
#[allow(dead_code)]
pub async fn start_server(server: HttpServer) -> (SocketAddr, Shutdown) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Shutdown::new();

    let run_shutdown = shutdown.clone();
    tokio::spawn(async move {
        server.run(listener, run_shutdown).await.unwrap();
    });

    (addr, shutdown)
}
