//! Subprocess implementation of the pipeline port.
//!
//! # Responsibilities
//! - Launch the foreign runtime host (`runner` + native bridge assembly)
//! - Multiplex concurrent calls over its stdin/stdout by call id
//! - Serve callback frames by invoking host functions from the payload
//!
//! # Design Decisions
//! - One reader task routes inbound frames to the pending call; one writer
//!   task serializes outbound frames
//! - Callbacks for a call are served one at a time, in arrival order
//! - No timeouts here; a hung runtime hangs the call
//! - When the runtime's output closes, every pending call fails with `Closed`
//! - An undecodable frame that still names a call fails that call with
//!   `Protocol`

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::bridge::environment::{EnvValue, Environment};
use crate::bridge::options::BridgeOptions;
use crate::config::PipelineConfig;
use crate::pipeline::wire::{self, FunctionTable, HostFrame, RuntimeFrame};
use crate::pipeline::{AppId, Pipeline, PipelineError};

/// Environment variable overriding the native bridge assembly location.
pub const NATIVE_ASSEMBLY_ENV: &str = "CONNECT_OWIN_NATIVE";

pub const DEFAULT_NATIVE_ASSEMBLY: &str = "clr/Connect.Owin.dll";
pub const DEFAULT_TYPE_NAME: &str = "Connect.Owin.OwinMiddleware";
pub const DEFAULT_RUNNER: &str = "dotnet";

const INITIALIZE_METHOD: &str = "Initialize";
const HANDLE_METHOD: &str = "Handle";

/// How to launch the pipeline host.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessConfig {
    pub runner: String,
    pub runner_args: Vec<String>,
    pub native_assembly: PathBuf,
    pub type_name: String,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            runner: DEFAULT_RUNNER.to_string(),
            runner_args: Vec::new(),
            native_assembly: native_assembly_path(None),
            type_name: DEFAULT_TYPE_NAME.to_string(),
        }
    }
}

impl ProcessConfig {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            runner: config.runner.clone(),
            runner_args: config.runner_args.clone(),
            native_assembly: native_assembly_path(config.native_assembly.as_deref()),
            type_name: config.type_name.clone(),
        }
    }
}

/// Resolve the native assembly: explicit setting, then
/// `CONNECT_OWIN_NATIVE`, then the bundled default.
pub fn native_assembly_path(configured: Option<&str>) -> PathBuf {
    configured
        .map(PathBuf::from)
        .or_else(|| std::env::var_os(NATIVE_ASSEMBLY_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_NATIVE_ASSEMBLY))
}

/// A frame for a pending call, or the reason its frame could not be decoded.
type Inbound = Result<RuntimeFrame, PipelineError>;

/// Calls waiting for frames from the runtime.
#[derive(Default)]
struct PendingCalls {
    calls: Mutex<HashMap<u64, mpsc::UnboundedSender<Inbound>>>,
    closed: AtomicBool,
}

impl PendingCalls {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, mpsc::UnboundedSender<Inbound>>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(
        self: &Arc<Self>,
        id: u64,
        tx: mpsc::UnboundedSender<Inbound>,
    ) -> Result<PendingGuard, PipelineError> {
        self.lock().insert(id, tx);
        let guard = PendingGuard { pending: self.clone(), id };
        if self.closed.load(Ordering::SeqCst) {
            return Err(PipelineError::Closed);
        }
        Ok(guard)
    }

    fn route(&self, id: u64, inbound: Inbound) {
        match self.lock().get(&id) {
            Some(tx) => {
                let _ = tx.send(inbound);
            }
            None => tracing::debug!(call_id = id, "Dropping frame for unknown call"),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.lock().clear();
    }
}

/// Unregisters a call when it finishes or is cancelled.
struct PendingGuard {
    pending: Arc<PendingCalls>,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

/// A protocol session over any reader/writer pair.
pub struct PipelineConnection {
    type_name: String,
    next_id: AtomicU64,
    outbound: mpsc::UnboundedSender<HostFrame>,
    pending: Arc<PendingCalls>,
}

impl PipelineConnection {
    /// Start the reader and writer tasks. Must be called within a Tokio runtime.
    pub fn new<R, W>(reader: R, writer: W, type_name: impl Into<String>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(PendingCalls::default());

        tokio::spawn(write_loop(writer, rx, pending.clone()));
        tokio::spawn(read_loop(reader, pending.clone()));

        Self {
            type_name: type_name.into(),
            next_id: AtomicU64::new(1),
            outbound,
            pending,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.pending.closed.load(Ordering::SeqCst)
    }

    fn send(&self, frame: HostFrame) -> Result<(), PipelineError> {
        self.outbound.send(frame).map_err(|_| PipelineError::Closed)
    }

    async fn call(&self, method_name: &'static str, payload: EnvValue) -> Result<EnvValue, PipelineError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut functions = FunctionTable::new();
        let payload = functions.encode(&payload);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _guard = self.pending.register(id, tx)?;

        let type_name = self.type_name.clone();
        let method_name = method_name.to_string();
        let frame = if method_name == INITIALIZE_METHOD {
            HostFrame::Initialize { id, type_name, method_name, payload }
        } else {
            HostFrame::Handle { id, type_name, method_name, payload }
        };
        self.send(frame)?;
        tracing::trace!(call_id = id, functions = functions.len(), "Pipeline call sent");

        while let Some(frame) = rx.recv().await {
            match frame? {
                RuntimeFrame::Callback { seq, function, arg, .. } => {
                    let reply = match functions.get(function).cloned() {
                        Some(f) => match f.call(wire::decode(arg)).await {
                            Ok(result) => HostFrame::CallbackResult { id, seq, result: functions.encode(&result) },
                            Err(e) => HostFrame::CallbackError { id, seq, message: e.to_string() },
                        },
                        None => {
                            tracing::warn!(call_id = id, function, "Callback for unknown function");
                            HostFrame::CallbackError { id, seq, message: format!("Unknown function {function}") }
                        }
                    };
                    self.send(reply)?;
                }
                RuntimeFrame::Completed { value, .. } => return Ok(wire::decode(value)),
                RuntimeFrame::Failed { message, status, .. } => {
                    return Err(PipelineError::Remote { message, status });
                }
            }
        }

        Err(PipelineError::Closed)
    }
}

#[async_trait]
impl Pipeline for PipelineConnection {
    async fn initialize(&self, options: &BridgeOptions) -> Result<AppId, PipelineError> {
        self.call(INITIALIZE_METHOD, options.to_value()).await.map(AppId)
    }

    async fn dispatch(&self, env: Environment) -> Result<EnvValue, PipelineError> {
        self.call(HANDLE_METHOD, env.into_value()).await
    }
}

async fn read_loop<R>(reader: R, pending: Arc<PendingCalls>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<RuntimeFrame>(&line) {
                    Ok(frame) => pending.route(frame.id(), Ok(frame)),
                    Err(e) => match frame_id(&line) {
                        Some(id) => {
                            tracing::warn!(call_id = id, error = %e, "Malformed frame from pipeline host");
                            pending.route(id, Err(PipelineError::Protocol(format!("malformed frame: {e}"))));
                        }
                        None => tracing::warn!(error = %e, "Ignoring malformed frame from pipeline host"),
                    },
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read from pipeline host");
                break;
            }
        }
    }
    pending.close();
    tracing::warn!("Pipeline host output closed");
}

/// Call id of a frame that did not match any known shape.
fn frame_id(line: &str) -> Option<u64> {
    serde_json::from_str::<serde_json::Value>(line).ok()?.get("id")?.as_u64()
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<HostFrame>, pending: Arc<PendingCalls>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        let line = match wire::to_line(&frame) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode frame");
                continue;
            }
        };
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::error!(error = %e, "Failed to write to pipeline host");
            break;
        }
        if let Err(e) = writer.flush().await {
            tracing::error!(error = %e, "Failed to flush pipeline host input");
            break;
        }
    }
    pending.close();
}

/// Pipeline backed by a child process.
pub struct ProcessPipeline {
    connection: PipelineConnection,
    child: Mutex<Child>,
}

impl ProcessPipeline {
    /// Launch `runner [runner_args..] native_assembly` with piped stdio.
    pub fn spawn(config: &ProcessConfig) -> Result<Self, PipelineError> {
        let mut child = Command::new(&config.runner)
            .args(&config.runner_args)
            .arg(&config.native_assembly)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PipelineError::Spawn(format!("{}: {}", config.runner, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PipelineError::Spawn("stdin was not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PipelineError::Spawn("stdout was not captured".into()))?;

        tracing::info!(
            pid = ?child.id(),
            runner = %config.runner,
            native_assembly = %config.native_assembly.display(),
            type_name = %config.type_name,
            "Pipeline host started"
        );

        Ok(Self {
            connection: PipelineConnection::new(stdout, stdin, config.type_name.clone()),
            child: Mutex::new(child),
        })
    }

    /// OS process id, if the child is still running.
    pub fn id(&self) -> Option<u32> {
        self.child.lock().unwrap_or_else(PoisonError::into_inner).id()
    }

    /// Ask the child to exit. Pending calls fail with `Closed` once its
    /// output closes.
    pub fn kill(&self) -> Result<(), PipelineError> {
        self.child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .start_kill()
            .map_err(PipelineError::from)
    }
}

#[async_trait]
impl Pipeline for ProcessPipeline {
    async fn initialize(&self, options: &BridgeOptions) -> Result<AppId, PipelineError> {
        self.connection.initialize(options).await
    }

    async fn dispatch(&self, env: Environment) -> Result<EnvValue, PipelineError> {
        self.connection.dispatch(env).await
    }
}
