//! # Host Agent Module / 宿主代理模块
//!
//! The boundary side of the control channel. [`serve`] answers the handshake,
//! runs each request against a [`HostService`], forwards cancellation, and
//! turns anything a request raises (including panics) into a failed response,
//! so nothing escapes the boundary in any other form.
//!
//! The same loop runs as a task for in-process boundaries and over stdio in
//! the `plan-runner agent` child process.
//!
//! 控制通道的边界端。[`serve`] 响应握手，针对 [`HostService`] 运行每个请求，
//! 转发取消，并将请求产生的任何错误（包括 panic）转换为失败响应，
//! 因此不会有任何东西以其他形式逃出边界。
//!
//! 同一个循环在进程内边界中作为任务运行，在 `plan-runner agent` 子进程中通过 stdio 运行。

use anyhow::{Context, Result};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::config::HostConfiguration;
use crate::core::protocol::{Frame, HANDSHAKE_OP, Hello, HostEvent, PROTOCOL_VERSION, Request, Response};
use crate::infra::command::{parse_command, spawn_and_capture};

/// Environment variable naming the temporary configuration file of a process host.
pub const CONFIG_ENV: &str = "PLAN_RUNNER_HOST_CONFIG";
/// Environment variable naming the application base directory of a process host.
pub const APPLICATION_BASE_ENV: &str = "PLAN_RUNNER_APPLICATION_BASE";

/// Why a service could not answer a request.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("operation cancelled")]
    Cancelled,
    #[error("unknown operation '{0}'")]
    UnknownOperation(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("{0}")]
    Failed(String),
}

/// What a service sees of the environment it runs in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceEnvironment {
    pub working_directory: PathBuf,
    pub configuration_path: Option<PathBuf>,
    pub application_base: PathBuf,
}

impl ServiceEnvironment {
    /// The environment of an agent process, as set up by its parent.
    pub fn from_process() -> Result<Self> {
        Ok(Self {
            working_directory: std::env::current_dir()
                .context("Failed to read the agent's working directory")?,
            configuration_path: std::env::var_os(CONFIG_ENV).map(PathBuf::from),
            application_base: std::env::var_os(APPLICATION_BASE_ENV)
                .map(PathBuf::from)
                .unwrap_or_default(),
        })
    }
}

/// Sends host events back to the coordinator.
#[derive(Clone)]
pub struct EventEmitter(Arc<dyn Fn(HostEvent) + Send + Sync>);

impl EventEmitter {
    pub fn new(emit: impl Fn(HostEvent) + Send + Sync + 'static) -> Self {
        Self(Arc::new(emit))
    }

    pub fn emit(&self, event: HostEvent) {
        (self.0)(event)
    }

    pub fn task_changed(&self, name: impl Into<String>) {
        self.emit(HostEvent::TaskChanged { name: name.into() });
    }

    pub fn progress(&self, completed: u64, total: u64) {
        self.emit(HostEvent::Progress { completed, total });
    }

    pub fn log(&self, channel: impl Into<String>, text: impl Into<String>) {
        self.emit(HostEvent::Log {
            channel: channel.into(),
            text: text.into(),
        });
    }
}

/// Per-request context handed to a service.
pub struct ServiceContext {
    pub environment: ServiceEnvironment,
    pub events: EventEmitter,
    /// Cancelled when the coordinator cancels this request or shuts the host down.
    pub cancel: CancellationToken,
}

/// Operations a host exposes across the boundary.
/// 宿主跨边界暴露的操作。
pub trait HostService: Send + Sync {
    fn handle<'a>(
        &'a self,
        op: &'a str,
        payload: Value,
        ctx: ServiceContext,
    ) -> BoxFuture<'a, Result<Value, ServiceError>>;
}

/// Serves requests until a shutdown frame arrives or the incoming side closes.
/// Requests run concurrently; in-flight requests are cancelled on shutdown and
/// awaited before this returns.
///
/// 处理请求，直到收到关闭帧或输入端关闭。请求并发运行；
/// 关闭时会取消正在进行的请求，并在返回前等待它们完成。
pub async fn serve(
    service: Arc<dyn HostService>,
    environment: ServiceEnvironment,
    mut incoming: mpsc::UnboundedReceiver<Frame>,
    outgoing: mpsc::UnboundedSender<Frame>,
) {
    let mut running: HashMap<u64, CancellationToken> = HashMap::new();
    let mut tasks: JoinSet<u64> = JoinSet::new();
    let shutdown = CancellationToken::new();

    loop {
        tokio::select! {
            frame = incoming.recv() => match frame {
                None | Some(Frame::Shutdown) => break,
                Some(Frame::Request(request)) if request.op == HANDSHAKE_OP => {
                    let hello = Hello { version: PROTOCOL_VERSION, pid: std::process::id() };
                    let payload = serde_json::to_value(hello).unwrap_or(Value::Null);
                    let _ = outgoing.send(Frame::Response(Response::ok(request.id, payload)));
                }
                Some(Frame::Request(request)) => {
                    let token = shutdown.child_token();
                    running.insert(request.id, token.clone());
                    let ctx = ServiceContext {
                        environment: environment.clone(),
                        events: frame_emitter(outgoing.clone()),
                        cancel: token,
                    };
                    tasks.spawn(answer(Arc::clone(&service), request, ctx, outgoing.clone()));
                }
                Some(Frame::Cancel { id }) => {
                    if let Some(token) = running.get(&id) {
                        debug!(id, "request cancelled by coordinator");
                        token.cancel();
                    }
                }
                Some(other) => debug!(frame = ?other, "ignoring unexpected frame"),
            },
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Ok(id) = joined {
                    running.remove(&id);
                }
            }
        }
    }

    shutdown.cancel();
    while tasks.join_next().await.is_some() {}
}

fn frame_emitter(outgoing: mpsc::UnboundedSender<Frame>) -> EventEmitter {
    EventEmitter::new(move |event| {
        let _ = outgoing.send(Frame::Event { event });
    })
}

async fn answer(
    service: Arc<dyn HostService>,
    request: Request,
    ctx: ServiceContext,
    outgoing: mpsc::UnboundedSender<Frame>,
) -> u64 {
    let id = request.id;
    let handled = AssertUnwindSafe(service.handle(&request.op, request.payload, ctx))
        .catch_unwind()
        .await;

    let response = match handled {
        Ok(Ok(payload)) => Response::ok(id, payload),
        Ok(Err(ServiceError::Cancelled)) => Response::cancelled(id),
        Ok(Err(err)) => Response::failed(id, err.to_string()),
        Err(_) => Response::failed(id, format!("operation '{}' panicked", request.op)),
    };
    let _ = outgoing.send(Frame::Response(response));
    id
}

#[derive(Debug, Deserialize)]
struct ExecPayload {
    command: String,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

/// The built-in service: `ping`, `describe` and `exec`.
/// 内置服务：`ping`、`describe` 和 `exec`。
#[derive(Debug, Clone, Default)]
pub struct CommandService;

impl HostService for CommandService {
    fn handle<'a>(
        &'a self,
        op: &'a str,
        payload: Value,
        ctx: ServiceContext,
    ) -> BoxFuture<'a, Result<Value, ServiceError>> {
        async move {
            match op {
                "ping" => Ok(json!({ "pong": true })),
                "describe" => Ok(describe(&ctx.environment)),
                "exec" => {
                    let payload: ExecPayload = serde_json::from_value(payload)
                        .map_err(|e| ServiceError::InvalidPayload(e.to_string()))?;
                    exec(payload, ctx).await
                }
                other => Err(ServiceError::UnknownOperation(other.to_string())),
            }
        }
        .boxed()
    }
}

fn describe(environment: &ServiceEnvironment) -> Value {
    let configuration = environment
        .configuration_path
        .as_deref()
        .and_then(|path| HostConfiguration::load(path).ok());

    json!({
        "pid": std::process::id(),
        "working_directory": environment.working_directory,
        "configuration_path": environment.configuration_path,
        "application_base": environment.application_base,
        "configuration": configuration,
    })
}

async fn exec(payload: ExecPayload, ctx: ServiceContext) -> Result<Value, ServiceError> {
    let (program, args) =
        parse_command(&payload.command).map_err(|e| ServiceError::InvalidPayload(e.to_string()))?;

    let mut cmd = Command::new(&program);
    cmd.args(&args)
        .current_dir(&ctx.environment.working_directory)
        .kill_on_drop(true);

    let events = ctx.events.clone();
    events.log("command", format!("$ {}", payload.command));
    let run = spawn_and_capture(cmd, move |line| events.log("output", line));

    // Dropping the capture future kills the child.
    let (status, output) = match payload.timeout_secs {
        Some(secs) => tokio::select! {
            finished = tokio::time::timeout(std::time::Duration::from_secs(secs), run) => match finished {
                Ok(finished) => finished,
                Err(_) => {
                    return Ok(json!({
                        "success": false,
                        "code": null,
                        "timed_out": true,
                    }));
                }
            },
            _ = ctx.cancel.cancelled() => return Err(ServiceError::Cancelled),
        },
        None => tokio::select! {
            finished = run => finished,
            _ = ctx.cancel.cancelled() => return Err(ServiceError::Cancelled),
        },
    };

    let status = status.map_err(|e| ServiceError::Failed(format!("failed to run '{program}': {e}")))?;
    Ok(json!({
        "success": status.success(),
        "code": status.code(),
        "output": output,
    }))
}

/// Entry point of the agent process: serves `service` over stdin/stdout,
/// one JSON frame per line.
///
/// 代理进程的入口：通过 stdin/stdout 提供 `service`，每行一个 JSON 帧。
pub async fn run_stdio(service: Arc<dyn HostService>) -> Result<()> {
    let environment = ServiceEnvironment::from_process()?;
    let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Frame>();

    let reader = tokio::spawn(async move {
        let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
        while let Some(line) = lines.next().await {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "failed to read from coordinator");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match Frame::from_line(&line) {
                Ok(frame) => {
                    if incoming_tx.send(frame).is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "dropping malformed frame"),
            }
        }
    });

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(frame) = outgoing_rx.recv().await {
            let line = match frame.to_line() {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "failed to encode frame");
                    continue;
                }
            };
            if stdout.write_all(line.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
                break;
            }
        }
    });

    serve(service, environment, incoming_rx, outgoing_tx).await;
    reader.abort();
    writer.await.context("Agent writer task failed")?;
    Ok(())
}
