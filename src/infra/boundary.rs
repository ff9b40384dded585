//! # Isolation Boundary Module / 隔离边界模块
//!
//! Creates the isolation mechanism behind an environment and the raw frame
//! transport across it. An in-process boundary serves requests on a separate
//! task; a process boundary starts `plan-runner agent` with the environment's
//! working directory and configuration and speaks JSON lines over stdio; a
//! sandbox boundary does the same with a cleared environment.
//!
//! 创建环境背后的隔离机制以及跨越它的原始帧传输。进程内边界在独立的任务上处理请求；
//! 进程边界使用环境的工作目录和配置启动 `plan-runner agent`，并通过 stdio 以 JSON 行通信；
//! 沙箱边界以清空的环境变量执行同样的操作。

use futures::FutureExt;
use futures::future::BoxFuture;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;
use tracing::debug;

use crate::core::config::{HostConfiguration, IsolationKind, agent_executable};
use crate::core::error::HostError;
use crate::core::protocol::{Frame, HostEvent};
use crate::infra::agent::{
    APPLICATION_BASE_ENV, CONFIG_ENV, CommandService, HostService, ServiceEnvironment, serve,
};
use crate::infra::fs::{copy_dir_all, create_scratch_dir};

/// Everything a launcher needs to create a boundary.
#[derive(Debug, Clone)]
pub struct BoundarySpec {
    /// Names scratch directories; usually the master's identifier.
    pub label: String,
    pub isolation: IsolationKind,
    pub working_directory: PathBuf,
    pub configuration_path: PathBuf,
    pub configuration: HostConfiguration,
    pub application_base: PathBuf,
}

/// Raw frames crossing a boundary. A malformed frame arrives as `Err`; the
/// incoming side closes when the host goes away.
pub struct Transport {
    pub outgoing: mpsc::UnboundedSender<Frame>,
    pub incoming: mpsc::UnboundedReceiver<Result<Frame, String>>,
}

pub struct LaunchedBoundary {
    pub boundary: Box<dyn Boundary>,
    pub transport: Transport,
}

/// A running isolation boundary.
/// 正在运行的隔离边界。
pub trait Boundary: Send {
    /// Waits up to `grace` for the host to stop after the channel closed,
    /// then forces it down. Scratch copies are removed either way.
    fn shutdown(self: Box<Self>, grace: Duration) -> BoxFuture<'static, io::Result<()>>;
}

/// Creates boundaries.
/// 创建隔离边界。
pub trait BoundaryLauncher: Send + Sync {
    fn launch<'a>(
        &'a self,
        spec: &'a BoundarySpec,
    ) -> BoxFuture<'a, Result<LaunchedBoundary, HostError>>;
}

/// The program started for process and sandbox boundaries.
///
/// The default is the running executable with the `agent` subcommand, which
/// only works when that executable is `plan-runner` itself. Programs that
/// embed the library, test binaries included, must point at a real agent
/// with [`AgentCommand::new`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl AgentCommand {
    /// Runs `program agent`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec!["agent".to_string()],
        }
    }
}

impl Default for AgentCommand {
    fn default() -> Self {
        Self {
            program: agent_executable().to_path_buf(),
            args: vec!["agent".to_string()],
        }
    }
}

/// Launches in-process boundaries around a [`HostService`] and process
/// boundaries around an agent command.
pub struct DefaultLauncher {
    agent: AgentCommand,
    service: Arc<dyn HostService>,
}

impl Default for DefaultLauncher {
    fn default() -> Self {
        Self {
            agent: AgentCommand::default(),
            service: Arc::new(CommandService),
        }
    }
}

impl DefaultLauncher {
    pub fn new(agent: AgentCommand, service: Arc<dyn HostService>) -> Self {
        Self { agent, service }
    }

    pub fn with_agent(mut self, agent: AgentCommand) -> Self {
        self.agent = agent;
        self
    }

    pub fn with_service(mut self, service: Arc<dyn HostService>) -> Self {
        self.service = service;
        self
    }

    fn launch_in_process(&self, spec: &BoundarySpec, shadow: Option<TempDir>) -> LaunchedBoundary {
        let application_base = shadow
            .as_ref()
            .map(|dir| dir.path().to_path_buf())
            .unwrap_or_else(|| spec.application_base.clone());
        let environment = ServiceEnvironment {
            working_directory: spec.working_directory.clone(),
            configuration_path: Some(spec.configuration_path.clone()),
            application_base,
        };

        let (to_host_tx, to_host_rx) = mpsc::unbounded_channel();
        let (from_host_tx, mut from_host_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        let serving = tokio::spawn(serve(
            Arc::clone(&self.service),
            environment,
            to_host_rx,
            from_host_tx,
        ));
        let forwarder = tokio::spawn(async move {
            while let Some(frame) = from_host_rx.recv().await {
                if incoming_tx.send(Ok(frame)).is_err() {
                    break;
                }
            }
        });

        LaunchedBoundary {
            boundary: Box::new(InProcessBoundary {
                serving,
                forwarder,
                shadow,
            }),
            transport: Transport {
                outgoing: to_host_tx,
                incoming: incoming_rx,
            },
        }
    }

    fn launch_process(
        &self,
        spec: &BoundarySpec,
        shadow: Option<TempDir>,
    ) -> Result<LaunchedBoundary, HostError> {
        // With a shadow copy the agent runs from the copy when it lives
        // inside the application base.
        let (program, application_base) = match &shadow {
            Some(dir) => {
                let program = self
                    .agent
                    .program
                    .strip_prefix(&spec.application_base)
                    .map(|relative| dir.path().join(relative))
                    .unwrap_or_else(|_| self.agent.program.clone());
                (program, dir.path().to_path_buf())
            }
            None => (self.agent.program.clone(), spec.application_base.clone()),
        };

        let mut cmd = Command::new(&program);
        cmd.args(&self.agent.args);
        if spec.isolation == IsolationKind::Sandbox {
            cmd.env_clear();
            if let Some(path) = std::env::var_os("PATH") {
                cmd.env("PATH", path);
            }
        }
        cmd.current_dir(&spec.working_directory)
            .env(CONFIG_ENV, &spec.configuration_path)
            .env(APPLICATION_BASE_ENV, &application_base)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| HostError::Boundary {
            message: format!("failed to start agent '{}'", program.display()),
            source: Some(e),
        })?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(HostError::boundary("agent stdio could not be captured"));
        };
        debug!(pid = ?child.id(), program = %program.display(), "agent started");

        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Frame>();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(frame) = outgoing_rx.recv().await {
                let Ok(line) = frame.to_line() else { continue };
                if stdin.write_all(line.as_bytes()).await.is_err() || stdin.flush().await.is_err() {
                    break;
                }
            }
            // Dropping stdin signals end of input to the agent.
        });

        let frames_tx = incoming_tx.clone();
        let reader = tokio::spawn(async move {
            let mut lines = LinesStream::new(BufReader::new(stdout).lines());
            while let Some(Ok(line)) = lines.next().await {
                if line.trim().is_empty() {
                    continue;
                }
                let frame = Frame::from_line(&line).map_err(|e| format!("malformed frame: {e}"));
                if frames_tx.send(frame).is_err() {
                    break;
                }
            }
        });

        let stderr_reader = tokio::spawn(async move {
            let mut lines = LinesStream::new(BufReader::new(stderr).lines());
            while let Some(Ok(text)) = lines.next().await {
                let event = HostEvent::Log {
                    channel: "stderr".to_string(),
                    text,
                };
                if incoming_tx.send(Ok(Frame::Event { event })).is_err() {
                    break;
                }
            }
        });

        Ok(LaunchedBoundary {
            boundary: Box::new(ProcessBoundary {
                child,
                tasks: vec![writer, reader, stderr_reader],
                shadow,
            }),
            transport: Transport {
                outgoing: outgoing_tx,
                incoming: incoming_rx,
            },
        })
    }
}

impl BoundaryLauncher for DefaultLauncher {
    fn launch<'a>(
        &'a self,
        spec: &'a BoundarySpec,
    ) -> BoxFuture<'a, Result<LaunchedBoundary, HostError>> {
        async move {
            let shadow = if spec.configuration.shadow_copy {
                Some(shadow_copy(&spec.label, &spec.application_base)?)
            } else {
                None
            };

            match spec.isolation {
                IsolationKind::InProcess => Ok(self.launch_in_process(spec, shadow)),
                IsolationKind::Process | IsolationKind::Sandbox => self.launch_process(spec, shadow),
            }
        }
        .boxed()
    }
}

/// Copies the application base into a scratch directory.
fn shadow_copy(label: &str, application_base: &Path) -> Result<TempDir, HostError> {
    let dir = create_scratch_dir(&format!("{label}_shadow")).map_err(|e| HostError::Boundary {
        message: "failed to create the shadow copy directory".to_string(),
        source: Some(e),
    })?;
    copy_dir_all(application_base, dir.path()).map_err(|e| HostError::Boundary {
        message: format!(
            "failed to shadow copy '{}'",
            application_base.display()
        ),
        source: Some(e),
    })?;
    Ok(dir)
}

fn remove_shadow(shadow: Option<TempDir>) -> io::Result<()> {
    match shadow {
        Some(dir) => dir.close(),
        None => Ok(()),
    }
}

struct InProcessBoundary {
    serving: JoinHandle<()>,
    forwarder: JoinHandle<()>,
    shadow: Option<TempDir>,
}

impl Boundary for InProcessBoundary {
    fn shutdown(self: Box<Self>, grace: Duration) -> BoxFuture<'static, io::Result<()>> {
        let InProcessBoundary {
            mut serving,
            forwarder,
            shadow,
        } = *self;

        async move {
            let stopped = match tokio::time::timeout(grace, &mut serving).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(io::Error::other(format!("in-process host failed: {e}"))),
                Err(_) => {
                    serving.abort();
                    Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "in-process host did not stop within the grace period",
                    ))
                }
            };
            forwarder.abort();
            let removed = remove_shadow(shadow);
            stopped.and(removed)
        }
        .boxed()
    }
}

struct ProcessBoundary {
    child: Child,
    tasks: Vec<JoinHandle<()>>,
    shadow: Option<TempDir>,
}

impl Boundary for ProcessBoundary {
    fn shutdown(self: Box<Self>, grace: Duration) -> BoxFuture<'static, io::Result<()>> {
        let ProcessBoundary {
            mut child,
            tasks,
            shadow,
        } = *self;

        async move {
            let stopped = match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(%status, "agent exited");
                    Ok(())
                }
                Ok(Err(e)) => Err(e),
                Err(_) => {
                    let killed = child.kill().await;
                    killed.and(Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "agent did not exit within the grace period and was killed",
                    )))
                }
            };
            for task in tasks {
                task.abort();
            }
            let removed = remove_shadow(shadow);
            stopped.and(removed)
        }
        .boxed()
    }
}
