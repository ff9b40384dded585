//! # Isolated Host Module / 隔离宿主模块
//!
//! Provisions isolated environments and tears them down. Acquisition runs
//! four reversible steps (working directory, temporary configuration,
//! boundary, control channel with handshake); any failure unwinds the steps
//! already completed, in reverse order, before the error is returned.
//! Release is idempotent and never fails: each teardown problem becomes a
//! [`TeardownWarning`].
//!
//! The coordinator's process-wide current directory is never changed, so
//! environments acquired concurrently cannot observe each other.
//!
//! 提供并销毁隔离环境。获取过程包含四个可逆步骤（工作目录、临时配置、
//! 隔离边界、带握手的控制通道）；任何失败都会在返回错误之前按相反顺序回滚已完成的步骤。
//! 释放是幂等的且永不失败：每个清理问题都会变成一个 [`TeardownWarning`]。
//!
//! 协调器进程级的当前目录永远不会被修改，因此并发获取的环境不会相互影响。

use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tempfile::{TempDir, TempPath};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::config::HostSetup;
use crate::core::error::{
    AcquireFailure, HostError, RemoteFaultError, TeardownStep, TeardownWarning,
};
use crate::core::protocol::Response;
use crate::infra::boundary::{Boundary, BoundaryLauncher, BoundarySpec};
use crate::infra::channel::ControlChannel;
use crate::infra::fs::{absolute_path, create_scratch_dir, is_directory, write_temporary_file};
use crate::reporting::progress::ProgressHandle;

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Lifecycle of an environment. States only ever move forward.
/// 环境的生命周期。状态只会向前推进。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum LifecycleState {
    Created,
    Initializing,
    Ready,
    Running,
    ShuttingDown,
    Faulted,
    Released,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Created => "created",
            LifecycleState::Initializing => "initializing",
            LifecycleState::Ready => "ready",
            LifecycleState::Running => "running",
            LifecycleState::ShuttingDown => "shutting down",
            LifecycleState::Faulted => "faulted",
            LifecycleState::Released => "released",
        };
        f.write_str(name)
    }
}

/// The working directory an environment runs in, and the coordinator
/// directory it replaced.
#[derive(Debug)]
pub struct WorkingDirectorySwitch {
    previous: PathBuf,
    current: PathBuf,
    scratch: Option<TempDir>,
}

impl WorkingDirectorySwitch {
    /// Adopts `requested`, which must be an existing directory, or a fresh
    /// scratch directory when none is given.
    pub fn enter(requested: Option<&Path>, label: &str) -> Result<Self, HostError> {
        let previous = std::env::current_dir().map_err(|source| HostError::WorkingDirectory {
            path: PathBuf::from("."),
            source,
        })?;

        let (current, scratch) = match requested {
            Some(path) => {
                if !is_directory(path) {
                    return Err(HostError::WorkingDirectory {
                        path: path.to_path_buf(),
                        source: io::Error::new(io::ErrorKind::NotFound, "not an existing directory"),
                    });
                }
                let current = absolute_path(path).map_err(|source| HostError::WorkingDirectory {
                    path: path.to_path_buf(),
                    source,
                })?;
                (current, None)
            }
            None => {
                let scratch =
                    create_scratch_dir(label).map_err(|source| HostError::WorkingDirectory {
                        path: std::env::temp_dir(),
                        source,
                    })?;
                (scratch.path().to_path_buf(), Some(scratch))
            }
        };

        Ok(Self {
            previous,
            current,
            scratch,
        })
    }

    pub fn previous(&self) -> &Path {
        &self.previous
    }

    pub fn current(&self) -> &Path {
        &self.current
    }

    /// Removes the scratch directory. The coordinator's own directory is
    /// left wherever the coordinator put it.
    pub fn restore(self) -> io::Result<()> {
        match self.scratch {
            Some(dir) => dir.close(),
            None => Ok(()),
        }
    }
}

/// One sandboxed execution context. Owned by the worker that acquired it.
/// 一个沙箱化的执行上下文。由获取它的工作者独占。
pub struct IsolatedEnvironment {
    id: u64,
    label: String,
    state: LifecycleState,
    working_directory: PathBuf,
    configuration_path: PathBuf,
    switch: Option<WorkingDirectorySwitch>,
    configuration: Option<TempPath>,
    boundary: Option<Box<dyn Boundary>>,
    channel: Option<ControlChannel>,
}

impl IsolatedEnvironment {
    fn new(id: u64, label: String) -> Self {
        Self {
            id,
            label,
            state: LifecycleState::Created,
            working_directory: PathBuf::new(),
            configuration_path: PathBuf::new(),
            switch: None,
            configuration: None,
            boundary: None,
            channel: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    /// The coordinator's working directory when the environment was acquired.
    pub fn previous_working_directory(&self) -> Option<&Path> {
        self.switch.as_ref().map(WorkingDirectorySwitch::previous)
    }

    pub fn configuration_path(&self) -> &Path {
        &self.configuration_path
    }

    fn advance(&mut self, next: LifecycleState) {
        if next > self.state {
            debug!(environment = self.id, from = %self.state, to = %next, "environment state changed");
            self.state = next;
        }
    }
}

impl fmt::Debug for IsolatedEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolatedEnvironment")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("state", &self.state)
            .field("working_directory", &self.working_directory)
            .field("configuration_path", &self.configuration_path)
            .finish_non_exhaustive()
    }
}

/// Acquires, drives and releases isolated environments.
/// 获取、驱动并释放隔离环境。
pub struct IsolatedHost {
    launcher: Arc<dyn BoundaryLauncher>,
    handshake_timeout: Duration,
    invoke_timeout: Duration,
    shutdown_grace: Duration,
    next_id: AtomicU64,
}

impl IsolatedHost {
    pub fn new(launcher: Arc<dyn BoundaryLauncher>) -> Self {
        Self {
            launcher,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            invoke_timeout: DEFAULT_INVOKE_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_timeouts(mut self, handshake: Duration, invoke: Duration) -> Self {
        self.handshake_timeout = handshake;
        self.invoke_timeout = invoke;
        self
    }

    /// How long a boundary may take to stop before it is forced down.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn invoke_timeout(&self) -> Duration {
        self.invoke_timeout
    }

    /// Provisions an environment. On failure every completed step has been
    /// undone when the error is returned.
    ///
    /// 提供一个环境。失败时，返回错误之前所有已完成的步骤都已被撤销。
    pub async fn acquire(
        &self,
        setup: &HostSetup,
        progress: ProgressHandle,
    ) -> Result<IsolatedEnvironment, HostError> {
        self.try_acquire(setup, progress).await.map_err(HostError::from)
    }

    /// Like [`acquire`](Self::acquire), also handing back the warnings of a
    /// rollback that did not go cleanly.
    pub async fn try_acquire(
        &self,
        setup: &HostSetup,
        progress: ProgressHandle,
    ) -> Result<IsolatedEnvironment, AcquireFailure> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut env = IsolatedEnvironment::new(id, progress.source().to_string());
        env.advance(LifecycleState::Initializing);

        match self.provision(&mut env, setup, progress).await {
            Ok(()) => {
                env.advance(LifecycleState::Ready);
                info!(
                    environment = id,
                    isolation = ?setup.isolation,
                    working_directory = %env.working_directory.display(),
                    "isolated environment ready"
                );
                Ok(env)
            }
            Err(err) => {
                warn!(environment = id, step = ?err.step(), error = %err, "acquisition failed, rolling back");
                let rollback_warnings = self.teardown(&mut env).await;
                for warning in &rollback_warnings {
                    warn!(environment = id, %warning, "rollback step failed");
                }
                Err(AcquireFailure {
                    error: err,
                    rollback_warnings,
                })
            }
        }
    }

    async fn provision(
        &self,
        env: &mut IsolatedEnvironment,
        setup: &HostSetup,
        progress: ProgressHandle,
    ) -> Result<(), HostError> {
        let switch = WorkingDirectorySwitch::enter(setup.working_directory.as_deref(), &env.label)?;
        env.working_directory = switch.current().to_path_buf();
        env.switch = Some(switch);

        let configuration = setup.effective_configuration();
        let content = configuration
            .to_toml()
            .map_err(|e| HostError::Configuration(io::Error::other(e)))?;
        let path = write_temporary_file(&env.label, ".toml", &content)
            .map_err(HostError::Configuration)?;
        env.configuration_path = path.to_path_buf();
        env.configuration = Some(path);

        let spec = BoundarySpec {
            label: env.label.clone(),
            isolation: setup.isolation,
            working_directory: env.working_directory.clone(),
            configuration_path: env.configuration_path.clone(),
            configuration,
            application_base: setup.application_base().to_path_buf(),
        };
        let launched = self.launcher.launch(&spec).await?;
        env.boundary = Some(launched.boundary);

        let channel = env
            .channel
            .insert(ControlChannel::open(launched.transport, progress));
        channel.handshake(self.handshake_timeout).await?;
        Ok(())
    }

    /// Undoes whatever steps completed, last step first. Each step is
    /// attempted even when an earlier one failed.
    async fn teardown(&self, env: &mut IsolatedEnvironment) -> Vec<TeardownWarning> {
        let mut warnings = Vec::new();

        if let Some(channel) = env.channel.take() {
            channel.request_shutdown();
            channel.close();
        }
        if let Some(boundary) = env.boundary.take() {
            if let Err(e) = boundary.shutdown(self.shutdown_grace).await {
                warnings.push(TeardownWarning::new(TeardownStep::Boundary, e));
            }
        }
        if let Some(configuration) = env.configuration.take() {
            if let Err(e) = configuration.close() {
                warnings.push(TeardownWarning::new(TeardownStep::Configuration, e));
            }
        }
        if let Some(switch) = env.switch.take() {
            if let Err(e) = switch.restore() {
                warnings.push(TeardownWarning::new(TeardownStep::WorkingDirectory, e));
            }
        }

        env.advance(LifecycleState::Released);
        warnings
    }

    /// Sends a request into the environment and waits for the response.
    pub async fn invoke(
        &self,
        env: &mut IsolatedEnvironment,
        op: &str,
        payload: Value,
    ) -> Result<Response, RemoteFaultError> {
        self.call(env, op, payload, None).await
    }

    /// Like [`invoke`](Self::invoke), forwarding `cancel` to the host.
    pub async fn invoke_cancellable(
        &self,
        env: &mut IsolatedEnvironment,
        op: &str,
        payload: Value,
        cancel: &CancellationToken,
    ) -> Result<Response, RemoteFaultError> {
        self.call(env, op, payload, Some(cancel)).await
    }

    async fn call(
        &self,
        env: &mut IsolatedEnvironment,
        op: &str,
        payload: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<Response, RemoteFaultError> {
        if !matches!(env.state, LifecycleState::Ready | LifecycleState::Running) {
            return Err(RemoteFaultError::Unavailable(env.state));
        }
        env.advance(LifecycleState::Running);

        let Some(channel) = env.channel.as_mut() else {
            return Err(RemoteFaultError::Unavailable(env.state));
        };
        let result = channel.call(op, payload, self.invoke_timeout, cancel).await;

        if let Err(fault) = &result {
            warn!(environment = env.id, op, error = %fault, "isolated host faulted");
            env.advance(LifecycleState::Faulted);
        }
        result
    }

    /// Tears the environment down. Safe to call more than once; later calls
    /// do nothing. Always leaves the environment `Released`.
    ///
    /// 销毁环境。可以安全地多次调用；后续调用不执行任何操作。环境最终总是处于 `Released` 状态。
    pub async fn release(&self, env: &mut IsolatedEnvironment) -> Vec<TeardownWarning> {
        if env.state == LifecycleState::Released {
            return Vec::new();
        }
        env.advance(LifecycleState::ShuttingDown);

        let warnings = self.teardown(env).await;
        for warning in &warnings {
            warn!(environment = env.id, %warning, "teardown step failed");
        }
        info!(environment = env.id, warnings = warnings.len(), "isolated environment released");
        warnings
    }
}
