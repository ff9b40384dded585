//! # Error Types Module / 错误类型模块
//!
//! Typed errors raised by the graph model, the isolated host and controllers.
//! Structural errors abort a run before dispatch, host and remote faults are
//! contained to one master, and teardown problems are only ever warnings.
//!
//! 由节点图、隔离宿主和控制器产生的类型化错误。
//! 结构性错误会在分派前中止运行，宿主和远程故障仅限于单个主节点，
//! 而清理问题始终只是警告。

use serde::Serialize;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::core::models::NodeId;
use crate::infra::host::LifecycleState;

/// The dependency relation contains a cycle. `participants` lists the
/// members in traversal order; the last one leads back to the first.
///
/// 依赖关系中存在环。`participants` 按遍历顺序列出环的成员；最后一个指回第一个。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("dependency cycle detected: {}", render_cycle(.participants))]
pub struct CycleError {
    pub participants: Vec<NodeId>,
}

fn render_cycle(participants: &[NodeId]) -> String {
    let mut rendered: Vec<&str> = participants.iter().map(NodeId::as_str).collect();
    if let Some(first) = participants.first() {
        rendered.push(first.as_str());
    }
    rendered.join(" -> ")
}

/// The input graph could not be frozen.
/// 输入的图无法被冻结。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error(transparent)]
    Cycle(#[from] CycleError),
    #[error("duplicate node identifier '{0}'")]
    DuplicateId(NodeId),
    #[error("dependency edge references unknown node '{0}'")]
    UnknownNode(NodeId),
}

/// The acquisition step of an isolated environment that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AcquireStep {
    WorkingDirectory,
    Configuration,
    Boundary,
    Handshake,
}

/// An isolated environment could not be provisioned. Every step completed
/// before the failure has already been unwound when this is returned.
///
/// 无法提供隔离环境。返回此错误时，失败之前完成的每一步都已被回滚。
#[derive(Debug, Error)]
pub enum HostError {
    #[error("working directory '{}' cannot be used", path.display())]
    WorkingDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not write the temporary host configuration")]
    Configuration(#[source] io::Error),
    #[error("could not create the isolation boundary: {message}")]
    Boundary {
        message: String,
        #[source]
        source: Option<io::Error>,
    },
    #[error("handshake with the isolated host failed: {0}")]
    Handshake(String),
}

impl HostError {
    pub fn boundary(message: impl Into<String>) -> Self {
        HostError::Boundary {
            message: message.into(),
            source: None,
        }
    }

    pub fn step(&self) -> AcquireStep {
        match self {
            HostError::WorkingDirectory { .. } => AcquireStep::WorkingDirectory,
            HostError::Configuration(_) => AcquireStep::Configuration,
            HostError::Boundary { .. } => AcquireStep::Boundary,
            HostError::Handshake(_) => AcquireStep::Handshake,
        }
    }
}

/// A failed acquisition together with whatever went wrong while undoing the
/// steps that had already completed.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct AcquireFailure {
    pub error: HostError,
    pub rollback_warnings: Vec<TeardownWarning>,
}

impl From<AcquireFailure> for HostError {
    fn from(failure: AcquireFailure) -> Self {
        failure.error
    }
}

/// A call across the isolation boundary did not produce a response.
/// Nothing raised inside the boundary ever crosses it in any other form.
///
/// 跨越隔离边界的调用没有产生响应。边界内部产生的任何错误都只会以这种形式传出。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteFaultError {
    #[error("no response from the isolated host within {0:?}")]
    Timeout(Duration),
    #[error("the isolated host disconnected")]
    Disconnected,
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("the environment cannot accept requests while {0}")]
    Unavailable(LifecycleState),
}

/// A controller could not complete its run.
/// 控制器无法完成其运行。
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Remote(#[from] RemoteFaultError),
    #[error("'{0}' is not a nested master of the running controller")]
    NotDelegable(NodeId),
    #[error("nested master '{0}' already ran in this run")]
    AlreadyDelegated(NodeId),
    #[error("{0}")]
    Fault(String),
}

impl ControllerError {
    pub fn fault(message: impl Into<String>) -> Self {
        ControllerError::Fault(message.into())
    }
}

/// The teardown action that produced a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TeardownStep {
    Boundary,
    Configuration,
    WorkingDirectory,
}

impl fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TeardownStep::Boundary => "tearing down the isolation boundary",
            TeardownStep::Configuration => "deleting the temporary configuration",
            TeardownStep::WorkingDirectory => "restoring the working directory",
        };
        f.write_str(name)
    }
}

/// A non-fatal failure of one teardown action.
/// 单个清理操作的非致命失败。
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{step} failed: {message}")]
pub struct TeardownWarning {
    pub step: TeardownStep,
    pub message: String,
}

impl TeardownWarning {
    pub fn new(step: TeardownStep, message: impl fmt::Display) -> Self {
        Self {
            step,
            message: message.to_string(),
        }
    }
}
