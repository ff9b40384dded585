//! # Controller API / 控制器接口
//!
//! A master node owns one [`TestController`] per run. The scheduler creates it
//! through the master's [`ExecutionFactory`] and hands it a
//! [`ControllerContext`]: the way into the environment the master runs in,
//! its progress handle, the run's cancellation token, and the capability to
//! delegate to nested masters.
//!
//! 每个主节点在每次运行中拥有一个 [`TestController`]。调度器通过主节点的
//! [`ExecutionFactory`] 创建它，并交给它一个 [`ControllerContext`]：
//! 进入主节点运行环境的途径、进度句柄、运行的取消令牌，以及委托给嵌套主节点的能力。

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::config::HostSetup;
use crate::core::error::{ControllerError, RemoteFaultError};
use crate::core::graph::TestGraph;
use crate::core::models::{NodeIndex, TerminalStatus, TestNode};
use crate::core::protocol::Response;
use crate::infra::agent::{EventEmitter, HostService, ServiceContext, ServiceEnvironment, ServiceError};
use crate::infra::host::{IsolatedEnvironment, IsolatedHost};
use crate::reporting::progress::ProgressHandle;

/// Runs a master node and its subtree.
/// 运行一个主节点及其子树。
pub trait TestController: Send {
    /// Executes the master's subtree and reports the statuses it decided.
    /// Nodes left out of the report are derived by the scheduler.
    fn run<'a>(
        &'a mut self,
        ctx: &'a mut ControllerContext<'_>,
    ) -> BoxFuture<'a, Result<ControllerReport, ControllerError>>;
}

/// Creates a fresh controller for a master, once per run.
/// 为主节点创建新的控制器，每次运行一次。
pub trait ControllerFactory: Send + Sync {
    fn create(&self, master: &TestNode) -> Box<dyn TestController>;
}

impl<F> ControllerFactory for F
where
    F: Fn(&TestNode) -> Box<dyn TestController> + Send + Sync,
{
    fn create(&self, master: &TestNode) -> Box<dyn TestController> {
        self(master)
    }
}

/// Present only on master nodes.
/// 仅存在于主节点上。
#[derive(Clone)]
pub struct ExecutionFactory {
    pub controller: Arc<dyn ControllerFactory>,
    /// When present the master runs inside an isolated environment set up
    /// this way; otherwise it runs in-process against the local service.
    pub isolation: Option<HostSetup>,
}

impl ExecutionFactory {
    pub fn new(controller: impl ControllerFactory + 'static) -> Self {
        Self {
            controller: Arc::new(controller),
            isolation: None,
        }
    }

    pub fn isolated(mut self, setup: HostSetup) -> Self {
        self.isolation = Some(setup);
        self
    }
}

impl fmt::Debug for ExecutionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionFactory")
            .field("isolation", &self.isolation)
            .finish_non_exhaustive()
    }
}

/// Statuses decided by a controller for nodes of its subtree.
/// 控制器为其子树中的节点决定的状态。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControllerReport {
    statuses: HashMap<NodeIndex, TerminalStatus>,
}

impl ControllerReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, node: NodeIndex, status: TerminalStatus) {
        self.statuses.insert(node, status);
    }

    /// Records the same status for a node and every descendant.
    pub fn record_subtree(&mut self, graph: &TestGraph, node: NodeIndex, status: TerminalStatus) {
        for member in graph.subtree(node) {
            self.statuses.insert(member, status);
        }
    }

    pub fn get(&self, node: NodeIndex) -> Option<TerminalStatus> {
        self.statuses.get(&node).copied()
    }

    pub fn merge(&mut self, other: ControllerReport) {
        self.statuses.extend(other.statuses);
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    /// The status `node` ends up with once unreported nodes are derived.
    pub fn resolved(&self, graph: &TestGraph, node: NodeIndex) -> TerminalStatus {
        derive_statuses(graph, node, self)
            .first()
            .map(|&(_, status)| status)
            .unwrap_or(TerminalStatus::Passed)
    }
}

/// Statuses of `root` and its descendants in pre-order. A reported status
/// wins; an unreported test case passed; an unreported container takes the
/// worst status of its children.
pub(crate) fn derive_statuses(
    graph: &TestGraph,
    root: NodeIndex,
    reported: &ControllerReport,
) -> Vec<(NodeIndex, TerminalStatus)> {
    let base = root.index();
    let members: Vec<NodeIndex> = graph.subtree(root).collect();
    let mut statuses = vec![TerminalStatus::Passed; members.len()];

    // Children come after their parent in pre-order, so a reverse walk sees
    // every child before the parent.
    for &member in members.iter().rev() {
        let node = graph.node(member);
        let status = match reported.get(member) {
            Some(status) => status,
            None if node.is_test_case() => TerminalStatus::Passed,
            None => TerminalStatus::worst(
                node.children()
                    .iter()
                    .map(|child| statuses[child.index() - base]),
            )
            .unwrap_or(TerminalStatus::Passed),
        };
        statuses[member.index() - base] = status;
    }

    members.into_iter().zip(statuses).collect()
}

/// Where a controller's requests go.
pub(crate) enum InvokeTarget<'a> {
    Isolated {
        host: &'a IsolatedHost,
        env: &'a mut IsolatedEnvironment,
    },
    Local {
        service: Arc<dyn HostService>,
        environment: ServiceEnvironment,
    },
}

impl InvokeTarget<'_> {
    fn reborrow(&mut self) -> InvokeTarget<'_> {
        match self {
            InvokeTarget::Isolated { host, env } => InvokeTarget::Isolated {
                host: *host,
                env: &mut **env,
            },
            InvokeTarget::Local {
                service,
                environment,
            } => InvokeTarget::Local {
                service: Arc::clone(service),
                environment: environment.clone(),
            },
        }
    }
}

/// Everything a running controller may use.
/// 正在运行的控制器可以使用的一切。
pub struct ControllerContext<'a> {
    pub(crate) graph: &'a TestGraph,
    pub(crate) master: NodeIndex,
    pub(crate) progress: ProgressHandle,
    pub(crate) cancel: CancellationToken,
    pub(crate) target: InvokeTarget<'a>,
    pub(crate) delegated: &'a mut HashSet<NodeIndex>,
    pub(crate) invoke_timeout: Duration,
}

impl<'a> ControllerContext<'a> {
    pub fn graph(&self) -> &'a TestGraph {
        self.graph
    }

    /// The master this controller was created for.
    pub fn master(&self) -> NodeIndex {
        self.master
    }

    pub fn progress(&self) -> &ProgressHandle {
        &self.progress
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether requests cross an isolation boundary.
    pub fn is_isolated(&self) -> bool {
        matches!(self.target, InvokeTarget::Isolated { .. })
    }

    /// Sends one request to the environment the master runs in and waits for
    /// its response. Cancellation of the run is forwarded to the host.
    ///
    /// 向主节点运行所在的环境发送一个请求并等待其响应。运行的取消会被转发给宿主。
    pub async fn invoke(&mut self, op: &str, payload: Value) -> Result<Response, RemoteFaultError> {
        match &mut self.target {
            InvokeTarget::Isolated { host, env } => {
                host.invoke_cancellable(env, op, payload, &self.cancel).await
            }
            InvokeTarget::Local {
                service,
                environment,
            } => {
                debug!(op, "local invoke");
                let progress = self.progress.clone();
                let ctx = ServiceContext {
                    environment: environment.clone(),
                    events: EventEmitter::new(move |event| progress.apply(event)),
                    cancel: self.cancel.child_token(),
                };
                let call = service.handle(op, payload, ctx);
                match tokio::time::timeout(self.invoke_timeout, call).await {
                    Ok(Ok(value)) => Ok(Response::ok(0, value)),
                    Ok(Err(ServiceError::Cancelled)) => Ok(Response::cancelled(0)),
                    Ok(Err(err)) => Ok(Response::failed(0, err.to_string())),
                    Err(_) => Err(RemoteFaultError::Timeout(self.invoke_timeout)),
                }
            }
        }
    }

    /// Runs a nested master's controller inside the current environment.
    /// A master may only be delegated to once per run, and only by a
    /// controller whose subtree contains it.
    ///
    /// 在当前环境中运行嵌套主节点的控制器。每次运行中一个主节点只能被委托一次，
    /// 并且只能由子树包含它的控制器委托。
    pub fn delegate(
        &mut self,
        nested: NodeIndex,
    ) -> BoxFuture<'_, Result<ControllerReport, ControllerError>> {
        async move {
            let graph = self.graph;
            let node = graph.node(nested);
            let factory = match node.execution_factory() {
                Some(factory) if nested != self.master && graph.contains(self.master, nested) => {
                    factory
                }
                _ => return Err(ControllerError::NotDelegable(node.id().clone())),
            };
            if !self.delegated.insert(nested) {
                return Err(ControllerError::AlreadyDelegated(node.id().clone()));
            }

            debug!(master = %graph.node(self.master).id(), nested = %node.id(), "delegating");
            let mut controller = factory.controller.create(node);
            let mut child = ControllerContext {
                graph,
                master: nested,
                progress: self.progress.for_source(node.id().clone()),
                cancel: self.cancel.clone(),
                target: self.target.reborrow(),
                delegated: &mut *self.delegated,
                invoke_timeout: self.invoke_timeout,
            };
            controller.run(&mut child).await
        }
        .boxed()
    }
}

/// Working directory used by masters that run in-process.
pub(crate) fn local_environment() -> ServiceEnvironment {
    ServiceEnvironment {
        working_directory: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        configuration_path: None,
        application_base: crate::core::config::installation_path().to_path_buf(),
    }
}
