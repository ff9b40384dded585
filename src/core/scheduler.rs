//! # Scheduler Module / 调度器模块
//!
//! Drives one run: validates the graph, plans it, dispatches every top-level
//! master onto a bounded worker pool once its dependencies are terminal, runs
//! its controller (inside an isolated host when the master asks for one),
//! and collects the run report.
//!
//! 驱动一次运行：验证图、制定计划，在每个顶层主节点的依赖达到终止状态后
//! 将其分派到有界工作池，运行其控制器（当主节点要求时在隔离宿主中运行），
//! 并收集运行报告。

use chrono::Local;
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::config::RunSettings;
use crate::core::controller::{
    ControllerContext, ControllerReport, InvokeTarget, derive_statuses, local_environment,
};
use crate::core::error::{ControllerError, GraphError, TeardownWarning};
use crate::core::graph::TestGraph;
use crate::core::models::{
    DependencyEdge, MasterFault, NodeId, NodeIndex, NodeSpec, NodeStatus, RunOutcome, RunPhase, RunReport,
    RunWarning, TerminalStatus,
};
use crate::core::planner::{ExecutionPlan, MasterPlan, plan_execution};
use crate::core::status::StatusTable;
use crate::infra::agent::{CommandService, HostService};
use crate::infra::boundary::DefaultLauncher;
use crate::infra::host::IsolatedHost;
use crate::reporting::progress::ProgressReporter;

/// Logs every phase transition of a run.
struct PhaseTracker {
    phase: RunPhase,
}

impl PhaseTracker {
    fn new() -> Self {
        Self {
            phase: RunPhase::Idle,
        }
    }

    fn advance(&mut self, next: RunPhase) {
        info!(from = %self.phase, to = %next, "run phase changed");
        self.phase = next;
    }
}

/// State shared by the tasks of one run.
struct RunShared {
    graph: Arc<TestGraph>,
    statuses: StatusTable,
    pool: Semaphore,
    host: Arc<IsolatedHost>,
    reporter: ProgressReporter,
    local_service: Arc<dyn HostService>,
    cancel: CancellationToken,
    grace_period: Duration,
    invoke_timeout: Duration,
}

/// What a master task hands back to the run.
#[derive(Default)]
struct MasterOutcome {
    warnings: Vec<RunWarning>,
    fault: Option<MasterFault>,
}

enum Supervised {
    Finished(Result<ControllerReport, ControllerError>),
    Panicked(String),
    /// Cancellation was observed and the grace period ran out.
    Abandoned,
}

/// Runs test graphs.
/// 运行测试图。
pub struct Scheduler {
    settings: RunSettings,
    host: Arc<IsolatedHost>,
    reporter: ProgressReporter,
    local_service: Arc<dyn HostService>,
    cancel: CancellationToken,
}

impl Scheduler {
    /// A scheduler with the default launcher. Process and sandbox masters
    /// start the running executable as their agent; embedders that are not
    /// the `plan-runner` binary should pass their own host via
    /// [`with_host`](Self::with_host) with an explicit
    /// [`AgentCommand`](crate::infra::boundary::AgentCommand).
    pub fn new(settings: RunSettings) -> Self {
        let host = IsolatedHost::new(Arc::new(DefaultLauncher::default()))
            .with_timeouts(settings.handshake_timeout(), settings.invoke_timeout());
        Self {
            settings,
            host: Arc::new(host),
            reporter: ProgressReporter::new(),
            local_service: Arc::new(CommandService::default()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_host(mut self, host: IsolatedHost) -> Self {
        self.host = Arc::new(host);
        self
    }

    /// Service used by masters that run without isolation.
    pub fn with_local_service(mut self, service: Arc<dyn HostService>) -> Self {
        self.local_service = service;
        self
    }

    pub fn with_reporter(mut self, reporter: ProgressReporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Cancelling this token cancels the run.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn reporter(&self) -> &ProgressReporter {
        &self.reporter
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Builds the graph from discovery output and runs it.
    ///
    /// A structural problem (unknown or duplicate identifier, dependency
    /// cycle) aborts the run before any controller is invoked.
    ///
    /// 根据发现层输出构建图并运行它。
    /// 结构性问题（未知或重复的标识符、依赖环）会在调用任何控制器之前中止运行。
    pub async fn run(
        &self,
        roots: Vec<NodeSpec>,
        edges: Vec<DependencyEdge>,
    ) -> Result<RunReport, GraphError> {
        let mut phase = PhaseTracker::new();
        phase.advance(RunPhase::Validating);
        match TestGraph::build(roots, edges) {
            Ok(graph) => self.execute(Arc::new(graph), phase).await,
            Err(err) => {
                error!(error = %err, "test graph rejected");
                phase.advance(RunPhase::Aborted);
                Err(err)
            }
        }
    }

    /// Runs an already frozen graph.
    pub async fn run_graph(&self, graph: Arc<TestGraph>) -> Result<RunReport, GraphError> {
        let mut phase = PhaseTracker::new();
        phase.advance(RunPhase::Validating);
        self.execute(graph, phase).await
    }

    async fn execute(
        &self,
        graph: Arc<TestGraph>,
        mut phase: PhaseTracker,
    ) -> Result<RunReport, GraphError> {
        let started_at = Local::now();

        let plan = match plan_execution(Arc::clone(&graph)) {
            Ok(plan) => plan,
            Err(cycle) => {
                error!(error = %cycle, "masters depend on each other");
                phase.advance(RunPhase::Aborted);
                return Err(cycle.into());
            }
        };

        phase.advance(RunPhase::Ordering);
        info!(
            nodes = graph.len(),
            masters = plan.master_count(),
            "execution order computed"
        );

        phase.advance(RunPhase::Dispatching);
        let shared = Arc::new(RunShared {
            graph: Arc::clone(&graph),
            statuses: StatusTable::new(graph.len()),
            pool: Semaphore::new(self.settings.jobs()),
            host: Arc::clone(&self.host),
            reporter: self.reporter.clone(),
            local_service: Arc::clone(&self.local_service),
            cancel: self.cancel.clone(),
            grace_period: self.settings.grace_period(),
            invoke_timeout: self.settings.invoke_timeout(),
        });

        for &orphan in &plan.orphans {
            shared.statuses.publish(orphan, TerminalStatus::Skipped);
        }
        if !plan.orphans.is_empty() {
            warn!(count = plan.orphans.len(), "nodes outside every master were skipped");
        }

        let aggregators: Vec<_> = plan
            .aggregates
            .iter()
            .map(|&container| tokio::spawn(aggregate(Arc::clone(&shared), container)))
            .collect();

        let masters: Vec<_> = plan
            .masters
            .iter()
            .cloned()
            .map(|master| tokio::spawn(run_master(Arc::clone(&shared), master)))
            .collect();

        phase.advance(RunPhase::Executing(masters.len()));
        let mut warnings = Vec::new();
        let mut faults = Vec::new();
        for (joined, master) in join_all(masters).await.into_iter().zip(&plan.masters) {
            match joined {
                Ok(outcome) => {
                    warnings.extend(outcome.warnings);
                    faults.extend(outcome.fault);
                }
                Err(err) => {
                    // The task itself died; whatever it did not publish fails.
                    error!(error = %err, "master task aborted");
                    publish_subtree(&shared, master.node, TerminalStatus::Failed);
                    faults.push(MasterFault {
                        master: graph.node(master.node).id().clone(),
                        message: err.to_string(),
                    });
                }
            }
        }

        phase.advance(RunPhase::Aggregating);
        for joined in join_all(aggregators).await {
            if let Err(err) = joined {
                error!(error = %err, "aggregation task aborted");
            }
        }

        let report = self.build_report(&plan, &shared, warnings, faults, started_at);
        phase.advance(RunPhase::Done);
        info!(
            outcome = ?report.outcome,
            passed = report.count(TerminalStatus::Passed),
            failed = report.count(TerminalStatus::Failed),
            skipped = report.count(TerminalStatus::Skipped),
            cancelled = report.count(TerminalStatus::Cancelled),
            "run finished"
        );
        Ok(report)
    }

    fn build_report(
        &self,
        plan: &ExecutionPlan,
        shared: &RunShared,
        warnings: Vec<RunWarning>,
        faults: Vec<MasterFault>,
        started_at: chrono::DateTime<Local>,
    ) -> RunReport {
        let graph = &plan.graph;
        let statuses: Vec<NodeStatus> = graph
            .indices()
            .map(|idx| {
                let node = graph.node(idx);
                NodeStatus {
                    id: node.id().clone(),
                    is_test_case: node.is_test_case(),
                    is_master: node.is_master(),
                    status: shared
                        .statuses
                        .get(idx)
                        .unwrap_or(TerminalStatus::Cancelled),
                }
            })
            .collect();

        let outcome = if statuses.iter().all(|entry| entry.status.is_passed()) {
            RunOutcome::Passed
        } else {
            RunOutcome::Failed
        };

        RunReport {
            phase: RunPhase::Done,
            outcome,
            statuses,
            order: plan
                .order
                .iter()
                .map(|&idx| graph.node(idx).id().clone())
                .collect(),
            events: self.reporter.take_events(),
            warnings,
            faults,
            started_at,
            finished_at: Local::now(),
        }
    }
}

fn publish_subtree(shared: &RunShared, root: NodeIndex, status: TerminalStatus) {
    for node in shared.graph.subtree(root) {
        shared.statuses.publish(node, status);
    }
}

/// A container above masters: the worst status of its children.
async fn aggregate(shared: Arc<RunShared>, container: NodeIndex) {
    let children = shared.graph.node(container).children().to_vec();
    let statuses = shared.statuses.wait_all(&children).await;
    let status = TerminalStatus::worst(statuses).unwrap_or(TerminalStatus::Passed);
    shared.statuses.publish(container, status);
}

/// Runs one master and guarantees its whole subtree ends up terminal, even
/// when acquiring or releasing its host panics. Statuses already published
/// are kept.
async fn run_master(shared: Arc<RunShared>, plan: MasterPlan) -> MasterOutcome {
    let master = plan.node;
    let guarded = AssertUnwindSafe(drive_master(Arc::clone(&shared), plan))
        .catch_unwind()
        .await;

    match guarded {
        Ok(outcome) => outcome,
        Err(panic) => {
            let message = panic_message(panic);
            let id = shared.graph.node(master).id().clone();
            error!(master = %id, panic = %message, "master task panicked");
            publish_subtree(&shared, master, TerminalStatus::Failed);
            MasterOutcome {
                warnings: Vec::new(),
                fault: Some(fault(&id, format!("master task panicked: {message}"))),
            }
        }
    }
}

async fn drive_master(shared: Arc<RunShared>, plan: MasterPlan) -> MasterOutcome {
    let graph = Arc::clone(&shared.graph);
    let master = plan.node;
    let node = graph.node(master);

    let dependencies = shared.statuses.wait_all(&plan.external_dependencies).await;

    if shared.cancel.is_cancelled() {
        info!(master = %node.id(), "not started: run cancelled");
        publish_subtree(&shared, master, TerminalStatus::Cancelled);
        return MasterOutcome::default();
    }
    if dependencies.iter().any(|status| !status.is_passed()) {
        warn!(master = %node.id(), "skipped: a dependency did not pass");
        publish_subtree(&shared, master, TerminalStatus::Skipped);
        return MasterOutcome::default();
    }

    let permit = tokio::select! {
        permit = shared.pool.acquire() => permit.ok(),
        _ = shared.cancel.cancelled() => None,
    };
    if permit.is_none() || shared.cancel.is_cancelled() {
        info!(master = %node.id(), "not started: run cancelled");
        publish_subtree(&shared, master, TerminalStatus::Cancelled);
        return MasterOutcome::default();
    }

    let Some(factory) = node.execution_factory() else {
        publish_subtree(&shared, master, TerminalStatus::Failed);
        return MasterOutcome {
            warnings: Vec::new(),
            fault: Some(fault(node.id(), "master has no execution factory")),
        };
    };

    info!(master = %node.id(), isolated = factory.isolation.is_some(), "master started");
    let progress = shared.reporter.handle(node.id().clone());
    let mut delegated = HashSet::new();
    let mut outcome = MasterOutcome::default();

    let created = std::panic::catch_unwind(AssertUnwindSafe(|| factory.controller.create(node)));
    let mut controller = match created {
        Ok(controller) => controller,
        Err(panic) => {
            let message = panic_message(panic);
            error!(master = %node.id(), panic = %message, "controller factory panicked");
            publish_subtree(&shared, master, TerminalStatus::Failed);
            outcome.fault = Some(fault(node.id(), format!("controller factory panicked: {message}")));
            return outcome;
        }
    };

    let supervised = match &factory.isolation {
        Some(setup) => {
            let mut env = match shared.host.try_acquire(setup, progress.clone()).await {
                Ok(env) => env,
                Err(failure) => {
                    error!(master = %node.id(), error = %failure, "isolated host could not be acquired");
                    publish_subtree(&shared, master, TerminalStatus::Failed);
                    outcome.fault = Some(fault(node.id(), failure.error.to_string()));
                    outcome.warnings = run_warnings(node.id(), failure.rollback_warnings);
                    return outcome;
                }
            };

            let supervised = {
                let mut ctx = ControllerContext {
                    graph: &graph,
                    master,
                    progress,
                    cancel: shared.cancel.clone(),
                    target: InvokeTarget::Isolated {
                        host: &shared.host,
                        env: &mut env,
                    },
                    delegated: &mut delegated,
                    invoke_timeout: shared.invoke_timeout,
                };
                supervise(controller.run(&mut ctx), &shared.cancel, shared.grace_period).await
            };

            outcome.warnings = run_warnings(node.id(), shared.host.release(&mut env).await);
            supervised
        }
        None => {
            let mut ctx = ControllerContext {
                graph: &graph,
                master,
                progress,
                cancel: shared.cancel.clone(),
                target: InvokeTarget::Local {
                    service: Arc::clone(&shared.local_service),
                    environment: local_environment(),
                },
                delegated: &mut delegated,
                invoke_timeout: shared.invoke_timeout,
            };
            supervise(controller.run(&mut ctx), &shared.cancel, shared.grace_period).await
        }
    };

    match supervised {
        Supervised::Finished(Ok(report)) => {
            for (member, status) in derive_statuses(&graph, master, &report) {
                shared.statuses.publish(member, status);
            }
            info!(
                master = %node.id(),
                status = %shared.statuses.get(master).unwrap_or(TerminalStatus::Passed),
                "master finished"
            );
        }
        Supervised::Finished(Err(err)) => {
            error!(master = %node.id(), error = %err, "controller failed");
            publish_subtree(&shared, master, TerminalStatus::Failed);
            outcome.fault = Some(fault(node.id(), err.to_string()));
        }
        Supervised::Panicked(message) => {
            error!(master = %node.id(), panic = %message, "controller panicked");
            publish_subtree(&shared, master, TerminalStatus::Failed);
            outcome.fault = Some(fault(node.id(), format!("controller panicked: {message}")));
        }
        Supervised::Abandoned => {
            warn!(master = %node.id(), "grace period elapsed, controller abandoned");
            publish_subtree(&shared, master, TerminalStatus::Cancelled);
        }
    }

    outcome
}

/// Runs a controller future, containing panics. Once the run is cancelled the
/// future gets `grace` to finish before it is dropped.
async fn supervise(
    run: BoxFuture<'_, Result<ControllerReport, ControllerError>>,
    cancel: &CancellationToken,
    grace: Duration,
) -> Supervised {
    let guarded = AssertUnwindSafe(run).catch_unwind();
    tokio::pin!(guarded);

    let finished = tokio::select! {
        result = &mut guarded => Some(result),
        _ = cancel.cancelled() => None,
    };
    let result = match finished {
        Some(result) => result,
        None => match tokio::time::timeout(grace, &mut guarded).await {
            Ok(result) => result,
            Err(_) => return Supervised::Abandoned,
        },
    };

    match result {
        Ok(finished) => Supervised::Finished(finished),
        Err(panic) => Supervised::Panicked(panic_message(panic)),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn run_warnings(master: &NodeId, warnings: Vec<TeardownWarning>) -> Vec<RunWarning> {
    warnings
        .into_iter()
        .map(|warning| RunWarning {
            master: master.clone(),
            warning,
        })
        .collect()
}

fn fault(master: &NodeId, message: impl Into<String>) -> MasterFault {
    MasterFault {
        master: master.clone(),
        message: message.into(),
    }
}
