// Shared test helpers for integration tests
#![allow(dead_code)]

use futures::FutureExt;
use futures::future::BoxFuture;
use plan_runner::core::config::{HostSetup, IsolationKind, RunSettings};
use plan_runner::core::controller::{
    ControllerContext, ControllerFactory, ControllerReport, ExecutionFactory, TestController,
};
use plan_runner::core::error::{ControllerError, HostError};
use plan_runner::core::models::{NodeSpec, TerminalStatus, TestNode};
use plan_runner::core::protocol::Frame;
use plan_runner::infra::agent::{HostService, ServiceContext, ServiceError};
use plan_runner::infra::boundary::{
    Boundary, BoundaryLauncher, BoundarySpec, LaunchedBoundary, Transport,
};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// What a scripted controller does once it has been started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    Report,
    Panic,
    Error,
}

/// A controller factory whose controllers record their start and end in a
/// shared log, then report the statuses they were scripted with.
#[derive(Clone)]
pub struct ScriptedFactory {
    pub log: Arc<Mutex<Vec<String>>>,
    pub statuses: HashMap<String, TerminalStatus>,
    pub behaviours: HashMap<String, Behaviour>,
    pub delay: Duration,
    pub active: Arc<AtomicUsize>,
    pub peak: Arc<AtomicUsize>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(Vec::new())),
            statuses: HashMap::new(),
            behaviours: HashMap::new(),
            delay: Duration::ZERO,
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_status(mut self, id: &str, status: TerminalStatus) -> Self {
        self.statuses.insert(id.to_string(), status);
        self
    }

    pub fn with_behaviour(mut self, id: &str, behaviour: Behaviour) -> Self {
        self.behaviours.insert(id.to_string(), behaviour);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Position of `entry` in the log.
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.log().iter().position(|logged| logged == entry)
    }

    pub fn into_factory(self) -> ExecutionFactory {
        ExecutionFactory {
            controller: Arc::new(self),
            isolation: None,
        }
    }
}

impl ControllerFactory for ScriptedFactory {
    fn create(&self, master: &TestNode) -> Box<dyn TestController> {
        Box::new(ScriptedController {
            script: self.clone(),
            behaviour: self
                .behaviours
                .get(master.id().as_str())
                .copied()
                .unwrap_or(Behaviour::Report),
        })
    }
}

struct ScriptedController {
    script: ScriptedFactory,
    behaviour: Behaviour,
}

impl TestController for ScriptedController {
    fn run<'a>(
        &'a mut self,
        ctx: &'a mut ControllerContext<'_>,
    ) -> BoxFuture<'a, Result<ControllerReport, ControllerError>> {
        async move {
            let graph = ctx.graph();
            let master = ctx.master();
            let id = graph.node(master).id().to_string();
            self.script.log.lock().unwrap().push(format!("start {id}"));

            let now = self.script.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.script.peak.fetch_max(now, Ordering::SeqCst);
            if !self.script.delay.is_zero() {
                tokio::time::sleep(self.script.delay).await;
            }
            self.script.active.fetch_sub(1, Ordering::SeqCst);

            match self.behaviour {
                Behaviour::Panic => panic!("scripted panic in {id}"),
                Behaviour::Error => return Err(ControllerError::fault(format!("scripted error in {id}"))),
                Behaviour::Report => {}
            }

            let mut report = ControllerReport::new();
            for node in graph.subtree(master) {
                if let Some(status) = self.script.statuses.get(graph.node(node).id().as_str()) {
                    report.record(node, *status);
                }
            }
            self.script.log.lock().unwrap().push(format!("end {id}"));
            Ok(report)
        }
        .boxed()
    }
}

/// A host service whose `exec` succeeds unless the command contains "fail"
/// and which sleeps on commands containing "slow".
#[derive(Debug, Clone, Default)]
pub struct FakeService {
    pub executed: Arc<Mutex<Vec<String>>>,
}

impl FakeService {
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

impl HostService for FakeService {
    fn handle<'a>(
        &'a self,
        op: &'a str,
        payload: Value,
        ctx: ServiceContext,
    ) -> BoxFuture<'a, Result<Value, ServiceError>> {
        async move {
            match op {
                "exec" => {
                    let command = payload["command"].as_str().unwrap_or_default().to_string();
                    ctx.events.log("output", format!("running {command}"));
                    if command.contains("slow") {
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_secs(30)) => {}
                            _ = ctx.cancel.cancelled() => return Err(ServiceError::Cancelled),
                        }
                    }
                    self.executed.lock().unwrap().push(command.clone());
                    Ok(json!({ "success": !command.contains("fail"), "code": 0 }))
                }
                "describe" => Ok(json!({
                    "working_directory": ctx.environment.working_directory,
                    "configuration_path": ctx.environment.configuration_path,
                })),
                "hang" => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(Value::Null)
                }
                "crash" => panic!("service crashed"),
                other => Err(ServiceError::UnknownOperation(other.to_string())),
            }
        }
        .boxed()
    }
}

pub fn settings(jobs: usize) -> RunSettings {
    RunSettings {
        jobs,
        grace_period_secs: 0,
        invoke_timeout_secs: 5,
        handshake_timeout_secs: 5,
    }
}

/// A master container whose test cases are given by id.
pub fn master(id: &str, factory: &ExecutionFactory, cases: &[&str]) -> NodeSpec {
    NodeSpec::container(id)
        .with_factory(factory.clone())
        .with_children(cases.iter().map(|case| NodeSpec::test_case(*case)))
}

/// A test case that runs `command` through the command controller.
pub fn command_case(id: &str, command: &str) -> NodeSpec {
    NodeSpec::test_case(id).with_property("command", command)
}

pub fn in_process() -> HostSetup {
    HostSetup::new(IsolationKind::InProcess)
}

/// A boundary that fails to stop.
pub struct StuckBoundary;

impl Boundary for StuckBoundary {
    fn shutdown(self: Box<Self>, _grace: Duration) -> BoxFuture<'static, io::Result<()>> {
        async { Err(io::Error::other("boundary refused to stop")) }.boxed()
    }
}

/// Launches a host that never answers the handshake and cannot be stopped.
pub struct SilentLauncher;

impl BoundaryLauncher for SilentLauncher {
    fn launch<'a>(
        &'a self,
        _spec: &'a BoundarySpec,
    ) -> BoxFuture<'a, Result<LaunchedBoundary, HostError>> {
        async move {
            let (outgoing, mut from_coordinator) = mpsc::unbounded_channel::<Frame>();
            let (to_coordinator, incoming) = mpsc::unbounded_channel();
            tokio::spawn(async move {
                let _keep_open = to_coordinator;
                while from_coordinator.recv().await.is_some() {}
            });
            Ok(LaunchedBoundary {
                boundary: Box::new(StuckBoundary),
                transport: Transport { outgoing, incoming },
            })
        }
        .boxed()
    }
}

/// A launcher that panics instead of creating a boundary.
pub struct PanickingLauncher;

impl BoundaryLauncher for PanickingLauncher {
    fn launch<'a>(
        &'a self,
        _spec: &'a BoundarySpec,
    ) -> BoxFuture<'a, Result<LaunchedBoundary, HostError>> {
        panic!("launcher exploded")
    }
}
