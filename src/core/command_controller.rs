//! # Command Controller / 命令控制器
//!
//! The built-in controller used by plan files. Each test case carrying a
//! `command` property is executed by the environment's `exec` operation;
//! nested masters are delegated to in dependency order.
//!
//! 计划文件使用的内置控制器。每个带有 `command` 属性的测试用例都通过环境的
//! `exec` 操作执行；嵌套主节点按依赖顺序被委托执行。

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::json;
use tracing::{error, info, warn};

use crate::core::controller::{ControllerContext, ControllerFactory, ControllerReport, TestController};
use crate::core::error::ControllerError;
use crate::core::models::{NodeIndex, TerminalStatus, TestNode};
use crate::core::planner::{order_units, partition_units, unit_dependencies};
use crate::core::protocol::ResponseStatus;

/// Node property holding the shell command of a test case.
pub const COMMAND_PROPERTY: &str = "command";

#[derive(Debug, Clone, Copy, Default)]
pub struct CommandControllerFactory;

impl ControllerFactory for CommandControllerFactory {
    fn create(&self, _master: &TestNode) -> Box<dyn TestController> {
        Box::new(CommandController)
    }
}

/// Runs the test cases of a master one by one.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandController;

impl TestController for CommandController {
    fn run<'a>(
        &'a mut self,
        ctx: &'a mut ControllerContext<'_>,
    ) -> BoxFuture<'a, Result<ControllerReport, ControllerError>> {
        async move {
            let graph = ctx.graph();
            let master = ctx.master();
            let mut report = ControllerReport::new();

            // A master that is itself a test case runs its own command.
            if graph.node(master).is_test_case() {
                let status = run_case(ctx, master).await?;
                report.record_subtree(graph, master, status);
                return Ok(report);
            }

            let units = partition_units(graph, Some(master), |node| {
                node.is_test_case() || node.is_master()
            });
            let dependencies = unit_dependencies(graph, Some(master), &units);
            let order = order_units(graph, &units, &dependencies)
                .map_err(|cycle| ControllerError::fault(cycle.to_string()))?;

            let total = units.len() as u64;
            let mut outcomes: Vec<Option<TerminalStatus>> = vec![None; units.len()];
            ctx.progress()
                .report_task_changed(format!("Running {}", graph.node(master).id()));

            for (completed, position) in order.into_iter().enumerate() {
                let unit = units[position];
                let blocked = dependencies[position]
                    .upstream
                    .iter()
                    .any(|&up| outcomes[up] != Some(TerminalStatus::Passed));

                let status = if ctx.is_cancelled() {
                    report.record_subtree(graph, unit, TerminalStatus::Cancelled);
                    TerminalStatus::Cancelled
                } else if blocked {
                    warn!(node = %graph.node(unit).id(), "skipped: a dependency did not pass");
                    report.record_subtree(graph, unit, TerminalStatus::Skipped);
                    TerminalStatus::Skipped
                } else if graph.node(unit).is_master() {
                    match ctx.delegate(unit).await {
                        Ok(nested) => {
                            let status = nested.resolved(graph, unit);
                            report.merge(nested);
                            status
                        }
                        Err(err) => {
                            error!(node = %graph.node(unit).id(), error = %err, "nested master failed");
                            report.record_subtree(graph, unit, TerminalStatus::Failed);
                            TerminalStatus::Failed
                        }
                    }
                } else {
                    let status = run_case(ctx, unit).await?;
                    report.record_subtree(graph, unit, status);
                    status
                };

                outcomes[position] = Some(status);
                ctx.progress().report_progress(completed as u64 + 1, total);
            }

            Ok(report)
        }
        .boxed()
    }
}

async fn run_case(
    ctx: &mut ControllerContext<'_>,
    case: NodeIndex,
) -> Result<TerminalStatus, ControllerError> {
    let node = ctx.graph().node(case);
    let Some(command) = node.property(COMMAND_PROPERTY) else {
        return Ok(TerminalStatus::Passed);
    };

    ctx.progress().report_task_changed(node.id().to_string());
    let response = ctx.invoke("exec", json!({ "command": command })).await?;

    let status = match response.status {
        ResponseStatus::Ok if response.payload["success"].as_bool() == Some(true) => {
            TerminalStatus::Passed
        }
        ResponseStatus::Ok => TerminalStatus::Failed,
        ResponseStatus::Failed => {
            warn!(
                node = %node.id(),
                reason = response.message().unwrap_or("unknown"),
                "command could not be executed"
            );
            TerminalStatus::Failed
        }
        ResponseStatus::Cancelled => TerminalStatus::Cancelled,
    };
    info!(node = %node.id(), status = %status, "test case finished");
    Ok(status)
}
