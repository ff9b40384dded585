//! # Run Command Module / 运行命令模块
//!
//! This module implements the `run` command, which loads a plan file and
//! runs every master it describes.
//!
//! 此模块实现了 `run` 命令，它加载计划文件并运行其中描述的每个主节点。

use anyhow::{Context, Result};
use colored::*;
use std::{fs, path::PathBuf, sync::Arc};
use tokio::signal;
use tokio_util::sync::CancellationToken;

use crate::{
    core::{command_controller::CommandControllerFactory, config::PlanFile, scheduler::Scheduler},
    reporting::{
        console::{print_fault_details, print_summary},
        progress::{ConsolePresenter, ProgressReporter, TracingPresenter},
    },
};

/// Executes the run command with the provided arguments.
///
/// # Arguments
/// * `plan` - Path to the plan file
/// * `jobs` - Overrides the worker pool size of the plan
/// * `grace_secs` - Overrides the cancellation grace period of the plan
/// * `verbose` - Print command output as it arrives
///
/// # Returns
/// `true` when every node passed
pub async fn execute(
    plan: PathBuf,
    jobs: Option<usize>,
    grace_secs: Option<u64>,
    verbose: bool,
) -> Result<bool> {
    let plan_path = fs::canonicalize(&plan)
        .with_context(|| format!("Plan file not found at {}", plan.display()))?;
    println!(
        "{} {}",
        "Loading plan from".cyan(),
        plan_path.display()
    );

    let mut plan_file = PlanFile::load(&plan_path)?;
    if let Some(jobs) = jobs {
        plan_file.settings.jobs = jobs;
    }
    if let Some(grace) = grace_secs {
        plan_file.settings.grace_period_secs = grace;
    }

    let (roots, edges) = plan_file.into_graph_input(Arc::new(CommandControllerFactory))?;

    let reporter = ProgressReporter::with_presenters(vec![
        Box::new(TracingPresenter),
        Box::new(ConsolePresenter { verbose }),
    ]);
    let scheduler = Scheduler::new(plan_file.settings.clone()).with_reporter(reporter);
    setup_signal_handler(scheduler.cancellation_token());

    println!(
        "{}",
        format!("Running {} node(s) with {} job(s)", plan_file.nodes.len(), scheduler.settings().jobs()).bold()
    );

    let report = scheduler
        .run(roots, edges)
        .await
        .context("The plan could not be scheduled")?;

    print_summary(&report);
    print_fault_details(&report);

    if report.is_passed() {
        println!("\n{}", "All nodes passed.".green().bold());
    } else {
        println!("\n{}", "Some nodes did not pass.".red().bold());
    }
    Ok(report.is_passed())
}

/// Cancels the run on Ctrl-C.
fn setup_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            println!(
                "\n{}",
                "Shutdown signal received, cancelling the run...".yellow()
            );
            token.cancel();
        }
    });
}
