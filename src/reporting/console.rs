//! # Console Reporting Module / 控制台报告模块
//!
//! This module prints run summaries and execution plans to the console,
//! colour coding node statuses.
//!
//! 此模块在控制台打印运行摘要和执行计划，并用颜色区分节点状态。

use colored::*;

use crate::core::models::{RunReport, TerminalStatus};
use crate::core::planner::ExecutionPlan;

fn colored_status(status: TerminalStatus) -> ColoredString {
    match status {
        TerminalStatus::Passed => status.as_str().green(),
        TerminalStatus::Failed => status.as_str().red(),
        TerminalStatus::Skipped => status.as_str().dimmed(),
        TerminalStatus::Cancelled => status.as_str().yellow(),
    }
}

/// Prints a formatted summary of a run to the console.
///
/// 在控制台打印格式化的运行摘要。
///
/// # Output Format / 输出格式
/// ```text
/// --- Run Summary ---
///   - Status     | Node                                     | Kind
///   - Passed     | integration                              | master
///   - Passed     | integration/db                           | test
///   - Skipped    | e2e                                      | master
/// ```
pub fn print_summary(report: &RunReport) {
    println!("\n{}", "--- Run Summary ---".bold());
    println!("  - {:<10} | {:<40} | {}", "Status", "Node", "Kind");

    for entry in &report.statuses {
        let kind = if entry.is_master {
            "master"
        } else if entry.is_test_case {
            "test"
        } else {
            "container"
        };
        println!(
            "  - {:<10} | {:<40} | {}",
            colored_status(entry.status),
            entry.id,
            kind.dimmed()
        );
    }

    let duration = report.finished_at - report.started_at;
    println!(
        "\n  {} passed, {} failed, {} skipped, {} cancelled in {:.2}s",
        report.count(TerminalStatus::Passed).to_string().green(),
        report.count(TerminalStatus::Failed).to_string().red(),
        report.count(TerminalStatus::Skipped).to_string().dimmed(),
        report.count(TerminalStatus::Cancelled).to_string().yellow(),
        duration.num_milliseconds() as f64 / 1000.0
    );

    if !report.warnings.is_empty() {
        println!("\n{}", "Teardown warnings:".yellow().bold());
        for entry in &report.warnings {
            println!("  - [{}] {}", entry.master.to_string().cyan(), entry.warning);
        }
    }
}

/// Prints why masters failed. Does nothing when no master faulted.
///
/// 打印主节点失败的原因。没有主节点出错时不输出任何内容。
pub fn print_fault_details(report: &RunReport) {
    if report.faults.is_empty() {
        return;
    }

    println!("\n{}", "--- Master Failures ---".red().bold());
    println!("{}", "-".repeat(80));
    for (i, fault) in report.faults.iter().enumerate() {
        println!(
            "[{}/{}] {} '{}'",
            i + 1,
            report.faults.len(),
            "Master failed:".red(),
            fault.master.to_string().cyan()
        );
        println!("  {}", fault.message);
        println!("{}", "-".repeat(80));
    }
}

/// Prints the computed order and the masters in dispatch order.
pub fn print_plan(plan: &ExecutionPlan) {
    let graph = &plan.graph;

    println!("{}", "--- Execution Order ---".bold());
    for (position, &idx) in plan.order.iter().enumerate() {
        let node = graph.node(idx);
        let marker = if node.is_master() { " (master)".cyan() } else { "".normal() };
        println!("  {:>3}. {}{}", position + 1, node.id(), marker);
    }

    println!("\n{}", "--- Masters ---".bold());
    for master in &plan.masters {
        let node = graph.node(master.node);
        let isolation = node
            .execution_factory()
            .and_then(|factory| factory.isolation.as_ref())
            .map(|setup| format!("{:?}", setup.isolation))
            .unwrap_or_else(|| "Local".to_string());
        println!("  - {} [{}]", node.id().to_string().green(), isolation.dimmed());

        if !master.upstream_masters.is_empty() {
            let after: Vec<String> = master
                .upstream_masters
                .iter()
                .map(|&up| graph.node(up).id().to_string())
                .collect();
            println!("      after: {}", after.join(", "));
        }
        for nested in graph.nested_masters(master.node) {
            println!("      nested: {}", graph.node(nested).id());
        }
    }

    if !plan.orphans.is_empty() {
        println!(
            "\n{} {} node(s) are not covered by any master and will be skipped.",
            "Note:".yellow(),
            plan.orphans.len()
        );
    }
}
