//! # Plan Command Module / 计划命令模块
//!
//! Validates a plan file and prints the execution order without running
//! anything.
//!
//! 验证计划文件并打印执行顺序，不运行任何内容。

use anyhow::{Context, Result};
use colored::*;
use std::{path::PathBuf, sync::Arc};

use crate::{
    core::{
        command_controller::CommandControllerFactory, config::PlanFile, graph::TestGraph,
        planner::plan_execution,
    },
    reporting::console::print_plan,
};

pub fn execute(plan: PathBuf) -> Result<()> {
    let plan_file = PlanFile::load(&plan)?;
    let (roots, edges) = plan_file.into_graph_input(Arc::new(CommandControllerFactory))?;

    let graph = TestGraph::build(roots, edges).context("The plan is not a valid test graph")?;
    let plan = plan_execution(Arc::new(graph)).context("The masters cannot be ordered")?;

    print_plan(&plan);
    println!("\n{}", "Plan is valid.".green().bold());
    Ok(())
}
