//! # Init Command Module / 初始化命令模块
//!
//! This module implements the `init` command, which writes a sample plan
//! file to get started with.
//!
//! 此模块实现了 `init` 命令，用于写入一个示例计划文件。

use anyhow::{Context, Result, bail};
use colored::*;
use std::{fs, path::Path};

const SAMPLE_PLAN: &str = r#"# Plan Runner plan file / 计划文件
#
# Nodes form a tree through `parent`. A node with `master = true` or a
# `[nodes.host]` table is a master: it runs inside its own isolated host
# once every node it depends on has passed.

[settings]
jobs = 4                    # Masters running at the same time / 同时运行的主节点数
grace_period_secs = 5       # Time granted after Ctrl-C / Ctrl-C 后的宽限时间
invoke_timeout_secs = 300   # Limit for a single remote call / 单次远程调用的时限
handshake_timeout_secs = 10

[[nodes]]
id = "build"
master = true

[[nodes]]
id = "build/compile"
parent = "build"
command = "echo compiling"

[[nodes]]
id = "integration"
dependencies = ["build"]

[nodes.host]
isolation = "process"       # in_process, process or sandbox

[nodes.host.configuration.settings]
profile = "ci"

[[nodes]]
id = "integration/smoke"
parent = "integration"
command = "echo smoke"

[[nodes]]
id = "integration/api"
parent = "integration"
command = "echo api"
dependencies = ["integration/smoke"]
"#;

/// Executes the init command.
///
/// # Arguments
/// * `output` - Path for the new plan file
/// * `force` - Whether to overwrite an existing file
pub fn execute(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        bail!(
            "{} already exists, use --force to overwrite it",
            output.display()
        );
    }

    if let Some(parent) = output.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }

    fs::write(output, SAMPLE_PLAN)
        .with_context(|| format!("Failed to write plan file to {}", output.display()))?;

    println!(
        "{} {}",
        "Created plan file at".green(),
        output.display().to_string().bold()
    );
    println!(
        "{}",
        "Run `plan-runner plan` to check it, then `plan-runner run`.".dimmed()
    );
    Ok(())
}
