//! # Command Execution Module / 命令执行模块
//!
//! Parsing and running the shell commands of test cases.
//!
//! 解析并运行测试用例的 shell 命令。

use anyhow::{Context, Result, anyhow, bail};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

/// Expands environment variables and `~` in a command line, then splits it
/// into a program and its arguments with shell quoting rules.
///
/// 展开命令行中的环境变量和 `~`，然后按 shell 引号规则将其拆分为程序及其参数。
pub fn parse_command(command_line: &str) -> Result<(String, Vec<String>)> {
    let expanded = shellexpand::full(command_line)
        .with_context(|| format!("Failed to expand command: {command_line}"))?
        .to_string();

    let mut parts = shlex::split(&expanded)
        .ok_or_else(|| anyhow!("Failed to parse command: {}", expanded))?;
    if parts.is_empty() {
        bail!("Empty command after parsing.");
    }
    let program = parts.remove(0);
    Ok((program, parts))
}

/// Spawns a command and captures its stdout and stderr.
/// The output streams are read concurrently and combined into a single string;
/// `on_line` sees every line as soon as it is read.
///
/// # Returns
/// A tuple containing:
/// - The `ExitStatus` of the process wrapped in an `io::Result`.
/// - The combined stdout and stderr as a `String`.
///
/// 派生一个命令，捕获其 stdout 和 stderr。
/// 输出流被并发读取并合并到一个字符串中；`on_line` 在每一行被读取后立即看到它。
pub async fn spawn_and_capture<F>(
    mut cmd: Command,
    on_line: F,
) -> (std::io::Result<ExitStatus>, String)
where
    F: Fn(&str) + Send + Sync + 'static,
{
    let mut child = match cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => return (Err(e), String::new()),
    };

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return (
            Err(std::io::Error::other("Failed to capture child output")),
            String::new(),
        );
    };

    let output = Arc::new(tokio::sync::Mutex::new(String::new()));
    let on_line = Arc::new(on_line);

    let stdout_handle = tokio::spawn(collect_lines(stdout, Arc::clone(&output), Arc::clone(&on_line)));
    let stderr_handle = tokio::spawn(collect_lines(stderr, Arc::clone(&output), on_line));

    let status = child.wait().await;

    // Wait for both readers so that all output is captured.
    for handle in [stdout_handle, stderr_handle] {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "output reader task failed");
        }
    }

    let captured = output.lock().await.clone();
    (status, captured)
}

async fn collect_lines<R, F>(stream: R, output: Arc<tokio::sync::Mutex<String>>, on_line: Arc<F>)
where
    R: AsyncRead + Unpin,
    F: Fn(&str) + Send + Sync,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        on_line(&line);
        let mut output = output.lock().await;
        output.push_str(&line);
        output.push('\n');
    }
}
