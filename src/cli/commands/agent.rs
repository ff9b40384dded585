//! # Agent Command Module / 代理命令模块
//!
//! The hidden `agent` command: the child side of a process boundary.
//!
//! 隐藏的 `agent` 命令：进程边界的子进程端。

use anyhow::Result;
use std::sync::Arc;

use crate::infra::agent::{CommandService, run_stdio};

pub async fn execute() -> Result<()> {
    run_stdio(Arc::new(CommandService)).await
}
