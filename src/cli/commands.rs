//! # Commands Module / 命令模块
//!
//! One module per `plan-runner` subcommand.
//!
//! 每个 `plan-runner` 子命令对应一个模块。

pub mod agent;
pub mod init;
pub mod plan;
pub mod run;
