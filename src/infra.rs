//! # Infrastructure Module / 基础设施模块
//!
//! This module provides infrastructure services for Plan Runner: isolated
//! hosts and their boundaries, the control channel, the agent side of the
//! protocol, command execution, file system helpers and logging setup.
//!
//! 此模块为 Plan Runner 提供基础设施服务：隔离宿主及其边界、控制通道、
//! 协议的代理端、命令执行、文件系统工具以及日志设置。

pub mod agent;
pub mod boundary;
pub mod channel;
pub mod command;
pub mod fs;
pub mod host;
pub mod logging;

pub use agent::{CommandService, HostService};
pub use boundary::{BoundaryLauncher, DefaultLauncher};
pub use host::{IsolatedEnvironment, IsolatedHost, LifecycleState};
