//! # Plan Runner Library / Plan Runner 库
//!
//! This library provides the core functionality for the Plan Runner tool,
//! a dependency-aware test scheduler that runs master test nodes inside
//! isolated hosts and reports their progress back to a coordinator.
//!
//! 此库为 Plan Runner 工具提供核心功能，
//! 这是一个感知依赖关系的测试调度器，它在隔离的宿主中运行主测试节点，
//! 并将其进度报告回协调器。
//!
//! ## Modules / 模块
//!
//! - `core` - Node graph, planning, controllers and the scheduler
//! - `infra` - Isolated hosts, boundaries, the control channel and process helpers
//! - `reporting` - Progress reporting and the console summary
//! - `cli` - Command-line interface and commands
//!
//! - `core` - 节点图、执行计划、控制器和调度器
//! - `infra` - 隔离宿主、隔离边界、控制通道和进程工具
//! - `reporting` - 进度报告和控制台摘要
//! - `cli` - 命令行接口和命令

pub mod core;
pub mod infra;
pub mod reporting;
pub mod cli;

// Re-export commonly used items
pub use core::config;
pub use core::graph;
pub use core::models;
pub use core::scheduler;
