//! # Core Module / 核心模块
//!
//! This module contains the core functionality of Plan Runner: the test node
//! graph, execution planning, the controller API, the wire protocol spoken
//! with isolated hosts, and the scheduler that drives a run.
//!
//! 此模块包含 Plan Runner 的核心功能：测试节点图、执行计划、控制器接口、
//! 与隔离宿主通信的协议，以及驱动一次运行的调度器。

pub mod command_controller;
pub mod config;
pub mod controller;
pub mod error;
pub mod graph;
pub mod models;
pub mod planner;
pub mod protocol;
pub mod scheduler;
pub mod status;

// Re-exports
pub use controller::{ControllerContext, ControllerFactory, ExecutionFactory, TestController};
pub use error::{CycleError, GraphError, HostError, RemoteFaultError};
pub use graph::TestGraph;
pub use models::{NodeId, NodeIndex, NodeSpec, TerminalStatus};
pub use scheduler::Scheduler;
