//! # Reporting Module / 报告模块
//!
//! This module handles progress reporting during a run and the console
//! summary printed after it.
//!
//! 此模块处理运行期间的进度报告以及运行结束后打印的控制台摘要。

pub mod console;
pub mod progress;

// Re-export common reporting items
pub use console::{print_fault_details, print_plan, print_summary};
pub use progress::{ProgressHandle, ProgressPresenter, ProgressReporter};
