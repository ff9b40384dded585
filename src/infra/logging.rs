//! # Logging Module / 日志模块
//!
//! Installs the global `tracing` subscriber. Logs always go to stderr: the
//! agent process reserves stdout for protocol frames.
//!
//! 安装全局 `tracing` 订阅者。日志始终写入 stderr：代理进程将 stdout 保留给协议帧。

use tracing_subscriber::EnvFilter;

/// Initialises logging once. `RUST_LOG` takes precedence over `default_level`.
/// Calling it again is a no-op.
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("plan_runner={default_level}")));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init();
}
