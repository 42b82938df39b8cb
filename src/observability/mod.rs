//! 可观测性：日志初始化
//!
//! 默认级别 info，可通过 RUST_LOG 覆盖（如 `RUST_LOG=todowa=debug`）。

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 安装全局日志；重复调用（如多个测试）时返回 false
pub fn init() -> bool {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init()
        .is_ok()
}
