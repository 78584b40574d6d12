//! 可观测性：tracing 初始化与 token 用量账本

pub mod usage;

pub use usage::{UsageLedger, UsageRecord, UsageTotals};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 安装全局 subscriber；默认 info，可由 RUST_LOG 覆盖。日志写 stderr，stdout 留给最终回复
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
