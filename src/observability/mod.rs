//! 可观测性：tracing 订阅器初始化
//!
//! RUST_LOG 优先，未设置时使用配置中的级别；format = "json" 时输出结构化 JSON 日志。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{LogFormat, LoggingSection};

fn env_filter(cfg: &LoggingSection) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level))
}

/// 安装全局订阅器；重复调用（例如测试中）时静默忽略
pub fn init(cfg: &LoggingSection) {
    let registry = tracing_subscriber::registry().with(env_filter(cfg));
    let result = match cfg.format {
        LogFormat::Plain => registry.with(fmt::layer().with_target(false)).try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().flatten_event(true).with_current_span(false))
            .try_init(),
    };
    if result.is_ok() {
        tracing::debug!(level = %cfg.level, format = ?cfg.format, "Logging initialized");
    }
}
