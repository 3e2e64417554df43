//! 日志订阅器安装入口。
//!
//! # 教案式说明
//! - **契约（What）**：[`init_tracing`] 组装 `fmt + EnvFilter` 订阅器并设为全局默认；
//!   过滤规则读取 `RUST_LOG`，缺省为 `info`。外部已设置全局订阅器时返回
//!   [`TelemetryError::SubscriberAlreadySet`]，不会覆盖。
//! - **执行（How）**：库内所有日志均通过 `tracing` 宏输出，字段名统一为 `bus`、`endpoint`、
//!   `conn_id`、`cookie` 等，安装订阅器由宿主决定是否调用。

use thiserror::Error;
use tracing::dispatcher;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

/// 订阅器安装失败。
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// 全局 `tracing` 订阅器已存在。
    #[error("a global tracing subscriber is already installed")]
    SubscriberAlreadySet,
    /// 设置全局订阅器的底层错误。
    #[error("failed to install tracing subscriber: {0}")]
    SetGlobalSubscriber(#[from] tracing::dispatcher::SetGlobalDefaultError),
}

/// 安装全局日志订阅器。
pub fn init_tracing() -> Result<(), TelemetryError> {
    if dispatcher::has_been_set() {
        return Err(TelemetryError::SubscriberAlreadySet);
    }

    let subscriber = tracing_subscriber::registry()
        .with(build_env_filter())
        .with(tracing_subscriber::fmt::layer().with_thread_names(true));
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}
