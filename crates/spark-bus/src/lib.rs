//! # spark-bus
//!
//! ## 定位与职责（Why）
//! - 进程内消息总线的连接生命周期与消息队列引擎：客户端打开总线端点，经由共享的总线对象
//!   按连接 id、知名名称或广播互发消息；
//! - 每个连接拥有独立的 FIFO 队列与后台超时扫描定时器，过期消息被回收并向发送方投递超时通知；
//! - 关闭连接时保证不留下悬挂的队列条目、id 表条目或名称登记。
//!
//! ## 架构嵌入（Where）
//! - `core` 模块负责命名空间、总线、端点、连接与队列；
//! - `command` 模块把数字命令码翻译为 `core` 上的操作，并给出整数状态；
//! - `error` 模块集中定义错误类型与 errno 映射；
//! - `config`、`telemetry`、`time` 提供配置加载、日志订阅器与可注入时钟。
//!
//! ## 快速上手（How）
//! ```
//! use spark_bus::{BusConfig, CommandArg, CommandCode, DeviceId, MakeCmd, Subsystem};
//!
//! let subsystem = Subsystem::new(BusConfig::default())?;
//! let control = subsystem.open(DeviceId::control(0))?;
//! control.dispatch(CommandCode::BusMake as u32, CommandArg::Make(MakeCmd::named("system")))?;
//!
//! let endpoint = subsystem.root().endpoint(1)?;
//! let conn = subsystem.open(endpoint.device())?;
//! assert_eq!(conn.id(), Some(1));
//! conn.close();
//! control.close();
//! # Ok::<(), spark_bus::BusError>(())
//! ```

/// 命令码、负载与命令分派。
pub mod command;

/// 子系统配置与 TOML 加载。
pub mod config;

/// 连接生命周期与消息队列的核心实现。
///
/// - **意图说明 (Why)**：集中处理设备解析、连接登记、队列与超时扫描；
/// - **契约定位 (What)**：所有共享对象以 `Arc` 持有，锁序固定为
///   子系统表 → 命名空间 → 端点 → 队列 → 定时器。
pub mod core;

/// 错误类型与 errno 映射。
///
/// - **契约定位 (What)**：使用 `thiserror::Error` 派生，每个变体对应稳定的 errno 与点分错误码。
pub mod error;

/// 全局日志订阅器安装。
pub mod telemetry;

/// 可注入时钟。
pub mod time;

pub use command::{
    CommandArg, CommandCode, HELLO_STARTER, HelloCmd, MakeCmd, NameCmd, RecvCmd, RecvMode, Reply,
    SendCmd, check_kernel_flags,
};
pub use config::BusConfig;
pub use crate::core::{
    AcquireOutcome, Bus, Connection, ConnectionKind, DeviceId, Destination, Endpoint, Envelope,
    KERNEL_ID, NameFlags, NameInfo, Namespace, Payload, Readiness, ScanReport, Subsystem,
};
pub use error::{BusError, ConfigError, Result};
pub use time::{Clock, MockClock, SystemClock};
