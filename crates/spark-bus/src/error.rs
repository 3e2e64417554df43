//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为总线对外暴露的错误语义提供集中定义，命令面最终只向调用方返回一个整数状态；
//! - 归档命名空间/端点解析、连接生命周期、消息队列与名称注册表等不同类别，方便运维与观测。
//!
//! ## 设计要求（What）
//! - 所有错误类型实现 `thiserror::Error`；
//! - [`BusError::errno`] 给出稳定的负 errno，[`BusError::code`] 给出稳定的点分错误码；
//! - 除超时扫描器的自我重排外，不在内部重试任何错误。

use thiserror::Error;

/// crate 内统一的 `Result` 别名。
pub type Result<T, E = BusError> = std::result::Result<T, E>;

/// errno 常量，与 Linux 数值保持一致。
pub mod errno {
    pub const EPERM: i32 = 1;
    pub const ENOENT: i32 = 2;
    pub const EAGAIN: i32 = 11;
    pub const ENOMEM: i32 = 12;
    pub const EFAULT: i32 = 14;
    pub const EBUSY: i32 = 16;
    pub const EEXIST: i32 = 17;
    pub const EINVAL: i32 = 22;
    pub const ENOTTY: i32 = 25;
    pub const ENOSPC: i32 = 28;
    pub const ENOSYS: i32 = 38;
    pub const ECONNRESET: i32 = 104;
    pub const ENOTSUPP: i32 = 524;
}

/// 总线核心错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：聚合连接生命周期、消息投递与名称注册等关键路径的异常，借助细粒度枚举帮助
///   调用方快速定位故障来源。
/// - **契约 (What)**：
///   - 所有变体均为 `Send + Sync + 'static`，可安全跨线程传播；
///   - 每个变体对应唯一的 errno，见 [`BusError::errno`]；
///   - 变体携带的上下文（设备号、连接 id、名称）只用于诊断，不参与相等性以外的逻辑。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum BusError {
    /// 命名空间、总线、端点、连接或名称不存在（或已断开）。
    #[error("{what} not found")]
    NotFound { what: String },

    /// 标识或名称冲突。
    ///
    /// - **契约 (What)**：`what` 描述冲突对象，例如 `connection id 7`、`bus "system"`。
    #[error("{what} already exists")]
    AlreadyExists { what: String },

    /// 连接已完成 HELLO 激活，禁止重复激活。
    #[error("connection {id} is already active")]
    Busy { id: u64 },

    /// 标志位使用了保留的高 32 位。
    #[error("unsupported flags {flags:#x}: bits above the low 32 are reserved")]
    Unsupported { flags: u64 },

    /// 保留但尚未实现的命令族（策略、匹配、监听）。
    #[error("command {command} is not implemented")]
    NotImplemented { command: &'static str },

    /// 命令与连接类型不匹配，或参数非法。
    #[error("invalid argument: {detail}")]
    InvalidArgument { detail: String },

    /// 未识别的命令码。
    #[error("no such command {code:#x}")]
    NoSuchCommand { code: u32 },

    /// 资源耗尽：线程创建失败或连接队列配额用尽。
    #[error("out of memory: {detail}")]
    OutOfMemory { detail: String },

    /// 负载布局与命令码不符，等价于用户缓冲区拷贝失败。
    #[error("bad address: payload for {command} has the wrong layout")]
    BadAddress { command: &'static str },

    /// 非阻塞读取时队列为空，或阻塞读取超时。
    #[error("no message available")]
    WouldBlock,

    /// 调用方不是名称的持有者。
    #[error("connection {id} does not own name \"{name}\"")]
    NotOwner { id: u64, name: String },

    /// 端点在阻塞读取期间断开。
    #[error("endpoint \"{endpoint}\" disconnected")]
    Disconnected { endpoint: String },

    /// 总线的连接 id 空间已耗尽。
    #[error("connection id space of bus \"{bus}\" is exhausted")]
    IdSpaceExhausted { bus: String },
}

impl BusError {
    /// 快速构造 [`BusError::NotFound`]。
    pub fn not_found(what: impl Into<String>) -> Self {
        BusError::NotFound { what: what.into() }
    }

    /// 快速构造 [`BusError::AlreadyExists`]。
    pub fn already_exists(what: impl Into<String>) -> Self {
        BusError::AlreadyExists { what: what.into() }
    }

    /// 快速构造 [`BusError::InvalidArgument`]。
    pub fn invalid_argument(detail: impl Into<String>) -> Self {
        BusError::InvalidArgument {
            detail: detail.into(),
        }
    }

    /// 对应的负 errno，命令面据此返回整数状态。
    pub fn errno(&self) -> i32 {
        let positive = match self {
            BusError::NotFound { .. } => errno::ENOENT,
            BusError::AlreadyExists { .. } => errno::EEXIST,
            BusError::Busy { .. } => errno::EBUSY,
            BusError::Unsupported { .. } => errno::ENOTSUPP,
            BusError::NotImplemented { .. } => errno::ENOSYS,
            BusError::InvalidArgument { .. } => errno::EINVAL,
            BusError::NoSuchCommand { .. } => errno::ENOTTY,
            BusError::OutOfMemory { .. } => errno::ENOMEM,
            BusError::BadAddress { .. } => errno::EFAULT,
            BusError::WouldBlock => errno::EAGAIN,
            BusError::NotOwner { .. } => errno::EPERM,
            BusError::Disconnected { .. } => errno::ECONNRESET,
            BusError::IdSpaceExhausted { .. } => errno::ENOSPC,
        };
        -positive
    }

    /// 稳定的点分错误码，用于日志字段与告警聚合。
    pub fn code(&self) -> &'static str {
        match self {
            BusError::NotFound { .. } => "bus.not_found",
            BusError::AlreadyExists { .. } => "bus.already_exists",
            BusError::Busy { .. } => "bus.connection.busy",
            BusError::Unsupported { .. } => "bus.flags.unsupported",
            BusError::NotImplemented { .. } => "bus.command.not_implemented",
            BusError::InvalidArgument { .. } => "bus.invalid_argument",
            BusError::NoSuchCommand { .. } => "bus.command.unknown",
            BusError::OutOfMemory { .. } => "bus.out_of_memory",
            BusError::BadAddress { .. } => "bus.command.bad_address",
            BusError::WouldBlock => "bus.queue.empty",
            BusError::NotOwner { .. } => "bus.name.not_owner",
            BusError::Disconnected { .. } => "bus.endpoint.disconnected",
            BusError::IdSpaceExhausted { .. } => "bus.id.exhausted",
        }
    }
}

/// 配置解析错误。
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 读取配置文件失败。
    #[error("failed to read configuration from {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// TOML 语法或字段不匹配。
    #[error("malformed configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// 字段取值越界。
    #[error("invalid configuration value for `{key}`: {detail}")]
    Invalid { key: &'static str, detail: String },
}
