//! # 命令面
//!
//! ## 核心意图（Why）
//! - 把控制设备与端点设备上的数字命令码翻译为生命周期、名称注册表与消息层的操作；
//! - 对外只暴露一个整数状态（0 或负 errno）加可选的输出负载。
//!
//! ## 行为契约（What）
//! - 命令码先于连接类型校验：未识别的命令码一律 *no-such-command*；
//! - 属于另一种连接类型的命令，以及落在 bus-owner / namespace-owner 连接上的任何命令，
//!   返回 *invalid-argument*；
//! - 负载布局与命令码不符返回 *bad-address*；
//! - 每个标志字段在动作前校验，高 32 位任一置位即 *unsupported*；
//! - 策略、匹配与监听命令保留，返回 *not-implemented*。

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use crate::core::connection::{Connection, ConnectionKind};
use crate::core::message::{Destination, Envelope};
use crate::core::names::{AcquireOutcome, NameInfo};
use crate::error::{BusError, Result};

/// HELLO 标志：连接以 starter 身份激活。
pub const HELLO_STARTER: u64 = 1 << 0;

/// 拒绝高 32 位中的任何置位。
pub fn check_kernel_flags(flags: u64) -> Result<()> {
    if flags > u64::from(u32::MAX) {
        return Err(BusError::Unsupported { flags });
    }
    Ok(())
}

/// 命令码。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u32)]
pub enum CommandCode {
    BusMake = 0x10,
    NsMake = 0x20,
    BusPolicySet = 0x30,
    EpMake = 0x40,
    Hello = 0x50,
    EpPolicySet = 0x60,
    NameAcquire = 0x70,
    NameRelease = 0x71,
    NameList = 0x72,
    NameQuery = 0x73,
    MatchAdd = 0x80,
    MatchRemove = 0x81,
    Monitor = 0x82,
    MsgSend = 0x90,
    MsgRecv = 0x91,
}

impl CommandCode {
    pub const fn name(self) -> &'static str {
        match self {
            CommandCode::BusMake => "bus-make",
            CommandCode::NsMake => "ns-make",
            CommandCode::BusPolicySet => "bus-policy-set",
            CommandCode::EpMake => "ep-make",
            CommandCode::Hello => "hello",
            CommandCode::EpPolicySet => "ep-policy-set",
            CommandCode::NameAcquire => "name-acquire",
            CommandCode::NameRelease => "name-release",
            CommandCode::NameList => "name-list",
            CommandCode::NameQuery => "name-query",
            CommandCode::MatchAdd => "match-add",
            CommandCode::MatchRemove => "match-remove",
            CommandCode::Monitor => "monitor",
            CommandCode::MsgSend => "msg-send",
            CommandCode::MsgRecv => "msg-recv",
        }
    }

    /// 控制连接接受的命令。
    pub const fn is_control(self) -> bool {
        matches!(
            self,
            CommandCode::BusMake | CommandCode::NsMake | CommandCode::BusPolicySet
        )
    }
}

impl TryFrom<u32> for CommandCode {
    type Error = BusError;

    fn try_from(code: u32) -> Result<Self> {
        let command = match code {
            0x10 => CommandCode::BusMake,
            0x20 => CommandCode::NsMake,
            0x30 => CommandCode::BusPolicySet,
            0x40 => CommandCode::EpMake,
            0x50 => CommandCode::Hello,
            0x60 => CommandCode::EpPolicySet,
            0x70 => CommandCode::NameAcquire,
            0x71 => CommandCode::NameRelease,
            0x72 => CommandCode::NameList,
            0x73 => CommandCode::NameQuery,
            0x80 => CommandCode::MatchAdd,
            0x81 => CommandCode::MatchRemove,
            0x82 => CommandCode::Monitor,
            0x90 => CommandCode::MsgSend,
            0x91 => CommandCode::MsgRecv,
            other => return Err(BusError::NoSuchCommand { code: other }),
        };
        Ok(command)
    }
}

/// BUS_MAKE / NS_MAKE / EP_MAKE 的负载。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MakeCmd {
    pub name: String,
    /// 内核标志，高 32 位保留。
    pub flags: u64,
    /// 仅 BUS_MAKE 使用，原样记录在总线上。
    pub bus_flags: u64,
    pub mode: u32,
}

impl MakeCmd {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct HelloCmd {
    pub flags: u64,
}

/// 名称获取、释放与查询的负载。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NameCmd {
    pub name: String,
    pub flags: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SendCmd {
    pub dst: Destination,
    pub cookie: u64,
    pub flags: u64,
    /// 相对超时；发送时按注入时钟换算为绝对截止时间。
    pub timeout: Option<Duration>,
    pub body: Bytes,
}

impl SendCmd {
    pub fn new(dst: Destination, cookie: u64, body: impl Into<Bytes>) -> Self {
        Self {
            dst,
            cookie,
            flags: 0,
            timeout: None,
            body: body.into(),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// 读取方式。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum RecvMode {
    /// 队列为空立即返回 *would-block*。
    #[default]
    NonBlocking,
    /// 阻塞直到有消息、端点断开或可选超时到期（按真实时间计）。
    Blocking { timeout: Option<Duration> },
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RecvCmd {
    pub flags: u64,
    pub mode: RecvMode,
}

impl RecvCmd {
    pub fn non_blocking() -> Self {
        Self::default()
    }

    pub fn blocking(timeout: Option<Duration>) -> Self {
        Self {
            flags: 0,
            mode: RecvMode::Blocking { timeout },
        }
    }
}

/// 命令负载。
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CommandArg {
    None,
    /// 只携带标志字段的命令（NAME_LIST 与保留命令）。
    Flags(u64),
    Make(MakeCmd),
    Hello(HelloCmd),
    Name(NameCmd),
    Send(SendCmd),
    Recv(RecvCmd),
}

/// 命令的输出负载。
#[derive(Clone, Debug)]
pub enum Reply {
    Done,
    /// HELLO 返回分配的连接 id。
    Hello { id: u64 },
    Acquired(AcquireOutcome),
    Released { new_owner: Option<u64> },
    Names(Vec<NameInfo>),
    Name(NameInfo),
    Sent { delivered: usize },
    Message(Arc<Envelope>),
}

impl Connection {
    /// 执行一条命令。
    pub fn dispatch(&self, code: u32, arg: CommandArg) -> Result<Reply> {
        let command = CommandCode::try_from(code)?;
        let result = match self.kind() {
            ConnectionKind::Control => self.dispatch_control(command, arg),
            ConnectionKind::Endpoint => self.dispatch_endpoint(command, arg),
            kind => Err(BusError::invalid_argument(format!(
                "{kind} connection accepts no commands"
            ))),
        };
        if let Err(err) = &result {
            debug!(
                device = %self.device(),
                command = command.name(),
                code = err.code(),
                "command failed"
            );
        }
        result
    }

    /// 整数状态视图：成功返回输出负载，失败返回负 errno。
    pub fn ioctl(&self, code: u32, arg: CommandArg) -> std::result::Result<Reply, i32> {
        self.dispatch(code, arg).map_err(|err| err.errno())
    }

    fn dispatch_control(&self, command: CommandCode, arg: CommandArg) -> Result<Reply> {
        match command {
            CommandCode::BusMake => {
                let cmd = expect_make(command, arg)?;
                self.bus_make(&cmd)?;
                Ok(Reply::Done)
            }
            CommandCode::NsMake => {
                let cmd = expect_make(command, arg)?;
                self.ns_make(&cmd)?;
                Ok(Reply::Done)
            }
            CommandCode::BusPolicySet => Err(BusError::NotImplemented {
                command: command.name(),
            }),
            other => Err(BusError::invalid_argument(format!(
                "{} is not a control command",
                other.name()
            ))),
        }
    }

    fn dispatch_endpoint(&self, command: CommandCode, arg: CommandArg) -> Result<Reply> {
        match (command, arg) {
            (CommandCode::EpMake, CommandArg::Make(cmd)) => {
                self.ep_make(&cmd)?;
                Ok(Reply::Done)
            }
            (CommandCode::Hello, CommandArg::Hello(cmd)) => {
                self.hello(cmd).map(|id| Reply::Hello { id })
            }
            (CommandCode::NameAcquire, CommandArg::Name(cmd)) => {
                self.name_acquire(&cmd).map(Reply::Acquired)
            }
            (CommandCode::NameRelease, CommandArg::Name(cmd)) => self
                .name_release(&cmd)
                .map(|new_owner| Reply::Released { new_owner }),
            (CommandCode::NameList, CommandArg::Flags(flags)) => {
                self.name_list(flags).map(Reply::Names)
            }
            (CommandCode::NameQuery, CommandArg::Name(cmd)) => {
                self.name_query(&cmd).map(Reply::Name)
            }
            (CommandCode::MsgSend, CommandArg::Send(cmd)) => {
                self.send(cmd).map(|delivered| Reply::Sent { delivered })
            }
            (CommandCode::MsgRecv, CommandArg::Recv(cmd)) => self.recv(cmd).map(Reply::Message),
            (
                CommandCode::EpPolicySet
                | CommandCode::MatchAdd
                | CommandCode::MatchRemove
                | CommandCode::Monitor,
                _,
            ) => Err(BusError::NotImplemented {
                command: command.name(),
            }),
            (command, _) if command.is_control() => Err(BusError::invalid_argument(format!(
                "{} is not an endpoint command",
                command.name()
            ))),
            (command, _) => Err(BusError::BadAddress {
                command: command.name(),
            }),
        }
    }
}

fn expect_make(command: CommandCode, arg: CommandArg) -> Result<MakeCmd> {
    match arg {
        CommandArg::Make(cmd) => Ok(cmd),
        _ => Err(BusError::BadAddress {
            command: command.name(),
        }),
    }
}
