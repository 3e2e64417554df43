//! # 连接生命周期（Connection）
//!
//! ## 核心意图（Why）
//! - 把“打开设备 → 激活 → 收发 → 关闭”的生命周期编码进类型：连接持有的端点、总线或命名空间引用
//!   只在对应的连接类型下存在，由内部的 `Role` 枚举保证；
//! - 关闭必须留下干净的现场：没有悬挂的队列条目、名称登记或 id 表条目。
//!
//! ## 架构定位（Where）
//! - 由 [`Subsystem::open`](super::subsystem::Subsystem::open) 创建；命令面
//!   [`dispatch`](Connection::dispatch) 在 `command` 模块中为其扩展；
//! - 端点连接的可寻址部分是 [`Peer`]，登记在总线 id 表中供路由与超时扫描使用。
//!
//! ## 状态机约束（What）
//! - 合法跃迁：`Control → BusOwner`（BUS_MAKE）、`Control → NamespaceOwner`（NS_MAKE）；
//!   端点连接的类型不再变化，只会经 HELLO 置位一次 `active`；
//! - [`close`](Connection::close) 按值消费连接，关闭之后不存在任何可调用的句柄；
//!   未显式关闭的连接在 `Drop` 中执行同样的拆除。
//!
//! ## 锁序
//! - 连接的 `role` 锁先于子系统表锁、命名空间锁、端点锁、队列锁与定时器锁。

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tracing::{debug, info};

use super::bus::Bus;
use super::endpoint::Endpoint;
use super::message::Envelope;
use super::names::{AcquireOutcome, NameInfo};
use super::namespace::Namespace;
use super::peer::{Peer, ScanReport};
use super::subsystem::{DeviceId, Subsystem};
use crate::command::{
    HELLO_STARTER, HelloCmd, MakeCmd, NameCmd, RecvCmd, RecvMode, SendCmd, check_kernel_flags,
};
use crate::error::{BusError, Result};

/// 连接类型。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ConnectionKind {
    Control,
    NamespaceOwner,
    BusOwner,
    Endpoint,
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConnectionKind::Control => "control",
            ConnectionKind::NamespaceOwner => "namespace-owner",
            ConnectionKind::BusOwner => "bus-owner",
            ConnectionKind::Endpoint => "endpoint",
        };
        f.write_str(text)
    }
}

/// 就绪状态。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Readiness {
    /// 队列非空。
    Readable,
    /// 队列为空，端点仍在线。
    Idle,
    /// 队列为空且端点已断开。
    Hangup,
    /// 非端点连接不可读写。
    Error,
}

#[derive(Clone, Debug)]
struct EndpointLink {
    endpoint: Arc<Endpoint>,
    peer: Arc<Peer>,
}

impl EndpointLink {
    fn bus(&self) -> &Arc<Bus> {
        self.endpoint.bus()
    }
}

#[derive(Debug)]
enum Role {
    Control,
    NamespaceOwner(Arc<Namespace>),
    BusOwner(Arc<Bus>),
    Endpoint(EndpointLink),
    Released,
}

/// 一次设备打开对应的连接句柄。
pub struct Connection {
    subsystem: Subsystem,
    namespace: Arc<Namespace>,
    device: DeviceId,
    role: RwLock<Role>,
}

impl Connection {
    /// 打开设备。
    ///
    /// # 教案式注释
    /// - **契约 (What)**：
    ///   - 命名空间按 major 解析，不存在或已断开返回 *not-found*；
    ///   - minor 0 得到控制连接，只绑定命名空间；
    ///   - 其他 minor 解析端点，取号、登记 id 表、初始化队列、加入端点成员集合并启动未武装的定时器；
    /// - **后置条件**：失败时已经完成的登记全部撤销，不留下半初始化的连接。
    pub(crate) fn open(subsystem: &Subsystem, device: DeviceId) -> Result<Self> {
        let namespace = subsystem.namespace(device.major)?;
        if device.is_control() {
            info!(namespace = %namespace.name(), %device, "control connection opened");
            return Ok(Self {
                subsystem: subsystem.clone(),
                namespace,
                device,
                role: RwLock::new(Role::Control),
            });
        }

        let endpoint = namespace.endpoint(device.minor)?;
        let bus = Arc::clone(endpoint.bus());
        let id = bus.allocate_id()?;
        let config = namespace.config();
        let peer = Peer::new(
            id,
            Arc::downgrade(&bus),
            Arc::clone(endpoint.wait()),
            Arc::clone(subsystem.clock()),
            config.queue.max_pending,
        );
        bus.register(Arc::clone(&peer))?;
        let thread_name = format!("{}-{}-{id}", config.timer.thread_name_prefix, bus.name());
        if let Err(err) = peer.start_timer(thread_name) {
            bus.unregister(id);
            return Err(err);
        }
        endpoint.join(id);

        let connection = Self {
            subsystem: subsystem.clone(),
            namespace,
            device,
            role: RwLock::new(Role::Endpoint(EndpointLink { endpoint, peer })),
        };
        if let Some(link) = connection.endpoint_link_unchecked()
            && link.endpoint.is_disconnected()
        {
            let endpoint_name = link.endpoint.name().to_owned();
            connection.close();
            return Err(BusError::not_found(format!("endpoint \"{endpoint_name}\"")));
        }
        info!(
            namespace = %connection.namespace.name(),
            bus = %bus.name(),
            %device,
            conn_id = id,
            "endpoint connection opened"
        );
        Ok(connection)
    }

    pub fn kind(&self) -> ConnectionKind {
        match &*self.role.read() {
            Role::Control | Role::Released => ConnectionKind::Control,
            Role::NamespaceOwner(_) => ConnectionKind::NamespaceOwner,
            Role::BusOwner(_) => ConnectionKind::BusOwner,
            Role::Endpoint(_) => ConnectionKind::Endpoint,
        }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn namespace(&self) -> &Arc<Namespace> {
        &self.namespace
    }

    /// 端点连接的 id；其他类型返回 `None`。
    pub fn id(&self) -> Option<u64> {
        self.endpoint_link_unchecked().map(|link| link.peer.id())
    }

    pub fn is_active(&self) -> bool {
        self.endpoint_link_unchecked()
            .is_some_and(|link| link.peer.is_active())
    }

    pub fn is_starter(&self) -> bool {
        self.endpoint_link_unchecked()
            .is_some_and(|link| link.peer.is_starter())
    }

    /// 本连接拥有的总线（bus-owner）或所在的总线（endpoint）。
    pub fn bus(&self) -> Option<Arc<Bus>> {
        match &*self.role.read() {
            Role::BusOwner(bus) => Some(Arc::clone(bus)),
            Role::Endpoint(link) => Some(Arc::clone(link.bus())),
            _ => None,
        }
    }

    /// 本连接拥有的命名空间（namespace-owner）。
    pub fn owned_namespace(&self) -> Option<Arc<Namespace>> {
        match &*self.role.read() {
            Role::NamespaceOwner(ns) => Some(Arc::clone(ns)),
            _ => None,
        }
    }

    fn endpoint_link_unchecked(&self) -> Option<EndpointLink> {
        match &*self.role.read() {
            Role::Endpoint(link) => Some(link.clone()),
            _ => None,
        }
    }

    fn endpoint_link(&self, command: &str) -> Result<EndpointLink> {
        self.endpoint_link_unchecked().ok_or_else(|| {
            BusError::invalid_argument(format!(
                "{command} requires an endpoint connection, this one is {}",
                self.kind()
            ))
        })
    }

    /// BUS_MAKE：在所属命名空间中创建总线，并把控制连接转为 bus-owner。
    pub fn bus_make(&self, cmd: &MakeCmd) -> Result<Arc<Bus>> {
        let mut role = self.role.write();
        if !matches!(*role, Role::Control) {
            return Err(BusError::invalid_argument("bus-make requires a control connection"));
        }
        check_kernel_flags(cmd.flags)?;
        let bus = self.namespace.create_bus(&cmd.name, cmd.bus_flags, cmd.mode)?;
        *role = Role::BusOwner(Arc::clone(&bus));
        Ok(bus)
    }

    /// NS_MAKE：创建子命名空间，并把控制连接转为 namespace-owner。
    pub fn ns_make(&self, cmd: &MakeCmd) -> Result<Arc<Namespace>> {
        let mut role = self.role.write();
        if !matches!(*role, Role::Control) {
            return Err(BusError::invalid_argument("ns-make requires a control connection"));
        }
        check_kernel_flags(cmd.flags)?;
        let ns = self.subsystem.create_namespace(&cmd.name)?;
        *role = Role::NamespaceOwner(Arc::clone(&ns));
        Ok(ns)
    }

    /// EP_MAKE：在本连接所在的总线上创建新端点，连接本身的类型不变。
    pub fn ep_make(&self, cmd: &MakeCmd) -> Result<Arc<Endpoint>> {
        let link = self.endpoint_link("ep-make")?;
        check_kernel_flags(cmd.flags)?;
        self.namespace.create_endpoint(link.bus(), &cmd.name, cmd.mode)
    }

    /// HELLO：激活连接并返回 id；重复激活返回 *busy*。
    pub fn hello(&self, cmd: HelloCmd) -> Result<u64> {
        let link = self.endpoint_link("hello")?;
        if link.peer.is_active() {
            return Err(BusError::Busy { id: link.peer.id() });
        }
        check_kernel_flags(cmd.flags)?;
        let id = link.peer.activate(cmd.flags & HELLO_STARTER != 0)?;
        info!(
            bus = %link.bus().name(),
            conn_id = id,
            starter = link.peer.is_starter(),
            "connection activated"
        );
        Ok(id)
    }

    pub fn name_acquire(&self, cmd: &NameCmd) -> Result<AcquireOutcome> {
        let link = self.endpoint_link("name-acquire")?;
        check_kernel_flags(cmd.flags)?;
        link.bus().names().acquire(link.peer.id(), &cmd.name, cmd.flags)
    }

    pub fn name_release(&self, cmd: &NameCmd) -> Result<Option<u64>> {
        let link = self.endpoint_link("name-release")?;
        check_kernel_flags(cmd.flags)?;
        link.bus().names().release(link.peer.id(), &cmd.name)
    }

    pub fn name_list(&self, flags: u64) -> Result<Vec<NameInfo>> {
        let link = self.endpoint_link("name-list")?;
        check_kernel_flags(flags)?;
        Ok(link.bus().names().list())
    }

    pub fn name_query(&self, cmd: &NameCmd) -> Result<NameInfo> {
        let link = self.endpoint_link("name-query")?;
        check_kernel_flags(cmd.flags)?;
        link.bus().names().query(&cmd.name)
    }

    /// MSG_SEND：构造信封并路由，返回成功入队的连接数。
    pub fn send(&self, cmd: SendCmd) -> Result<usize> {
        let link = self.endpoint_link("msg-send")?;
        check_kernel_flags(cmd.flags)?;
        let mut envelope = Envelope::data(link.peer.id(), cmd.dst, cmd.cookie, cmd.body);
        if let Some(timeout) = cmd.timeout {
            let deadline = self
                .subsystem
                .clock()
                .now()
                .checked_add(timeout)
                .ok_or_else(|| BusError::invalid_argument("timeout overflows the clock"))?;
            envelope = envelope.with_deadline(deadline);
        }
        link.bus().route(envelope.into_shared())
    }

    /// MSG_RECV：按 FIFO 取出一条消息。
    ///
    /// # 教案式注释
    /// - **契约 (What)**：非阻塞模式队列为空返回 *would-block*；阻塞模式直到有消息、
    ///   端点断开（*connection-reset*）或超时（*would-block*）；
    /// - **执行 (How)**：每轮先记录端点等待条件的代数再尝试出队，入队方在释放队列锁后推进代数，
    ///   因此两步之间的入队不会丢失唤醒。
    pub fn recv(&self, cmd: RecvCmd) -> Result<Arc<Envelope>> {
        let link = self.endpoint_link("msg-recv")?;
        check_kernel_flags(cmd.flags)?;
        let give_up = match cmd.mode {
            RecvMode::Blocking {
                timeout: Some(timeout),
            } => Instant::now().checked_add(timeout),
            _ => None,
        };
        let wait = link.endpoint.wait();
        loop {
            let observed = wait.generation();
            if let Some(envelope) = link.peer.dequeue() {
                debug!(conn_id = link.peer.id(), cookie = envelope.cookie(), "message received");
                return Ok(envelope);
            }
            if link.endpoint.is_disconnected() {
                return Err(BusError::Disconnected {
                    endpoint: link.endpoint.name().to_owned(),
                });
            }
            if cmd.mode == RecvMode::NonBlocking {
                return Err(BusError::WouldBlock);
            }
            if !wait.wait_past(observed, give_up) {
                return Err(BusError::WouldBlock);
            }
        }
    }

    /// 直接把信封放入本连接的队列。
    pub fn enqueue(&self, envelope: Arc<Envelope>) -> Result<()> {
        self.endpoint_link("enqueue")?.peer.enqueue(envelope)
    }

    /// 立即执行一次超时扫描；通常由后台定时器触发。
    pub fn scan_timeouts(&self) -> Result<ScanReport> {
        Ok(self.endpoint_link("scan")?.peer.scan_timeouts())
    }

    /// 队列中待投递的条目数；非端点连接为 0。
    pub fn pending(&self) -> usize {
        self.endpoint_link_unchecked()
            .map_or(0, |link| link.peer.pending())
    }

    /// 扫描定时器的到期时间；`None` 表示未武装或非端点连接。
    pub fn timer_expires(&self) -> Option<Instant> {
        self.endpoint_link_unchecked()
            .and_then(|link| link.peer.timer_expires())
    }

    pub fn poll(&self) -> Readiness {
        let Some(link) = self.endpoint_link_unchecked() else {
            return Readiness::Error;
        };
        if link.peer.pending() > 0 {
            Readiness::Readable
        } else if link.endpoint.is_disconnected() {
            Readiness::Hangup
        } else {
            Readiness::Idle
        }
    }

    /// 关闭连接。
    pub fn close(mut self) {
        self.teardown();
    }

    /// 按类型拆除。
    ///
    /// - 端点：停止并 join 定时器 → 撤销名称 → 离开端点成员集合 → 离开总线 id 表 → 清空队列；
    /// - bus-owner：断开并释放总线；
    /// - namespace-owner 与 control：不做额外动作。
    fn teardown(&mut self) {
        let role = std::mem::replace(self.role.get_mut(), Role::Released);
        match role {
            Role::Released => {}
            Role::Control => {
                info!(namespace = %self.namespace.name(), device = %self.device, "control connection closed");
            }
            Role::NamespaceOwner(ns) => {
                info!(namespace = %ns.name(), "namespace owner closed");
            }
            Role::BusOwner(bus) => {
                self.namespace.disconnect_bus(&bus);
                info!(namespace = %self.namespace.name(), bus = %bus.name(), "bus owner closed");
            }
            Role::Endpoint(EndpointLink { endpoint, peer }) => {
                let id = peer.id();
                let bus = endpoint.bus();
                peer.stop_timer();
                let names = bus.names().remove_by_conn(id);
                endpoint.leave(id);
                bus.unregister(id);
                let discarded = peer.drain();
                info!(
                    bus = %bus.name(),
                    endpoint = %endpoint.name(),
                    conn_id = id,
                    names,
                    discarded,
                    "endpoint connection closed"
                );
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("device", &self.device)
            .field("kind", &self.kind())
            .field("id", &self.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandArg, CommandCode};
    use crate::config::BusConfig;
    use tracing_test::traced_test;

    fn subsystem_with_bus() -> (Subsystem, Connection, DeviceId) {
        let subsystem = Subsystem::new(BusConfig::default()).unwrap();
        let owner = subsystem.open(DeviceId::control(0)).unwrap();
        owner.bus_make(&MakeCmd::named("traced")).unwrap();
        let device = owner.bus().unwrap().endpoint("bus").unwrap().device();
        (subsystem, owner, device)
    }

    #[traced_test]
    #[test]
    fn lifecycle_transitions_are_logged() {
        let (subsystem, owner, device) = subsystem_with_bus();
        let conn = subsystem.open(device).unwrap();
        conn.hello(HelloCmd::default()).unwrap();
        conn.close();
        owner.close();

        assert!(logs_contain("endpoint connection opened"));
        assert!(logs_contain("connection activated"));
        assert!(logs_contain("endpoint connection closed"));
        assert!(logs_contain("bus disconnected"));
    }

    #[traced_test]
    #[test]
    fn failed_commands_are_logged_with_their_code() {
        let (subsystem, _owner, device) = subsystem_with_bus();
        let conn = subsystem.open(device).unwrap();
        let _ = conn.dispatch(CommandCode::MatchAdd as u32, CommandArg::None);
        assert!(logs_contain("bus.command.not_implemented"));
    }

    #[test]
    fn teardown_runs_once_even_when_dropped_after_close_path() {
        let (subsystem, _owner, device) = subsystem_with_bus();
        let mut conn = subsystem.open(device).unwrap();
        let bus = conn.bus().unwrap();
        conn.teardown();
        assert_eq!(conn.kind(), ConnectionKind::Control);
        assert_eq!(conn.pending(), 0);
        assert_eq!(bus.connection_count(), 0);
        drop(conn);
        assert_eq!(bus.connection_count(), 0);
    }
}
