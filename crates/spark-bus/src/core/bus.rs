//! # Bus：连接 id 表与消息路由
//!
//! ## 核心意图（Why）
//! - 提供基于 `DashMap` 的并发安全 id 表，多个线程可同时打开、关闭连接并互相投递；
//! - 持有连接 id 分配器、知名名称注册表与本总线端点的弱引用表。
//!
//! ## 行为契约（What）
//! - `allocate_id`：取号并自增；号段耗尽返回 *no-space*，从不回绕；
//! - `register`：id 已存在时返回 *already-exists*，不会覆盖旧连接；
//! - `route`：按 id、名称或广播把信封放入目标队列。单播失败原样返回，广播对单个目标的失败
//!   只记录日志；
//! - `disconnect`：标记断开并断开全部端点，幂等。
//!
//! ## 风险提示（Trade-offs）
//! - `DashMap` guard 持有期间会阻塞同分片写操作，路由时先克隆 `Arc<Peer>` 再入队，
//!   不在分片锁内触碰任何队列锁。

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::{DashMap, mapref::entry::Entry};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::endpoint::Endpoint;
use super::message::{Destination, Envelope};
use super::names::NameRegistry;
use super::peer::Peer;
use crate::error::{BusError, Result};

/// 总线。
///
/// # 教案式注释
/// - **意图 (Why)**：封装 id 表，避免上层直接操作 `DashMap`；
/// - **契约 (What)**：`conns` 中的每个条目对应一个尚未关闭的端点连接，关闭路径负责移除；
/// - **风险 (Trade-offs)**：端点表只保存 `Weak`，端点由命名空间的 minor 表与连接持有。
#[derive(Debug)]
pub struct Bus {
    name: String,
    flags: u64,
    mode: u32,
    next_id: AtomicU64,
    conns: DashMap<u64, Arc<Peer>>,
    names: NameRegistry,
    endpoints: Mutex<BTreeMap<String, Weak<Endpoint>>>,
    disconnected: AtomicBool,
}

impl Bus {
    pub(crate) fn new(
        name: String,
        flags: u64,
        mode: u32,
        first_id: u64,
        max_name_length: usize,
    ) -> Self {
        Self {
            name,
            flags,
            mode,
            next_id: AtomicU64::new(first_id),
            conns: DashMap::new(),
            names: NameRegistry::new(max_name_length),
            endpoints: Mutex::new(BTreeMap::new()),
            disconnected: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> u64 {
        self.flags
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    pub fn names(&self) -> &NameRegistry {
        &self.names
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// 取出下一个连接 id。
    pub(crate) fn allocate_id(&self) -> Result<u64> {
        self.next_id
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |id| id.checked_add(1))
            .map_err(|_| BusError::IdSpaceExhausted {
                bus: self.name.clone(),
            })
    }

    /// 原子地登记连接。
    ///
    /// - **前置条件**：同一 id 不应已存在；若存在则返回 `AlreadyExists`；
    /// - **后置条件**：成功后连接立即可被 `connection` 与路由查到。
    pub(crate) fn register(&self, peer: Arc<Peer>) -> Result<()> {
        match self.conns.entry(peer.id()) {
            Entry::Occupied(occupied) => Err(BusError::already_exists(format!(
                "connection id {} on bus \"{}\"",
                occupied.key(),
                self.name
            ))),
            Entry::Vacant(vacant) => {
                vacant.insert(peer);
                Ok(())
            }
        }
    }

    pub(crate) fn unregister(&self, id: u64) -> Option<Arc<Peer>> {
        self.conns.remove(&id).map(|(_, peer)| peer)
    }

    /// 按 id 查找连接；返回克隆的 `Arc`，不持有分片锁。
    pub fn connection(&self, id: u64) -> Option<Arc<Peer>> {
        self.conns.get(&id).map(|peer| Arc::clone(peer.value()))
    }

    /// 存活连接 id 的快照，升序。
    pub fn connection_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.conns.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    pub(crate) fn attach_endpoint(&self, endpoint: &Arc<Endpoint>) -> Result<()> {
        let mut endpoints = self.endpoints.lock();
        endpoints.retain(|_, weak| weak.strong_count() > 0);
        if endpoints.contains_key(endpoint.name()) {
            return Err(BusError::already_exists(format!(
                "endpoint \"{}\" on bus \"{}\"",
                endpoint.name(),
                self.name
            )));
        }
        endpoints.insert(endpoint.name().to_owned(), Arc::downgrade(endpoint));
        Ok(())
    }

    pub fn endpoint(&self, name: &str) -> Option<Arc<Endpoint>> {
        self.endpoints.lock().get(name).and_then(Weak::upgrade)
    }

    /// 把信封投递到目标队列，返回成功入队的连接数。
    pub fn route(&self, envelope: Arc<Envelope>) -> Result<usize> {
        match envelope.destination() {
            Destination::Id(id) => {
                let peer = self
                    .connection(*id)
                    .ok_or_else(|| BusError::not_found(format!("connection {id}")))?;
                peer.enqueue(envelope)?;
                Ok(1)
            }
            Destination::Name(name) => {
                let owner = self
                    .names
                    .owner_of(name)
                    .ok_or_else(|| BusError::not_found(format!("name \"{name}\"")))?;
                let peer = self
                    .connection(owner)
                    .ok_or_else(|| BusError::not_found(format!("connection {owner}")))?;
                peer.enqueue(envelope)?;
                Ok(1)
            }
            Destination::Broadcast => {
                let src = envelope.src_id();
                let targets: Vec<Arc<Peer>> = self
                    .conns
                    .iter()
                    .filter(|entry| *entry.key() != src)
                    .map(|entry| Arc::clone(entry.value()))
                    .collect();
                let mut delivered = 0;
                for peer in targets {
                    match peer.enqueue(Arc::clone(&envelope)) {
                        Ok(()) => delivered += 1,
                        Err(err) => warn!(
                            bus = %self.name,
                            conn_id = peer.id(),
                            code = err.code(),
                            "broadcast skipped a connection"
                        ),
                    }
                }
                debug!(bus = %self.name, src, delivered, "broadcast routed");
                Ok(delivered)
            }
        }
    }

    /// 断开总线及其全部端点。
    pub fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return;
        }
        let endpoints: Vec<Arc<Endpoint>> = self
            .endpoints
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        for endpoint in &endpoints {
            endpoint.disconnect();
        }
        info!(bus = %self.name, endpoints = endpoints.len(), "bus disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::endpoint::ReadyWait;
    use crate::time::MockClock;

    fn peer_on(bus: &Arc<Bus>, id: u64) -> Arc<Peer> {
        Peer::new(
            id,
            Arc::downgrade(bus),
            Arc::new(ReadyWait::new()),
            Arc::new(MockClock::new()),
            4,
        )
    }

    #[test]
    fn ids_are_monotonic_and_never_wrap() {
        let bus = Bus::new("b".into(), 0, 0, u64::MAX - 1, 255);
        assert_eq!(bus.allocate_id(), Ok(u64::MAX - 1));
        assert!(matches!(
            bus.allocate_id(),
            Err(BusError::IdSpaceExhausted { .. })
        ));
    }

    #[test]
    fn duplicate_registration_keeps_the_first() {
        let bus = Arc::new(Bus::new("b".into(), 0, 0, 1, 255));
        let first = peer_on(&bus, 1);
        bus.register(Arc::clone(&first)).unwrap();
        let err = bus.register(peer_on(&bus, 1)).unwrap_err();
        assert!(matches!(err, BusError::AlreadyExists { .. }));
        assert!(Arc::ptr_eq(&bus.connection(1).unwrap(), &first));
    }

    #[test]
    fn route_by_name_and_broadcast() {
        let bus = Arc::new(Bus::new("b".into(), 0, 0, 1, 255));
        for id in 1..=3 {
            bus.register(peer_on(&bus, id)).unwrap();
        }
        bus.names().acquire(2, "org.example", 0).unwrap();

        let named = Envelope::data(1, Destination::Name("org.example".into()), 7, &b"hi"[..]);
        assert_eq!(bus.route(named.into_shared()), Ok(1));
        assert_eq!(bus.connection(2).unwrap().pending(), 1);

        let all = Envelope::data(1, Destination::Broadcast, 8, &b"all"[..]);
        assert_eq!(bus.route(all.into_shared()), Ok(2));
        assert_eq!(bus.connection(1).unwrap().pending(), 0, "广播不回送给发送方");
        assert_eq!(bus.connection(3).unwrap().pending(), 1);

        let missing = Envelope::data(1, Destination::Id(42), 9, &b"?"[..]);
        assert!(matches!(
            bus.route(missing.into_shared()),
            Err(BusError::NotFound { .. })
        ));
    }
}
