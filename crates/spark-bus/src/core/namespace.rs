//! # Namespace：设备号与总线的容器
//!
//! ## 核心意图（Why）
//! - 命名空间拥有一个 major 号与其下的总线集合；端点在命名空间内分配 minor 号，
//!   设备打开时由 `(major, minor)` 直接解析到端点；
//! - minor 0 保留给控制节点。
//!
//! ## 行为契约（What）
//! - `create_bus`：名称在命名空间内唯一，同时创建默认端点 `"bus"`；
//! - `create_endpoint`：名称在总线内唯一，分配新的 minor；
//! - `disconnect_bus`：断开总线并从 minor 表中摘除其全部端点，之后按设备号打开失败；
//! - `disconnect`：标记命名空间断开，之后的打开一律 *not-found*。
//!
//! ## 并发约束
//! - `state` 锁对应锁序中的“命名空间锁”：持有时只会进一步获取总线的端点表锁。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::info;

use super::bus::Bus;
use super::endpoint::Endpoint;
use super::subsystem::DeviceId;
use crate::config::BusConfig;
use crate::error::{BusError, Result};

/// 每条总线自动创建的默认端点名。
pub const DEFAULT_ENDPOINT: &str = "bus";

#[derive(Debug)]
pub struct Namespace {
    name: String,
    devpath: String,
    major: u32,
    parent: Option<Arc<Namespace>>,
    config: Arc<BusConfig>,
    disconnected: AtomicBool,
    state: Mutex<NamespaceState>,
}

#[derive(Debug)]
struct NamespaceState {
    next_minor: u32,
    endpoints: HashMap<u32, Arc<Endpoint>>,
    buses: HashMap<String, Arc<Bus>>,
}

impl Namespace {
    pub(crate) fn new(
        name: String,
        devpath: String,
        major: u32,
        parent: Option<Arc<Namespace>>,
        config: Arc<BusConfig>,
    ) -> Self {
        Self {
            name,
            devpath,
            major,
            parent,
            config,
            disconnected: AtomicBool::new(false),
            state: Mutex::new(NamespaceState {
                next_minor: 1,
                endpoints: HashMap::new(),
                buses: HashMap::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn devpath(&self) -> &str {
        &self.devpath
    }

    pub fn major(&self) -> u32 {
        self.major
    }

    pub fn parent(&self) -> Option<&Arc<Namespace>> {
        self.parent.as_ref()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// 标记断开；已打开的连接不受影响，之后的打开失败。
    pub fn disconnect(&self) {
        if !self.disconnected.swap(true, Ordering::AcqRel) {
            info!(namespace = %self.name, major = self.major, "namespace disconnected");
        }
    }

    pub(crate) fn config(&self) -> &Arc<BusConfig> {
        &self.config
    }

    /// 创建总线及其默认端点。
    pub fn create_bus(&self, name: &str, flags: u64, mode: u32) -> Result<Arc<Bus>> {
        validate_object_name(name)?;
        let mut state = self.state.lock();
        if state.buses.contains_key(name) {
            return Err(BusError::already_exists(format!("bus \"{name}\"")));
        }
        let bus = Arc::new(Bus::new(
            name.to_owned(),
            flags,
            mode,
            self.config.first_connection_id,
            self.config.names.max_length,
        ));
        self.attach_endpoint(&mut state, &bus, DEFAULT_ENDPOINT, mode)?;
        state.buses.insert(name.to_owned(), Arc::clone(&bus));
        info!(namespace = %self.name, bus = name, "bus created");
        Ok(bus)
    }

    /// 在已有总线上创建额外端点。
    pub fn create_endpoint(&self, bus: &Arc<Bus>, name: &str, mode: u32) -> Result<Arc<Endpoint>> {
        validate_object_name(name)?;
        if bus.is_disconnected() {
            return Err(BusError::not_found(format!("bus \"{}\"", bus.name())));
        }
        let mut state = self.state.lock();
        let endpoint = self.attach_endpoint(&mut state, bus, name, mode)?;
        info!(
            namespace = %self.name,
            bus = bus.name(),
            endpoint = name,
            minor = endpoint.device().minor,
            "endpoint created"
        );
        Ok(endpoint)
    }

    fn attach_endpoint(
        &self,
        state: &mut NamespaceState,
        bus: &Arc<Bus>,
        name: &str,
        mode: u32,
    ) -> Result<Arc<Endpoint>> {
        let minor = state.next_minor;
        let next = minor.checked_add(1).ok_or_else(|| BusError::OutOfMemory {
            detail: format!("minor numbers of namespace \"{}\" exhausted", self.name),
        })?;
        let endpoint = Arc::new(Endpoint::new(
            name.to_owned(),
            DeviceId::new(self.major, minor),
            mode,
            Arc::clone(bus),
        ));
        bus.attach_endpoint(&endpoint)?;
        state.next_minor = next;
        state.endpoints.insert(minor, Arc::clone(&endpoint));
        Ok(endpoint)
    }

    /// 断开总线并摘除其端点的设备号。
    pub fn disconnect_bus(&self, bus: &Arc<Bus>) {
        let mut state = self.state.lock();
        bus.disconnect();
        state
            .endpoints
            .retain(|_, endpoint| !Arc::ptr_eq(endpoint.bus(), bus));
        state
            .buses
            .retain(|_, candidate| !Arc::ptr_eq(candidate, bus));
    }

    pub fn bus(&self, name: &str) -> Option<Arc<Bus>> {
        self.state.lock().buses.get(name).cloned()
    }

    /// 按 minor 查找端点；已断开的端点视为不存在。
    pub fn endpoint(&self, minor: u32) -> Result<Arc<Endpoint>> {
        self.state
            .lock()
            .endpoints
            .get(&minor)
            .filter(|endpoint| !endpoint.is_disconnected())
            .cloned()
            .ok_or_else(|| {
                BusError::not_found(format!("endpoint {}:{minor}", self.major))
            })
    }

    /// 按名称排序的总线名。
    pub fn bus_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().buses.keys().cloned().collect();
        names.sort_unstable();
        names
    }
}

/// 命名空间、总线与端点名：非空、不含 `/` 与 NUL，长度不超过 64。
pub(crate) fn validate_object_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 64 || name.contains(['/', '\0']) {
        return Err(BusError::invalid_argument(format!(
            "invalid object name \"{name}\""
        )));
    }
    Ok(())
}
