//! # Subsystem：命名空间表与设备解析入口
//!
//! ## 核心意图（Why）
//! - 代替全局可变状态：命名空间表、配置与时钟都挂在一个可克隆的句柄上，
//!   测试可以为每个用例构造独立的子系统；
//! - 设备打开先在此按 major 解析命名空间，这把表锁是锁序的第一级。
//!
//! ## 行为契约（What）
//! - `new` 同时创建根命名空间（名称 `"root"`，设备路径 `"bus"`，major 0）；
//! - `create_namespace` 在根命名空间下创建子命名空间，设备路径为 `bus/ns/<name>`；
//! - `open` 解析失败返回 *not-found*，不会留下半初始化的连接。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use super::connection::Connection;
use super::namespace::{Namespace, validate_object_name};
use crate::config::BusConfig;
use crate::error::{BusError, Result};
use crate::time::{Clock, SystemClock};

/// 控制节点使用的 minor 号。
pub const CONTROL_MINOR: u32 = 0;

/// 设备号。
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct DeviceId {
    pub major: u32,
    pub minor: u32,
}

impl DeviceId {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    pub const fn control(major: u32) -> Self {
        Self::new(major, CONTROL_MINOR)
    }

    pub const fn is_control(&self) -> bool {
        self.minor == CONTROL_MINOR
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// 子系统句柄，克隆开销为一次引用计数。
#[derive(Clone)]
pub struct Subsystem {
    inner: Arc<SubsystemInner>,
}

struct SubsystemInner {
    config: Arc<BusConfig>,
    clock: Arc<dyn Clock>,
    root: Arc<Namespace>,
    namespaces: Mutex<NamespaceTable>,
}

struct NamespaceTable {
    next_major: u32,
    by_major: HashMap<u32, Arc<Namespace>>,
    by_name: HashMap<String, u32>,
}

impl Subsystem {
    /// 以系统时钟构造子系统。
    pub fn new(config: BusConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// 注入时钟构造子系统；配置非法时返回 *invalid-argument*。
    pub fn with_clock(config: BusConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config
            .validate()
            .map_err(|err| BusError::invalid_argument(err.to_string()))?;
        let config = Arc::new(config);
        let root = Arc::new(Namespace::new(
            "root".to_owned(),
            "bus".to_owned(),
            0,
            None,
            Arc::clone(&config),
        ));
        let mut by_major = HashMap::new();
        by_major.insert(0, Arc::clone(&root));
        let mut by_name = HashMap::new();
        by_name.insert(root.name().to_owned(), 0);
        Ok(Self {
            inner: Arc::new(SubsystemInner {
                config,
                clock,
                root,
                namespaces: Mutex::new(NamespaceTable {
                    next_major: 1,
                    by_major,
                    by_name,
                }),
            }),
        })
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub fn root(&self) -> &Arc<Namespace> {
        &self.inner.root
    }

    /// 按 major 解析命名空间；已断开的命名空间视为不存在。
    pub fn namespace(&self, major: u32) -> Result<Arc<Namespace>> {
        self.inner
            .namespaces
            .lock()
            .by_major
            .get(&major)
            .filter(|ns| !ns.is_disconnected())
            .cloned()
            .ok_or_else(|| BusError::not_found(format!("namespace {major}")))
    }

    pub fn namespace_by_name(&self, name: &str) -> Option<Arc<Namespace>> {
        let table = self.inner.namespaces.lock();
        table
            .by_name
            .get(name)
            .and_then(|major| table.by_major.get(major))
            .cloned()
    }

    /// 在根命名空间下创建子命名空间。
    pub fn create_namespace(&self, name: &str) -> Result<Arc<Namespace>> {
        validate_object_name(name)?;
        let mut table = self.inner.namespaces.lock();
        if table.by_name.contains_key(name) {
            return Err(BusError::already_exists(format!("namespace \"{name}\"")));
        }
        let major = table.next_major;
        table.next_major = major.checked_add(1).ok_or_else(|| BusError::OutOfMemory {
            detail: "major numbers exhausted".to_owned(),
        })?;
        let ns = Arc::new(Namespace::new(
            name.to_owned(),
            format!("{}/ns/{name}", self.inner.root.devpath()),
            major,
            Some(Arc::clone(&self.inner.root)),
            Arc::clone(&self.inner.config),
        ));
        table.by_major.insert(major, Arc::clone(&ns));
        table.by_name.insert(name.to_owned(), major);
        info!(namespace = name, major, devpath = ns.devpath(), "namespace created");
        Ok(ns)
    }

    /// 断开命名空间并从表中移除，之后按 major 打开失败。
    pub fn remove_namespace(&self, major: u32) -> Result<()> {
        let ns = {
            let mut table = self.inner.namespaces.lock();
            if major == self.inner.root.major() {
                return Err(BusError::invalid_argument("the root namespace cannot be removed"));
            }
            let ns = table
                .by_major
                .remove(&major)
                .ok_or_else(|| BusError::not_found(format!("namespace {major}")))?;
            table.by_name.remove(ns.name());
            ns
        };
        ns.disconnect();
        Ok(())
    }

    /// 打开设备。
    pub fn open(&self, device: DeviceId) -> Result<Connection> {
        Connection::open(self, device)
    }
}

impl fmt::Debug for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.inner.namespaces.lock();
        f.debug_struct("Subsystem")
            .field("config", &self.inner.config)
            .field("namespaces", &table.by_major.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_namespaces_get_fresh_majors_and_devpaths() {
        let subsystem = Subsystem::new(BusConfig::default()).unwrap();
        let ns = subsystem.create_namespace("user").unwrap();
        assert_eq!(ns.major(), 1);
        assert_eq!(ns.devpath(), "bus/ns/user");
        assert!(Arc::ptr_eq(ns.parent().unwrap(), subsystem.root()));
        assert!(matches!(
            subsystem.create_namespace("user"),
            Err(BusError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn disconnected_namespace_does_not_resolve() {
        let subsystem = Subsystem::new(BusConfig::default()).unwrap();
        let ns = subsystem.create_namespace("tmp").unwrap();
        ns.disconnect();
        assert!(matches!(
            subsystem.namespace(ns.major()),
            Err(BusError::NotFound { .. })
        ));
        subsystem.remove_namespace(ns.major()).unwrap();
        assert!(subsystem.namespace_by_name("tmp").is_none());
        assert!(subsystem.remove_namespace(0).is_err());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = BusConfig::default();
        config.queue.max_pending = 0;
        assert!(matches!(
            Subsystem::new(config),
            Err(BusError::InvalidArgument { .. })
        ));
    }
}
