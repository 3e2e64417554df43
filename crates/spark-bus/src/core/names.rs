//! # NameRegistry：总线级知名名称注册表
//!
//! ## 核心意图（Why）
//! - 允许连接以点分名称（如 `org.example.Echo`）被寻址，发送时再解析为当前持有者的 id；
//! - 连接关闭时一次性撤销其持有与排队的全部名称，并把名称移交给下一个排队者。
//!
//! ## 行为契约（What）
//! - `acquire`：名称空闲则获得；已被他人持有时，若持有者允许替换且请求方要求替换则接管，
//!   否则带 [`NameFlags::QUEUE`] 时排队，不带时返回 *already-exists*；
//! - `release`：仅持有者可释放（否则 *EPERM*），释放后队首等待者成为新持有者；
//!   排队者释放等同于退出队列；
//! - `remove_by_conn`：关闭路径专用，不会失败。
//!
//! ## 并发约束
//! - 整张表由一把锁保护，锁序位于任何队列锁之前；注册表从不调用连接或队列。

use std::collections::{BTreeMap, VecDeque};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{BusError, Result};

/// 名称获取标志。
pub struct NameFlags;

impl NameFlags {
    /// 持有者允许替换时，直接接管名称。
    pub const REPLACE_EXISTING: u64 = 1 << 0;
    /// 允许之后的请求方接管本连接持有的名称。
    pub const ALLOW_REPLACEMENT: u64 = 1 << 1;
    /// 名称被占用时进入等待队列。
    pub const QUEUE: u64 = 1 << 2;
}

/// `acquire` 的结果。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AcquireOutcome {
    Acquired,
    AlreadyOwner,
    Queued,
    /// 接管了 `previous` 持有的名称；若原持有者当初带 `QUEUE`，它被放回等待队列队首。
    Replaced { previous: u64 },
}

/// 名称的对外视图。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NameInfo {
    pub name: String,
    pub owner: u64,
    pub flags: u64,
    /// 排队等待者的 id，按排队顺序。
    pub waiters: Vec<u64>,
}

#[derive(Debug)]
struct NameEntry {
    owner: u64,
    flags: u64,
    waiters: VecDeque<(u64, u64)>,
}

#[derive(Debug)]
pub struct NameRegistry {
    max_length: usize,
    entries: Mutex<BTreeMap<String, NameEntry>>,
}

impl NameRegistry {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// 校验名称格式：至少两段、段非空、段首不是数字、字符集为 `[A-Za-z0-9_-]`。
    pub fn validate(&self, name: &str) -> Result<()> {
        if name.is_empty() || name.len() > self.max_length {
            return Err(BusError::invalid_argument(format!(
                "name length {} outside 1..={}",
                name.len(),
                self.max_length
            )));
        }
        let mut elements = 0;
        for element in name.split('.') {
            let valid = element
                .chars()
                .next()
                .is_some_and(|first| !first.is_ascii_digit())
                && element
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
            if !valid {
                return Err(BusError::invalid_argument(format!(
                    "malformed name \"{name}\""
                )));
            }
            elements += 1;
        }
        if elements < 2 {
            return Err(BusError::invalid_argument(format!(
                "name \"{name}\" needs at least two elements"
            )));
        }
        Ok(())
    }

    pub fn acquire(&self, conn: u64, name: &str, flags: u64) -> Result<AcquireOutcome> {
        self.validate(name)?;
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(name) else {
            entries.insert(
                name.to_owned(),
                NameEntry {
                    owner: conn,
                    flags,
                    waiters: VecDeque::new(),
                },
            );
            debug!(conn_id = conn, name, "name acquired");
            return Ok(AcquireOutcome::Acquired);
        };

        if entry.owner == conn {
            entry.flags = flags;
            return Ok(AcquireOutcome::AlreadyOwner);
        }

        if flags & NameFlags::REPLACE_EXISTING != 0
            && entry.flags & NameFlags::ALLOW_REPLACEMENT != 0
        {
            let previous = entry.owner;
            entry.waiters.retain(|(id, _)| *id != conn);
            if entry.flags & NameFlags::QUEUE != 0 {
                entry.waiters.push_front((previous, entry.flags));
            }
            entry.owner = conn;
            entry.flags = flags;
            debug!(conn_id = conn, previous, name, "name replaced");
            return Ok(AcquireOutcome::Replaced { previous });
        }

        if flags & NameFlags::QUEUE != 0 {
            if !entry.waiters.iter().any(|(id, _)| *id == conn) {
                entry.waiters.push_back((conn, flags));
            }
            return Ok(AcquireOutcome::Queued);
        }

        Err(BusError::already_exists(format!("name \"{name}\"")))
    }

    /// 释放名称，返回因此成为持有者的等待者（若有）。
    pub fn release(&self, conn: u64, name: &str) -> Result<Option<u64>> {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(name) else {
            return Err(BusError::not_found(format!("name \"{name}\"")));
        };

        if entry.owner != conn {
            let before = entry.waiters.len();
            entry.waiters.retain(|(id, _)| *id != conn);
            if entry.waiters.len() == before {
                return Err(BusError::NotOwner {
                    id: conn,
                    name: name.to_owned(),
                });
            }
            return Ok(None);
        }

        match entry.waiters.pop_front() {
            Some((next, flags)) => {
                entry.owner = next;
                entry.flags = flags;
                debug!(conn_id = conn, next, name, "name handed over");
                Ok(Some(next))
            }
            None => {
                entries.remove(name);
                debug!(conn_id = conn, name, "name released");
                Ok(None)
            }
        }
    }

    pub fn owner_of(&self, name: &str) -> Option<u64> {
        self.entries.lock().get(name).map(|entry| entry.owner)
    }

    pub fn query(&self, name: &str) -> Result<NameInfo> {
        self.entries
            .lock()
            .get(name)
            .map(|entry| info(name, entry))
            .ok_or_else(|| BusError::not_found(format!("name \"{name}\"")))
    }

    /// 按名称排序的全部名称。
    pub fn list(&self) -> Vec<NameInfo> {
        self.entries
            .lock()
            .iter()
            .map(|(name, entry)| info(name, entry))
            .collect()
    }

    /// 撤销 `conn` 持有与排队的全部名称，返回其曾持有的名称数。
    pub fn remove_by_conn(&self, conn: u64) -> usize {
        let mut entries = self.entries.lock();
        let mut owned = 0;
        entries.retain(|_, entry| {
            entry.waiters.retain(|(id, _)| *id != conn);
            if entry.owner != conn {
                return true;
            }
            owned += 1;
            match entry.waiters.pop_front() {
                Some((next, flags)) => {
                    entry.owner = next;
                    entry.flags = flags;
                    true
                }
                None => false,
            }
        });
        owned
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

fn info(name: &str, entry: &NameEntry) -> NameInfo {
    NameInfo {
        name: name.to_owned(),
        owner: entry.owner,
        flags: entry.flags,
        waiters: entry.waiters.iter().map(|(id, _)| *id).collect(),
    }
}
