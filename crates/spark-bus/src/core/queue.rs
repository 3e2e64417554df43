//! # 连接消息队列
//!
//! ## 核心意图（Why）
//! - 每个连接持有一个按到达顺序排列的待投递信封序列，所有条目状态跃迁
//!   （*pending* → *delivered* / *expired* / *discarded*）都在连接的队列锁内完成；
//! - 本模块只描述数据结构本身，加锁、定时器联动与唤醒由 [`super::peer::Peer`] 负责。
//!
//! ## 行为契约（What）
//! - `push`：追加到队尾；队列已关闭返回 *not-found*，超出配额返回 *out-of-memory*，失败时不入队；
//! - `pop_front`：按 FIFO 取出；
//! - `reap_expired`：一次遍历移除所有 `deadline <= now` 的条目，同时求出幸存条目中最早的截止时间；
//! - `close`：关闭并丢弃全部条目，此后 `push` 一律失败。

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use super::message::Envelope;
use crate::error::{BusError, Result};

/// 过期条目留给发送方的通知线索。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TimeoutNotice {
    pub sender: u64,
    pub cookie: u64,
}

/// 一次扫描的结果。
#[derive(Debug, Default, Eq, PartialEq)]
pub struct ScanOutcome {
    /// 被移除的过期条目，按队列顺序排列。
    pub expired: Vec<TimeoutNotice>,
    /// 幸存条目中最早的截止时间；`None` 表示没有带截止时间的条目。
    pub next_deadline: Option<Instant>,
}

#[derive(Debug)]
pub struct MessageQueue {
    owner: u64,
    entries: VecDeque<Arc<Envelope>>,
    max_pending: usize,
    closed: bool,
}

impl MessageQueue {
    pub fn new(owner: u64, max_pending: usize) -> Self {
        Self {
            owner,
            entries: VecDeque::new(),
            max_pending,
            closed: false,
        }
    }

    pub fn push(&mut self, envelope: Arc<Envelope>) -> Result<()> {
        if self.closed {
            return Err(BusError::not_found(format!("connection {}", self.owner)));
        }
        if self.entries.len() >= self.max_pending {
            return Err(BusError::OutOfMemory {
                detail: format!(
                    "queue of connection {} holds {} pending messages",
                    self.owner, self.max_pending
                ),
            });
        }
        self.entries.push_back(envelope);
        Ok(())
    }

    pub fn pop_front(&mut self) -> Option<Arc<Envelope>> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// 移除过期条目；被移除条目持有的信封引用在返回前即已释放。
    pub fn reap_expired(&mut self, now: Instant) -> ScanOutcome {
        let mut outcome = ScanOutcome::default();
        self.entries.retain(|envelope| match envelope.deadline() {
            None => true,
            Some(deadline) if deadline <= now => {
                outcome.expired.push(TimeoutNotice {
                    sender: envelope.src_id(),
                    cookie: envelope.cookie(),
                });
                false
            }
            Some(deadline) => {
                if outcome.next_deadline.is_none_or(|next| deadline < next) {
                    outcome.next_deadline = Some(deadline);
                }
                true
            }
        });
        outcome
    }

    /// 关闭队列并返回被丢弃的条目数。空队列关闭是无操作。
    pub fn close(&mut self) -> usize {
        self.closed = true;
        let discarded = self.entries.len();
        self.entries.clear();
        discarded
    }
}
