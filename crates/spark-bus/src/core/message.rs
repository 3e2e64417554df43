//! # 消息信封（Envelope）
//!
//! ## 契约（What）
//! - 信封构造完成后不可变，以 `Arc<Envelope>` 在发送方与各队列条目之间共享；
//! - 最后一个引用释放时负载随之释放；
//! - `deadline` 为基于注入时钟的绝对时间点，`None` 表示永不过期。

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;

/// 总线自身（内核来源）使用的源 id。
pub const KERNEL_ID: u64 = 0;

/// 消息目的地。
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Destination {
    /// 按连接 id 单播。
    Id(u64),
    /// 按知名名称单播，发送时解析为当前持有者。
    Name(String),
    /// 广播给同一总线上除发送方以外的所有连接。
    Broadcast,
}

/// 信封承载的内容。
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Payload {
    /// 普通数据消息。
    Data(Bytes),
    /// 总线生成的通知：`reply_cookie` 对应的消息在送达前已过期。
    ReplyTimeout { reply_cookie: u64 },
}

/// 引用计数的消息实例。
#[derive(Debug)]
pub struct Envelope {
    src_id: u64,
    dst: Destination,
    cookie: u64,
    payload: Payload,
    deadline: Option<Instant>,
}

impl Envelope {
    /// 构造不带截止时间的信封。
    pub fn new(src_id: u64, dst: Destination, cookie: u64, payload: Payload) -> Self {
        Self {
            src_id,
            dst,
            cookie,
            payload,
            deadline: None,
        }
    }

    /// 构造数据消息的便捷入口。
    pub fn data(src_id: u64, dst: Destination, cookie: u64, body: impl Into<Bytes>) -> Self {
        Self::new(src_id, dst, cookie, Payload::Data(body.into()))
    }

    /// 附加绝对截止时间。
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// 冻结为共享信封。
    pub fn into_shared(self) -> Arc<Envelope> {
        Arc::new(self)
    }

    /// 超时通知：由总线发往原发送方，源 id 固定为 [`KERNEL_ID`]。
    pub(crate) fn reply_timeout(sender: u64, reply_cookie: u64) -> Self {
        Self::new(
            KERNEL_ID,
            Destination::Id(sender),
            0,
            Payload::ReplyTimeout { reply_cookie },
        )
    }

    pub fn src_id(&self) -> u64 {
        self.src_id
    }

    pub fn destination(&self) -> &Destination {
        &self.dst
    }

    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// 数据负载的只读视图；通知消息返回 `None`。
    pub fn body(&self) -> Option<&Bytes> {
        match &self.payload {
            Payload::Data(bytes) => Some(bytes),
            Payload::ReplyTimeout { .. } => None,
        }
    }

    /// 是否为总线生成的通知。
    pub fn is_notification(&self) -> bool {
        self.src_id == KERNEL_ID
    }
}
