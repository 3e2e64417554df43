//! 时间抽象模块，提供可注入的时钟接口，使消息截止时间与超时扫描在测试中完全确定。
//!
//! # 结构概览（What）
//! - [`clock::Clock`]：核心时钟 trait，暴露 `now` 与推进订阅两个原语；
//! - [`clock::SystemClock`]：基于 `Instant::now` 的生产实现；
//! - [`clock::MockClock`]：虚拟时钟，提供手动推进与订阅者唤醒。
//!
//! # 使用指引（How）
//! - 业务代码只依赖 [`Clock`] trait；
//! - 在测试中使用 [`MockClock`] 手动推进时间，再断言扫描结果与定时器状态。

pub mod clock;

pub use clock::{Clock, ClockListener, MockClock, SystemClock};
