//! # core 模块说明
//!
//! ## 角色定位（Why）
//! - 汇总连接生命周期、消息队列、超时扫描与容器对象（命名空间、总线、端点）；
//! - 对外只暴露稳定的句柄类型，内部登记与拆除的细节留在各子模块中。
//!
//! ## 子模块一览（What）
//! - `subsystem`：命名空间表与设备解析入口；
//! - `namespace` / `bus` / `endpoint`：引用计数的容器对象；
//! - `connection`：打开、激活、关闭与命令执行；
//! - `peer` / `queue` / `timer`：每连接的队列与超时扫描；
//! - `names`：总线级知名名称注册表；
//! - `message`：不可变的共享信封。

pub mod bus;
pub mod connection;
pub mod endpoint;
pub mod message;
pub mod names;
pub mod namespace;
pub mod peer;
pub mod queue;
pub mod subsystem;
pub mod timer;

pub use bus::Bus;
pub use connection::{Connection, ConnectionKind, Readiness};
pub use endpoint::{Endpoint, ReadyWait};
pub use message::{Destination, Envelope, KERNEL_ID, Payload};
pub use names::{AcquireOutcome, NameFlags, NameInfo, NameRegistry};
pub use namespace::{DEFAULT_ENDPOINT, Namespace};
pub use peer::{Peer, ScanReport};
pub use queue::{MessageQueue, ScanOutcome, TimeoutNotice};
pub use subsystem::{CONTROL_MINOR, DeviceId, Subsystem};
pub use timer::DeadlineTimer;
