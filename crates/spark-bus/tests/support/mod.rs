//! 集成测试共用的夹具：一个注入虚拟时钟的子系统、一条总线与其 bus-owner 连接。
#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use spark_bus::{
    Bus, BusConfig, CommandArg, CommandCode, Connection, DeviceId, MakeCmd, MockClock, Subsystem,
};

pub struct Fixture {
    pub subsystem: Subsystem,
    pub clock: MockClock,
    pub owner: Connection,
    pub bus: Arc<Bus>,
    /// 默认端点的设备号。
    pub device: DeviceId,
}

impl Fixture {
    pub fn new(bus: &str) -> Self {
        Self::with_config(bus, BusConfig::default())
    }

    pub fn with_config(bus: &str, config: BusConfig) -> Self {
        let clock = MockClock::new();
        let subsystem =
            Subsystem::with_clock(config, Arc::new(clock.clone())).expect("默认配置必须合法");
        let owner = subsystem
            .open(DeviceId::control(0))
            .expect("根命名空间的控制节点必须可打开");
        owner
            .dispatch(
                CommandCode::BusMake as u32,
                CommandArg::Make(MakeCmd::named(bus)),
            )
            .expect("BUS_MAKE 应成功");
        let bus = owner.bus().expect("bus-owner 连接持有总线");
        let device = bus.endpoint("bus").expect("默认端点存在").device();
        Self {
            subsystem,
            clock,
            owner,
            bus,
            device,
        }
    }

    pub fn connect(&self) -> Connection {
        self.subsystem.open(self.device).expect("端点可打开")
    }

    /// 打开并完成 HELLO。
    pub fn hello(&self) -> Connection {
        let conn = self.connect();
        conn.hello(Default::default()).expect("首次 HELLO 成功");
        conn
    }
}

/// 轮询等待条件成立，最长 5 秒。
pub fn eventually(mut predicate: impl FnMut() -> bool) -> bool {
    let give_up = Instant::now() + Duration::from_secs(5);
    while Instant::now() < give_up {
        if predicate() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    predicate()
}
