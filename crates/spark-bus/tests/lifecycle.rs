//! 连接生命周期：打开、激活与关闭后的现场清理。

mod support;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use spark_bus::{
    BusConfig, BusError, ConnectionKind, DeviceId, Destination, Envelope, NameCmd, NameFlags,
    RecvCmd, Subsystem,
};
use support::Fixture;

#[test]
fn endpoint_connections_get_monotonic_ids_and_membership() {
    let fx = Fixture::new("lifecycle");
    let first = fx.connect();
    let second = fx.connect();

    assert_eq!(first.kind(), ConnectionKind::Endpoint);
    assert_eq!(first.id(), Some(1));
    assert_eq!(second.id(), Some(2));
    assert!(!first.is_active(), "打开后尚未激活");

    let endpoint = fx.bus.endpoint("bus").unwrap();
    assert_eq!(endpoint.connection_ids(), vec![1, 2]);
    assert_eq!(fx.bus.connection_ids(), vec![1, 2]);
    assert!(
        fx.bus.connection(1).is_some(),
        "打开后立即对查找可见"
    );

    first.close();
    let third = fx.connect();
    assert_eq!(third.id(), Some(3), "关闭的 id 不会被复用");
}

#[test]
fn control_connection_binds_only_the_namespace() {
    let subsystem = Subsystem::new(BusConfig::default()).unwrap();
    let control = subsystem.open(DeviceId::control(0)).unwrap();
    assert_eq!(control.kind(), ConnectionKind::Control);
    assert_eq!(control.id(), None);
    assert_eq!(control.pending(), 0);
    assert!(matches!(
        control.recv(RecvCmd::non_blocking()),
        Err(BusError::InvalidArgument { .. })
    ));
}

#[test]
fn opening_in_disconnected_namespace_fails_without_leaking() {
    let subsystem = Subsystem::new(BusConfig::default()).unwrap();
    let ns = subsystem.create_namespace("doomed").unwrap();
    let bus = ns.create_bus("inner", 0, 0).unwrap();
    let endpoint = bus.endpoint("bus").unwrap();
    ns.disconnect();

    let err = subsystem.open(endpoint.device()).unwrap_err();
    assert!(matches!(err, BusError::NotFound { .. }));
    assert_eq!(err.errno(), -2);
    assert!(subsystem.open(DeviceId::control(ns.major())).is_err());
    assert_eq!(bus.connection_count(), 0, "失败的打开不得登记连接");
    assert!(endpoint.connection_ids().is_empty());
}

#[test]
fn opening_unknown_devices_is_not_found() {
    let fx = Fixture::new("unknown");
    assert!(matches!(
        fx.subsystem.open(DeviceId::new(0, 99)),
        Err(BusError::NotFound { .. })
    ));
    assert!(matches!(
        fx.subsystem.open(DeviceId::new(42, 1)),
        Err(BusError::NotFound { .. })
    ));
}

#[test]
fn closing_with_pending_entries_releases_every_envelope() {
    let fx = Fixture::new("drain");
    let conn = fx.connect();
    let id = conn.id().unwrap();

    let envelopes: Vec<Arc<Envelope>> = (0..3)
        .map(|cookie| {
            Envelope::data(77, Destination::Id(id), cookie, &b"pending"[..]).into_shared()
        })
        .collect();
    for envelope in &envelopes {
        conn.enqueue(Arc::clone(envelope)).unwrap();
    }
    assert_eq!(conn.pending(), 3);
    assert!(envelopes.iter().all(|env| Arc::strong_count(env) == 2));

    conn.close();

    assert!(
        envelopes.iter().all(|env| Arc::strong_count(env) == 1),
        "关闭后队列不得再持有任何信封"
    );
    let endpoint = fx.bus.endpoint("bus").unwrap();
    assert!(!endpoint.has_member(id));
    assert!(fx.bus.connection(id).is_none());
}

#[test]
fn closing_an_empty_connection_is_a_no_op() {
    let fx = Fixture::new("empty");
    let conn = fx.hello();
    let id = conn.id().unwrap();
    conn.close();
    assert!(fx.bus.connection(id).is_none());
    assert_eq!(fx.bus.connection_count(), 0);
}

#[test]
fn dropping_without_close_tears_down_too() {
    let fx = Fixture::new("dropped");
    let id = {
        let conn = fx.connect();
        conn.id().unwrap()
    };
    assert!(fx.bus.connection(id).is_none());
    assert!(fx.bus.endpoint("bus").unwrap().connection_ids().is_empty());
}

#[test]
fn close_releases_owned_names_and_promotes_waiters() {
    let fx = Fixture::new("names");
    let owner = fx.hello();
    let waiter = fx.hello();
    let name = |flags| NameCmd {
        name: "org.example.Service".into(),
        flags,
    };
    owner.name_acquire(&name(0)).unwrap();
    waiter.name_acquire(&name(NameFlags::QUEUE)).unwrap();

    owner.close();

    let info = fx.bus.names().query("org.example.Service").unwrap();
    assert_eq!(Some(info.owner), waiter.id());
    assert!(info.waiters.is_empty());
}

#[test]
fn bus_owner_close_disconnects_the_bus() {
    let fx = Fixture::new("owned");
    let reader = fx.hello();
    let blocked = thread::spawn(move || reader.recv(RecvCmd::blocking(None)));

    thread::sleep(Duration::from_millis(20));
    let Fixture {
        subsystem,
        owner,
        bus,
        device,
        ..
    } = fx;
    owner.close();

    let outcome = blocked.join().expect("读取线程不应 panic");
    assert!(
        matches!(outcome, Err(BusError::Disconnected { .. })),
        "阻塞读取应以端点断开结束"
    );
    assert!(bus.is_disconnected());
    assert!(matches!(
        subsystem.open(device),
        Err(BusError::NotFound { .. })
    ));
}

#[test]
fn tracing_subscriber_installs_only_once() {
    let _ = spark_bus::telemetry::init_tracing();
    assert!(matches!(
        spark_bus::telemetry::init_tracing(),
        Err(spark_bus::telemetry::TelemetryError::SubscriberAlreadySet)
    ));
}
