//! End-to-end connection registry scenarios.

mod common;

use common::*;
use pitaya_core::{
    commands, OutputDirect, Params, PitayaError, Signal, TransportMode, TriggerSource, Waveform,
};
use pitaya_driver_scpi::loopback::LoopbackDevice;
use pitaya_hub::{
    AsgSettings, ConnectOptions, ConnectionRegistry, ConnectionState, IqSettings, PidSettings,
    ScopeSettings, StandardBackendFactory,
};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn registry() -> ConnectionRegistry {
    ConnectionRegistry::new(test_config()).unwrap()
}

#[tokio::test]
async fn shared_connection_counts_references() {
    let registry = registry();

    let first = registry.connect("sim-dev", "cfg", true).await.unwrap();
    let second = registry.connect("sim-dev", "cfg", true).await.unwrap();
    assert!(Arc::ptr_eq(first.connection(), second.connection()));
    assert_eq!(first.reference_count(), 2);

    assert!(second.disconnect().await.is_none());
    assert_eq!(first.reference_count(), 1);
    assert_eq!(first.state(), ConnectionState::Connected);

    first.set_pid_setpoint("pid0", 0.2).await.unwrap();
    assert_eq!(first.get_pid_setpoint("pid0").await.unwrap(), 0.2);

    let connection = Arc::clone(first.connection());
    let report = first.disconnect().await.unwrap();
    assert!(report.is_clean(), "{report:?}");
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn n_connects_need_n_disconnects() {
    let registry = registry();
    let mut handles = Vec::new();
    for _ in 0..5 {
        handles.push(registry.connect("sim-many", "cfg", true).await.unwrap());
    }
    let connection = Arc::clone(handles[0].connection());
    assert_eq!(connection.reference_count(), 5);

    while handles.len() > 1 {
        let handle = handles.pop().unwrap();
        assert!(handle.disconnect().await.is_none());
        assert!(connection.is_connected());
    }
    let last = handles.pop().unwrap();
    assert!(last.disconnect().await.is_some());
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert!(registry.get("sim-many", "cfg").await.is_none());
}

#[tokio::test]
async fn disconnect_by_key_retires_one_handle() {
    let registry = registry();
    let a = registry.connect("sim-dev", "cfg", true).await.unwrap();
    let b = registry.connect("sim-dev", "cfg", true).await.unwrap();

    assert!(registry.disconnect("sim-dev", "cfg").await.is_none());
    assert_eq!(b.reference_count(), 1);
    assert!(a.is_released());
    assert!(!b.is_released());

    // The retired handle's drop must not take b's reference with it
    drop(a);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(b.state(), ConnectionState::Connected);
    assert_eq!(b.reference_count(), 1);
    b.ping().await.unwrap();

    let report = b.disconnect().await.unwrap();
    assert!(report.is_clean(), "{report:?}");
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn released_handle_cannot_release_twice() {
    let registry = registry();
    let a = registry.connect("sim-twice", "cfg", true).await.unwrap();
    let b = registry.connect("sim-twice", "cfg", true).await.unwrap();
    let c = registry.connect("sim-twice", "cfg", true).await.unwrap();

    assert!(registry.disconnect("sim-twice", "cfg").await.is_none());
    // a was retired by the key-based call; disconnecting it is a no-op
    assert!(a.disconnect().await.is_none());
    assert_eq!(b.reference_count(), 2);

    assert!(b.disconnect().await.is_none());
    assert!(c.is_connected());
    assert!(c.disconnect().await.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timed_out_direct_query_does_not_leak_into_the_next() {
    let device = LoopbackDevice::spawn().await.unwrap();
    let registry = ConnectionRegistry::with_factory(
        test_config(),
        Arc::new(StandardBackendFactory::new()),
    )
    .unwrap();
    let conn = registry
        .connect_with(
            &device.address(),
            "cfg",
            ConnectOptions::default().with_transport(TransportMode::Direct),
        )
        .await
        .unwrap();
    conn.set_pid_setpoint("pid0", 0.5).await.unwrap();
    conn.set_pid_setpoint("pid1", -0.9).await.unwrap();
    device
        .delay_reply("PID0:SETP", Duration::from_millis(300))
        .await;

    let mut params = Params::new();
    params.insert("channel".into(), json!("pid0"));
    let err = conn
        .execute_with_timeout(commands::PID_GET_SETPOINT, params, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, PitayaError::Timeout { .. }), "{err}");

    // The late pid0 answer must not be read as pid1's
    assert_eq!(conn.get_pid_setpoint("pid1").await.unwrap(), -0.9);
    device.delay_reply("PID0:SETP", Duration::ZERO).await;
    assert_eq!(conn.get_pid_setpoint("pid0").await.unwrap(), 0.5);
    assert_eq!(conn.get_pid_setpoint("pid1").await.unwrap(), -0.9);
    conn.disconnect().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_start_does_not_hold_up_other_keys() {
    let stall = Duration::from_millis(1500);
    let factory = Arc::new(StallingFactory::new("sim-slow", stall));
    let registry = ConnectionRegistry::with_factory(test_config(), factory.clone()).unwrap();

    let slow = tokio::spawn({
        let registry = registry.clone();
        async move { registry.connect("sim-slow", "cfg", true).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    let fast = registry.connect("sim-fast", "cfg", true).await.unwrap();
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_millis(500), "took {elapsed:?}");
    fast.ping().await.unwrap();
    assert!(fast.disconnect().await.is_some());

    let pending = registry.get("sim-slow", "cfg").await.unwrap();
    assert_eq!(pending.state(), ConnectionState::Connecting);

    let slow = slow.await.unwrap().unwrap();
    assert!(slow.is_connected());
    assert_eq!(factory.opened.load(Ordering::SeqCst), 2);
    registry.shutdown_all().await;
}

#[tokio::test]
async fn concurrent_connects_share_a_starting_connection() {
    let factory = Arc::new(StallingFactory::new("sim-shared", Duration::from_millis(300)));
    let registry = ConnectionRegistry::with_factory(test_config(), factory.clone()).unwrap();

    let (a, b) = tokio::join!(
        registry.connect("sim-shared", "cfg", true),
        registry.connect("sim-shared", "cfg", true),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(Arc::ptr_eq(a.connection(), b.connection()));
    assert_eq!(a.reference_count(), 2);
    assert_eq!(factory.opened.load(Ordering::SeqCst), 1);

    assert!(a.disconnect().await.is_none());
    assert!(b.disconnect().await.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_connect_does_not_strand_the_key() {
    let factory = Arc::new(StallingFactory::new("sim-cancel", Duration::from_millis(300)));
    let registry = ConnectionRegistry::with_factory(test_config(), factory.clone()).unwrap();

    let attempt = tokio::time::timeout(
        Duration::from_millis(50),
        registry.connect("sim-cancel", "cfg", true),
    )
    .await;
    assert!(attempt.is_err());
    let abandoned = registry.get("sim-cancel", "cfg").await.unwrap();
    assert_eq!(abandoned.state(), ConnectionState::Error);

    let conn = registry.connect("sim-cancel", "cfg", true).await.unwrap();
    assert!(!Arc::ptr_eq(conn.connection(), &abandoned));
    conn.ping().await.unwrap();
    assert!(conn.disconnect().await.is_some());
}

#[tokio::test]
async fn waiting_caller_sees_the_start_failure() {
    let registry = ConnectionRegistry::with_factory(
        test_config(),
        shared(UnreachableFactory::default()),
    )
    .unwrap();

    let (a, b) = tokio::join!(
        registry.connect("10.9.8.7", "cfg", false),
        registry.connect("10.9.8.7", "cfg", false),
    );
    for err in [a.unwrap_err(), b.unwrap_err()] {
        assert!(matches!(err, PitayaError::InitializationFailed { .. }), "{err}");
    }
    let failed = registry.get("10.9.8.7", "cfg").await.unwrap();
    assert_eq!(failed.state(), ConnectionState::Error);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_and_fast_commands_overlap() {
    let slow = Duration::from_millis(400);
    let registry = ConnectionRegistry::with_factory(
        test_config(),
        shared(SlowFactory::new(slow)),
    )
    .unwrap();
    let conn = registry.connect("sim-slow", "cfg", true).await.unwrap();

    let started = Instant::now();
    let (identity, setpoint) = tokio::join!(conn.identify(), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.set_pid_setpoint("pid1", -0.3).await
    });
    let elapsed = started.elapsed();

    assert!(identity.unwrap().identity.contains("sim-slow"));
    assert_eq!(setpoint.unwrap(), -0.3);
    assert!(elapsed >= slow);
    assert!(elapsed < slow * 2, "took {elapsed:?}");
    conn.disconnect().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn separate_devices_do_not_block_each_other() {
    let slow = Duration::from_millis(300);
    let registry = ConnectionRegistry::with_factory(
        test_config(),
        shared(SlowFactory::new(slow)),
    )
    .unwrap();
    let a = registry.connect("sim-a", "cfg", true).await.unwrap();
    let b = registry.connect("sim-b", "cfg", true).await.unwrap();

    let started = Instant::now();
    let (x, y) = tokio::join!(a.identify(), b.identify());
    x.unwrap();
    y.unwrap();
    assert!(started.elapsed() < slow * 2, "took {:?}", started.elapsed());

    registry.shutdown_all().await;
}

#[tokio::test]
async fn failed_start_is_reported_then_rebuilt() {
    let registry = ConnectionRegistry::with_factory(
        test_config(),
        shared(UnreachableFactory::default()),
    )
    .unwrap();

    let err = registry.connect("10.1.2.3", "cfg", false).await.unwrap_err();
    assert!(matches!(err, PitayaError::InitializationFailed { .. }), "{err}");
    let failed = registry.get("10.1.2.3", "cfg").await.unwrap();
    assert_eq!(failed.state(), ConnectionState::Error);
    assert!(failed.last_error().unwrap().contains("no route to host"));

    // Next attempt evicts the failed entry and tries again
    let err = registry.connect("10.1.2.3", "cfg", false).await.unwrap_err();
    assert!(matches!(err, PitayaError::InitializationFailed { .. }));
    let rebuilt = registry.get("10.1.2.3", "cfg").await.unwrap();
    assert!(!Arc::ptr_eq(&failed, &rebuilt));
}

#[tokio::test]
async fn direct_and_ipc_connections_behave_alike() {
    let registry = registry();
    let ipc = registry
        .connect_with("sim-ipc", "cfg", ConnectOptions::mock().with_transport(TransportMode::Ipc))
        .await
        .unwrap();
    let direct = registry
        .connect_with(
            "sim-direct",
            "cfg",
            ConnectOptions::mock().with_transport(TransportMode::Direct),
        )
        .await
        .unwrap();
    assert!(ipc.broker().is_some());
    assert!(direct.broker().is_none());

    for conn in [&ipc, &direct] {
        let pid = PidSettings {
            p: 0.5,
            i: 2000.0,
            d: 0.0,
            setpoint: 0.25,
            input: Signal::In1,
            output_direct: OutputDirect::Out1,
        };
        assert_eq!(conn.configure_pid("pid0", &pid).await.unwrap(), "pid0");
        assert_eq!(conn.get_pid_setpoint("pid0").await.unwrap(), 0.25);
        assert_eq!(conn.set_scope_decimation(64).await.unwrap(), 64);

        let err = conn.set_pid_setpoint("pid0", 2.0).await.unwrap_err();
        match err {
            PitayaError::CommandFailed { command, reason } => {
                assert_eq!(command, "pid_set_setpoint");
                assert!(reason.contains("setpoint"), "{reason}");
            }
            other => panic!("expected command failure, got {other}"),
        }
    }

    let reports = registry.shutdown_all().await;
    assert_eq!(reports.len(), 2);
    for (key, report) in reports {
        assert!(report.is_clean(), "{key}: {report:?}");
        assert!(
            report.steps.iter().any(|s| s.name == "disable pid0 output"),
            "{key}: {report:?}"
        );
    }
}

#[tokio::test]
async fn simulated_plant_is_shared_per_address() {
    let registry = registry();
    let ipc = registry.connect("sim-plant", "a", true).await.unwrap();
    let direct = registry
        .connect_with(
            "sim-plant",
            "b",
            ConnectOptions::mock().with_transport(TransportMode::Direct),
        )
        .await
        .unwrap();

    // Both connections go through the registry's one factory and plant bank
    for _ in 0..100 {
        ipc.sim_step(0.4, 1e-4).await.unwrap();
    }
    let metrics = direct.sim_metrics(0.4, 0.02).await.unwrap();
    assert_eq!(metrics.samples, 100);

    let err = {
        let device = LoopbackDevice::spawn().await.unwrap();
        let real = registry.connect(&device.address(), "cfg", false).await.unwrap();
        let err = real.sim_step(0.1, 1e-4).await.unwrap_err();
        real.disconnect().await;
        err
    };
    assert!(err.to_string().contains("not supported"), "{err}");
    registry.shutdown_all().await;
}

#[tokio::test]
async fn mock_and_real_backends_answer_in_the_same_shape() {
    let device = LoopbackDevice::spawn().await.unwrap();
    let registry = ConnectionRegistry::with_factory(
        test_config(),
        Arc::new(StandardBackendFactory::new()),
    )
    .unwrap();
    let sim = registry.connect("sim-parity", "cfg", true).await.unwrap();
    let real = registry.connect(&device.address(), "cfg", false).await.unwrap();

    let asg = AsgSettings {
        waveform: Waveform::Square,
        frequency: 10_000.0,
        amplitude: 0.5,
        offset: 0.0,
        output_direct: OutputDirect::Out2,
    };
    let iq = IqSettings {
        frequency: 10_000.0,
        bandwidth: 100.0,
        input: Signal::In2,
        output_direct: OutputDirect::Off,
    };
    let scope = ScopeSettings {
        decimation: 8,
        trigger_source: TriggerSource::Immediately,
        input: Signal::In1,
        timeout: Duration::from_secs(1),
    };

    let mut shapes = Vec::new();
    for conn in [&sim, &real] {
        assert_eq!(conn.configure_asg("asg1", &asg).await.unwrap(), "asg1");
        assert_eq!(conn.configure_iq("iq0", &iq).await.unwrap(), "iq0");
        assert_eq!(conn.set_pid_setpoint("pid2", 0.125).await.unwrap(), 0.125);
        assert_eq!(conn.get_pid_setpoint("pid2").await.unwrap(), 0.125);
        conn.get_iq_quadratures("iq0").await.unwrap();
        conn.read_sampler("in1").await.unwrap();

        let trace = conn.acquire_scope(&scope).await.unwrap();
        assert_eq!(trace.voltage.len(), trace.time.len());
        shapes.push(trace.len());

        let identity = conn.identify().await.unwrap();
        assert!(!identity.identity.is_empty());

        let err = conn.get_pid_setpoint("pid3").await.unwrap_err();
        assert!(matches!(err, PitayaError::CommandFailed { .. }));
    }
    assert_eq!(shapes[0], shapes[1]);
    assert_eq!(device.value("PID2:SETP").await.as_deref(), Some("0.125"));

    let reports = registry.shutdown_all().await;
    for (key, report) in reports {
        assert!(
            report.steps.iter().any(|s| s.name == "disable asg1 output"),
            "{key}: {report:?}"
        );
    }
    assert_eq!(device.value("ASG1:OUT").await.as_deref(), Some("OFF"));
}

#[tokio::test]
async fn direct_mode_contains_handler_panics() {
    let registry = ConnectionRegistry::with_factory(
        test_config(),
        shared(SlowFactory::new(Duration::ZERO)),
    )
    .unwrap();
    let conn = registry
        .connect_with(
            "sim-direct-panic",
            "cfg",
            ConnectOptions::mock().with_transport(TransportMode::Direct),
        )
        .await
        .unwrap();

    let err = conn.get_iq_quadratures("iq2").await.unwrap_err();
    assert!(err.to_string().contains("quadrature engine exploded"), "{err}");

    // The dispatcher is still usable afterwards
    conn.ping().await.unwrap();
    assert_eq!(conn.set_pid_setpoint("pid0", 0.1).await.unwrap(), 0.1);
    conn.disconnect().await;
}
