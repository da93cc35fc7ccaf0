use super::*;
use crate::{
    test_support::{FakeFactory, FakeLink, RecordingListener, RecordingLog},
    transport::MqttParams,
};
use shared::domain::rest_position;
use std::sync::atomic::Ordering;

struct Harness {
    dispatcher: Arc<CommandDispatcher>,
    link: FakeLink,
    log: RecordingLog,
    listener: RecordingListener,
}

fn harness_with(mode: ConnectionMode, config: ServoConfig) -> Harness {
    let link = FakeLink::default();
    let log = RecordingLog::default();
    let listener = RecordingListener::default();
    let dispatcher = CommandDispatcher::new_with_dependencies(
        Arc::new(FakeFactory(link.clone())),
        Arc::new(log.clone()),
        Arc::new(listener.clone()),
        DispatcherOptions {
            mode,
            config,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        },
    );
    Harness {
        dispatcher,
        link,
        log,
        listener,
    }
}

fn harness() -> Harness {
    harness_with(ConnectionMode::Serial, ServoConfig::default())
}

fn serial_params() -> ConnectParams {
    ConnectParams::serial("COM3", &ServoConfig::default())
}

async fn connected() -> Harness {
    let h = harness();
    h.dispatcher.connect(serial_params()).await.expect("connect");
    h
}

#[tokio::test]
async fn send_while_disconnected_never_touches_the_transport() {
    let h = harness();
    let outcome = h
        .dispatcher
        .send_command("ALL:90,90,90,90,90,90", "PRESET: HOME")
        .await
        .expect("no-op");
    assert_eq!(outcome, SendOutcome::NotConnected);
    assert!(h.link.wire().is_empty());
    assert!(h.link.events().is_empty());
    assert!(h.log.lines().is_empty());
}

#[tokio::test]
async fn all_command_reaches_the_wire_with_one_terminator() {
    let h = connected().await;
    let outcome = h
        .dispatcher
        .move_all([0, 45, 180, 90, 90, 20], "SEQUENCE: rest")
        .await
        .expect("send");
    assert!(outcome.is_sent());
    h.dispatcher
        .send_command("S1:90\n", "Servo 1")
        .await
        .expect("send");

    assert_eq!(h.link.wire(), ["ALL:0,45,180,90,90,20\n", "S1:90\n"]);
    let lines = h.log.lines();
    assert_eq!(
        lines[lines.len() - 2..],
        [
            "[SERIAL] SEQUENCE: rest: ALL:0,45,180,90,90,20".to_string(),
            "[SERIAL] Servo 1: S1:90".to_string(),
        ]
    );
}

#[tokio::test]
async fn connect_updates_state_and_notifies_listener() {
    let h = harness();
    let mut state = h.dispatcher.watch_state();
    h.dispatcher.connect(serial_params()).await.expect("connect");

    assert!(state.has_changed().expect("watch"));
    assert_eq!(
        *state.borrow_and_update(),
        ConnectionState {
            mode: ConnectionMode::Serial,
            connected: true
        }
    );
    assert_eq!(h.listener.changes(), [true]);
    assert!(h.log.lines()[0].starts_with("Connected via Serial to COM3"));

    // Reconnecting an open link is a no-op.
    h.dispatcher.connect(serial_params()).await.expect("again");
    assert_eq!(h.link.events(), ["open:SERIAL"]);
}

#[tokio::test]
async fn select_mode_closes_the_old_link_before_switching() {
    let h = connected().await;
    h.dispatcher.select_mode(ConnectionMode::Mqtt).await;

    assert_eq!(h.link.events(), ["open:SERIAL", "close:SERIAL"]);
    assert_eq!(
        h.dispatcher.state(),
        ConnectionState {
            mode: ConnectionMode::Mqtt,
            connected: false
        }
    );
    assert_eq!(h.listener.changes(), [true, false]);

    let mqtt = ConnectParams::mqtt(&ServoConfig::default()).expect("params");
    h.dispatcher.connect(mqtt).await.expect("connect mqtt");
    assert_eq!(h.link.events(), ["open:SERIAL", "close:SERIAL", "open:MQTT"]);

    h.dispatcher
        .gripper(GripperAction::Open)
        .await
        .expect("send");
    assert!(h.log.lines().contains(&"[MQTT] Servo 6: S6:30".to_string()));
}

#[tokio::test]
async fn params_for_another_mode_are_rejected() {
    let h = harness();
    let mqtt = ConnectParams::mqtt(&ServoConfig::default()).expect("params");
    let err = h.dispatcher.connect(mqtt).await.expect_err("wrong mode");
    assert_eq!(err.code, ErrorCode::Connection);
    assert!(h.link.events().is_empty());
    assert!(!h.dispatcher.state().connected);
}

#[tokio::test]
async fn failed_connect_reports_a_connection_error() {
    let h = harness();
    h.link.fail_open.store(true, Ordering::SeqCst);

    let err = h
        .dispatcher
        .connect(serial_params())
        .await
        .expect_err("refused");
    assert_eq!(err.code, ErrorCode::Connection);
    assert_eq!(err.label, "CONNECT");
    assert!(!h.dispatcher.state().connected);
    assert!(h.listener.changes().is_empty());
    assert_eq!(h.log.lines().len(), 1);
    assert!(h.log.lines()[0].starts_with("Connection error: timed out"));
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let h = connected().await;
    h.dispatcher.disconnect().await;
    h.dispatcher.disconnect().await;

    assert_eq!(h.link.events(), ["open:SERIAL", "close:SERIAL"]);
    assert_eq!(h.listener.changes(), [true, false]);
    let disconnects = h
        .log
        .lines()
        .iter()
        .filter(|line| *line == "Disconnected")
        .count();
    assert_eq!(disconnects, 1);
}

#[tokio::test]
async fn failed_send_writes_one_log_line_and_keeps_the_link() {
    let h = connected().await;
    let before = h.log.lines().len();
    h.link.fail_send_at.store(0, Ordering::SeqCst);

    let err = h
        .dispatcher
        .send_command("S2:10", "Servo 2")
        .await
        .expect_err("injected");
    assert_eq!(err.code, ErrorCode::Send);
    assert_eq!(err.label, "Servo 2");
    assert_eq!(h.log.lines().len(), before + 1);
    assert_eq!(
        h.log.lines().last().map(String::as_str),
        Some("[SERIAL] Servo 2 failed: send failed: injected failure")
    );
    assert!(h.dispatcher.state().connected);

    h.dispatcher
        .send_command("S2:10", "Servo 2")
        .await
        .expect("second attempt");
    assert_eq!(h.link.wire(), ["S2:10\n"]);
}

#[tokio::test(start_paused = true)]
async fn stalled_send_times_out() {
    let h = connected().await;
    h.link.hang_send.store(true, Ordering::SeqCst);

    let err = h
        .dispatcher
        .send_command("S1:0", "Servo 1")
        .await
        .expect_err("timeout");
    assert_eq!(err.code, ErrorCode::Send);
    assert_eq!(err.message, "send timed out after 2000ms");

    // A timeout is a send failure only; the link stays up for the next command.
    assert!(h.dispatcher.state().connected);
    assert_eq!(h.listener.changes(), [true]);
    h.link.hang_send.store(false, Ordering::SeqCst);
    let outcome = h
        .dispatcher
        .send_command("S1:10", "Servo 1")
        .await
        .expect("link still open");
    assert_eq!(outcome, SendOutcome::Sent);
    assert_eq!(h.link.wire(), ["S1:10\n"]);
}

#[tokio::test]
async fn dropped_link_marks_the_dispatcher_disconnected() {
    let h = connected().await;
    h.link.drop_link.store(true, Ordering::SeqCst);

    let err = h
        .dispatcher
        .send_command("S1:0", "Servo 1")
        .await
        .expect_err("closed");
    assert_eq!(err.code, ErrorCode::Send);
    assert!(!h.dispatcher.state().connected);
    assert_eq!(h.listener.changes(), [true, false]);
    assert!(h.link.wire().is_empty());

    // Later sends are quiet no-ops until the operator reconnects.
    assert_eq!(
        h.dispatcher.send_command("S1:0", "Servo 1").await,
        Ok(SendOutcome::NotConnected)
    );
}

#[tokio::test]
async fn servo_moves_are_validated_and_clamped() {
    let mut config = ServoConfig::default();
    config.max_angles[0] = 120;
    config.min_angles[5] = 40;
    let h = harness_with(ConnectionMode::Serial, config);
    h.dispatcher.connect(serial_params()).await.expect("connect");

    h.dispatcher.move_servo(1, 170).await.expect("clamped");
    h.dispatcher
        .gripper(GripperAction::Open)
        .await
        .expect("gripper");
    let err = h.dispatcher.move_servo(7, 10).await.expect_err("no servo 7");
    assert_eq!(err.code, ErrorCode::Validation);

    h.dispatcher
        .smooth_move([200, 90, 90, 90, 90, 0], 1500)
        .await
        .expect("smooth");

    assert_eq!(
        h.link.wire(),
        ["S1:120\n", "S6:40\n", "SMOOTH:120,90,90,90,90,40,1500\n"]
    );
}

#[tokio::test]
async fn presets_are_labelled_by_name() {
    let h = connected().await;
    h.dispatcher.go_to(&rest_position()).await.expect("preset");
    assert_eq!(
        h.log.lines().last().map(String::as_str),
        Some("[SERIAL] PRESET: REPOSO: ALL:0,45,180,90,90,20")
    );
}

#[tokio::test]
async fn controller_lines_are_logged_and_published() {
    let h = connected().await;
    let mut replies = h.dispatcher.subscribe_replies();
    h.link.inbound.send("ACK:S1=90".into()).expect("inbound");

    let reply = tokio::time::timeout(Duration::from_secs(1), replies.recv())
        .await
        .expect("reply in time")
        .expect("reply");
    assert_eq!(reply, ControllerReply::ServoAck { servo: 1, angle: 90 });
    assert!(h.log.lines().contains(&"MCU: ACK:S1=90".to_string()));
}

#[tokio::test]
async fn baud_rate_change_reopens_a_live_serial_link() {
    let h = connected().await;
    let mut config = ServoConfig::default();
    config.baud_rate = 115200;

    h.dispatcher.apply_config(config.clone()).await.expect("apply");
    assert_eq!(
        h.link.events(),
        ["open:SERIAL", "close:SERIAL", "open:SERIAL"]
    );
    assert!(h.dispatcher.state().connected);
    assert_eq!(h.dispatcher.config().await, config);
    assert_eq!(
        h.log.lines().last().map(String::as_str),
        Some("Configuration applied")
    );

    config.baud_rate = 1234;
    let err = h.dispatcher.apply_config(config).await.expect_err("invalid");
    assert_eq!(err.code, ErrorCode::Validation);
    assert_eq!(h.dispatcher.config().await.baud_rate, 115200);
}

#[tokio::test]
async fn serial_params_need_a_port() {
    let h = harness();
    let err = h
        .dispatcher
        .connect_params(Some("  "))
        .await
        .expect_err("no port");
    assert_eq!(err.code, ErrorCode::Validation);
    assert_eq!(
        h.dispatcher.connect_params(Some("COM4")).await,
        Ok(ConnectParams::serial("COM4", &ServoConfig::default()))
    );
}

#[tokio::test]
async fn silent_broker_is_a_connection_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let log = RecordingLog::default();
    let dispatcher = CommandDispatcher::new_with_dependencies(
        Arc::new(DefaultTransportFactory),
        Arc::new(log.clone()),
        Arc::new(NoopConnectionListener),
        DispatcherOptions {
            mode: ConnectionMode::Mqtt,
            ..DispatcherOptions::default()
        },
    );

    let err = dispatcher
        .connect(ConnectParams::Mqtt(MqttParams {
            host: "127.0.0.1".into(),
            port,
            topic: "arm/cmd".into(),
            client_id: "arm-control-test".into(),
            connect_timeout: Duration::from_millis(200),
        }))
        .await
        .expect_err("no connack");
    assert_eq!(err.code, ErrorCode::Connection);
    assert!(!dispatcher.state().connected);
    assert_eq!(
        dispatcher.send_command("S1:90", "Servo 1").await,
        Ok(SendOutcome::NotConnected)
    );
    drop(listener);
}
