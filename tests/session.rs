mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use prost::Message;

use common::{advertisement, config, eventually, simulated, Faults, SimDevice, SERIAL};
use efble::proto::{BackupIncreInfo, LoadInfo, ProtoPushAndSet, ProtoTime};
use efble::{new_device, Callback, ConnectionState, Device, Error, Packet, Reading, TelemetryKind};

fn device(faults: Faults) -> (Device, SimDevice) {
    let (transport, sim) = simulated(faults);
    let device = new_device(&advertisement(SERIAL), transport).unwrap();
    (device, sim)
}

fn counter(device: &Device) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let callback: Callback = {
        let count = count.clone();
        Arc::new(move || {
            count.fetch_add(1, Ordering::SeqCst);
        })
    };
    device.register_callback(callback);
    count
}

fn battery(level: u32) -> Packet {
    let payload = ProtoPushAndSet {
        backup_incre_info: Some(BackupIncreInfo { errcode: None, backup_bat_per: Some(level) }),
    };
    Packet::new(0x0B, 0x21, 0x0C, 0x20, payload.encode_to_vec())
}

fn circuits(watts: Vec<f32>) -> Packet {
    let payload = ProtoTime { load_info: Some(LoadInfo { hall1_watt: watts, hall1_curr: Vec::new() }), watt_info: None };
    Packet::new(0x0B, 0x21, 0x0C, 0x01, payload.encode_to_vec())
}

#[tokio::test]
async fn test_authenticates_and_listens() {
    let (mut device, sim) = device(Faults::default());

    device.connect(config()).await.unwrap();

    assert!(device.is_connected());
    assert_eq!(device.state(), ConnectionState::Listening);
    assert!(sim.authenticated());
    assert_eq!(sim.connects(), 1);
}

#[tokio::test]
async fn test_connect_twice_is_a_no_op() {
    let (mut device, sim) = device(Faults::default());

    device.connect(config()).await.unwrap();
    device.connect(config()).await.unwrap();

    assert!(device.is_connected());
    assert_eq!(sim.connects(), 1);
}

#[tokio::test]
async fn test_rejected_credential() {
    let (mut device, sim) = device(Faults { reject_auth: true, ..Faults::default() });

    let result = device.connect(config()).await;

    assert!(matches!(result, Err(Error::AuthenticationRejected(payload)) if payload == vec![0x01]));
    assert_eq!(device.state(), ConnectionState::Disconnected);
    assert!(!sim.is_connected());
}

#[tokio::test]
async fn test_wrong_key_info_tag() {
    let (mut device, sim) = device(Faults { key_info_tag: Some(0x03), ..Faults::default() });

    let result = device.connect(config()).await;

    assert!(matches!(result, Err(Error::UnexpectedResponseTag { expected: 0x02, actual: 0x03 })));
    assert!(!device.is_connected());
    assert!(!sim.authenticated());
}

#[tokio::test]
async fn test_telemetry_fires_callbacks_on_change() {
    let (mut device, sim) = device(Faults::default());
    let count = counter(&device);
    device.connect(config()).await.unwrap();

    assert!(sim.push(&battery(64), 1));
    assert!(eventually(|| count.load(Ordering::SeqCst) == 1).await);
    assert_eq!(device.reading(TelemetryKind::BatteryLevel), Some(Reading::Percent(Some(64))));

    // Same value, then a change split over three notifications
    assert!(sim.push(&battery(64), 1));
    assert!(sim.push(&circuits(vec![100.0, 250.0]), 3));
    assert!(eventually(|| count.load(Ordering::SeqCst) >= 2).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(count.load(Ordering::SeqCst), 2);

    let Some(Reading::PowerPerSlot(power)) = device.reading(TelemetryKind::CircuitPower) else {
        panic!("expected per circuit power");
    };
    assert_eq!(&power[..3], &[Some(100.0), Some(250.0), None]);
}

#[tokio::test]
async fn test_unrecognized_packet_is_ignored() {
    let (mut device, sim) = device(Faults::default());
    let count = counter(&device);
    device.connect(config()).await.unwrap();

    assert!(sim.push(&Packet::new(0x02, 0x21, 0xFE, 0x15, vec![0x08, 0x01]), 1));
    assert!(sim.push(&battery(12), 2));
    assert!(eventually(|| count.load(Ordering::SeqCst) == 1).await);
    assert!(device.is_connected());
}

#[tokio::test]
async fn test_reconnects_after_drop() {
    let (mut device, sim) = device(Faults::default());
    let count = counter(&device);
    device.connect(config()).await.unwrap();

    sim.drop_link();

    assert!(eventually(|| sim.connects() == 2 && device.is_connected()).await);
    assert!(sim.authenticated());

    assert!(sim.push(&battery(90), 1));
    assert!(eventually(|| count.load(Ordering::SeqCst) == 1).await);
    assert_eq!(device.reading(TelemetryKind::BatteryLevel), Some(Reading::Percent(Some(90))));
}

#[tokio::test]
async fn test_disconnect_does_not_reconnect() {
    let (mut device, sim) = device(Faults::default());
    device.connect(config()).await.unwrap();

    device.disconnect().await.unwrap();

    assert_eq!(device.state(), ConnectionState::Disconnected);
    assert!(!sim.is_connected());
    tokio::time::timeout(Duration::from_secs(1), device.wait_disconnected()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sim.connects(), 1);
}

#[tokio::test]
async fn test_reconnect_after_disconnect() {
    let (mut device, sim) = device(Faults::default());
    device.connect(config()).await.unwrap();
    device.disconnect().await.unwrap();

    device.connect(config()).await.unwrap();

    assert!(device.is_connected());
    assert_eq!(sim.connects(), 2);
}

#[tokio::test]
async fn test_reconnect_survives_drop_during_handshake() {
    let (mut device, sim) = device(Faults { drop_handshake_on: &[2], ..Faults::default() });
    device.connect(config()).await.unwrap();

    sim.drop_link();

    assert!(eventually(|| sim.connects() == 3 && device.is_connected()).await);
    assert!(sim.authenticated());
}

#[tokio::test]
async fn test_reconnect_gives_up_after_max_attempts() {
    let (mut device, sim) = device(Faults { drop_handshake_on: &[2, 3, 4, 5, 6], ..Faults::default() });
    device.connect(config()).await.unwrap();

    sim.drop_link();

    tokio::time::timeout(Duration::from_secs(3), device.wait_disconnected()).await.unwrap();
    assert_eq!(device.state(), ConnectionState::Disconnected);
    assert_eq!(sim.connects(), 5);
}
