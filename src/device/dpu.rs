//! Delta Pro Ultra. Recognized so it can be connected to; no telemetry is decoded yet.

use std::sync::Arc;

use super::{Capability, DeviceModel, Reading, TelemetryKind, Update};
use crate::packet::Packet;

pub const SERIAL_PREFIX: &[u8] = b"Y711";

#[derive(Debug, Default)]
pub struct DeltaProUltra;

impl DeltaProUltra {
    pub fn matches(serial: &[u8]) -> bool {
        serial.starts_with(SERIAL_PREFIX)
    }

    pub(super) fn build(_address: &str) -> Arc<dyn DeviceModel> {
        Arc::new(Self)
    }
}

impl DeviceModel for DeltaProUltra {
    fn model(&self) -> &'static str {
        "Delta Pro Ultra"
    }

    fn capabilities(&self) -> Vec<Capability> {
        Vec::new()
    }

    fn reading(&self, _kind: TelemetryKind) -> Option<Reading> {
        None
    }

    fn update(&self, _packet: &Packet) -> Update {
        Update::Ignored
    }
}

#[test]
fn test_matches() {
    assert!(DeltaProUltra::matches(b"Y711ABCDEFGH1234"));
    assert!(!DeltaProUltra::matches(b"HD31ABCDEFGH1234"));
    assert!(!DeltaProUltra::matches(b"Y71"));
}

#[test]
fn test_every_packet_is_ignored() {
    let packet = Packet::new(0x02, 0x21, 0xFE, 0x15, vec![0x08, 0x01]);
    assert_eq!(DeltaProUltra.update(&packet), Update::Ignored);
    assert_eq!(DeltaProUltra.reading(TelemetryKind::BatteryLevel), None);
}
