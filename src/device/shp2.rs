//! Smart Home Panel 2.
//!
//! The panel pushes two messages from its main board (`src` 0x0B, `cmd_set` 0x0C):
//!
//! cmd_id | Message           | Fields used
//! 0x01   | `ProtoTime`       | per circuit watts and amps, grid watts, per channel watts, in use watts
//! 0x20   | `ProtoPushAndSet` | error codes, battery percentage

use std::sync::Arc;

use parking_lot::RwLock;
use prost::Message;
use tracing::{debug, warn};

use super::{update, Capability, DeviceModel, Reading, TelemetryKind, Update};
use crate::packet::Packet;
use crate::proto::{ProtoPushAndSet, ProtoTime};

pub const SERIAL_PREFIX: &[u8] = b"HD31";

pub const CIRCUITS: usize = 12;
pub const CHANNELS: usize = 3;

const SRC: u8 = 0x0B;
const CMD_SET: u8 = 0x0C;
const CMD_ID_STATUS: u8 = 0x01;
const CMD_ID_BACKUP: u8 = 0x20;

// Error slots that hold this code are empty
const NO_ERROR: [u8; 8] = [0; 8];

#[derive(Debug, Clone, Default, PartialEq)]
struct Telemetry {
    circuit_power: [Option<f32>; CIRCUITS],
    circuit_current: [Option<f32>; CIRCUITS],
    grid_power: Option<f32>,
    in_use_power: Option<f32>,
    channel_power: [Option<f32>; CHANNELS],
    error_count: usize,
    battery_level: Option<u32>,
}

#[derive(Debug)]
pub struct SmartHomePanel2 {
    address: String,
    telemetry: RwLock<Telemetry>,
}

impl SmartHomePanel2 {
    pub fn new(address: impl Into<String>) -> Self {
        Self { address: address.into(), telemetry: RwLock::new(Telemetry::default()) }
    }

    pub fn matches(serial: &[u8]) -> bool {
        serial.starts_with(SERIAL_PREFIX)
    }

    pub(super) fn build(address: &str) -> Arc<dyn DeviceModel> {
        Arc::new(Self::new(address))
    }

    fn update_status(&self, payload: &[u8]) -> Update {
        let msg = match ProtoTime::decode(payload) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(address = %self.address, "Unable to decode status: {err}");
                return Update::Ignored;
            }
        };
        debug!(address = %self.address, "Parsed data: {msg:?}");

        let mut telemetry = self.telemetry.write();
        let t = &mut *telemetry;
        let mut changed = false;

        if let Some(load) = &msg.load_info {
            for (slot, watt) in t.circuit_power.iter_mut().zip(&load.hall1_watt) {
                changed |= update(slot, &Some(*watt));
            }
            for (slot, amp) in t.circuit_current.iter_mut().zip(&load.hall1_curr) {
                changed |= update(slot, &Some(*amp));
            }
        }

        if let Some(watt) = &msg.watt_info {
            changed |= update(&mut t.grid_power, &Some(watt.grid_watt.unwrap_or(0.0)));
            for (slot, ch) in t.channel_power.iter_mut().zip(&watt.ch_watt) {
                changed |= update(slot, &Some(*ch));
            }
            if let Some(all) = watt.all_hall_watt {
                changed |= update(&mut t.in_use_power, &Some(all));
            }
        }

        if changed {
            Update::Changed
        } else {
            Update::Unchanged
        }
    }

    fn update_backup(&self, payload: &[u8]) -> Update {
        let msg = match ProtoPushAndSet::decode(payload) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(address = %self.address, "Unable to decode backup info: {err}");
                return Update::Ignored;
            }
        };
        debug!(address = %self.address, "Parsed data: {msg:?}");

        let Some(info) = &msg.backup_incre_info else {
            warn!(address = %self.address, "Unable to find expected field 'backup_incre_info': {msg:?}");
            return Update::Ignored;
        };

        let mut t = self.telemetry.write();
        let mut changed = false;

        if let Some(errcode) = &info.errcode {
            let errors: Vec<&Vec<u8>> = errcode.err_code.iter().filter(|code| code[..] != NO_ERROR).collect();
            if errors.len() > t.error_count {
                let errors: Vec<String> = errors.iter().map(hex::encode).collect();
                warn!(address = %self.address, "Error happened on device: {errors:?}");
            }
            changed |= update(&mut t.error_count, &errors.len());
        }

        if let Some(level) = info.backup_bat_per {
            changed |= update(&mut t.battery_level, &Some(level));
        }

        if changed {
            Update::Changed
        } else {
            Update::Unchanged
        }
    }
}

impl DeviceModel for SmartHomePanel2 {
    fn model(&self) -> &'static str {
        "Smart Home Panel 2"
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![
            Capability::BatteryLevel,
            Capability::CircuitPower { circuits: CIRCUITS },
            Capability::CircuitCurrent { circuits: CIRCUITS },
            Capability::GridPower,
            Capability::InUsePower,
            Capability::ChannelPower { channels: CHANNELS },
            Capability::ErrorHappened,
        ]
    }

    fn reading(&self, kind: TelemetryKind) -> Option<Reading> {
        let t = self.telemetry.read();
        let reading = match kind {
            TelemetryKind::BatteryLevel => Reading::Percent(t.battery_level),
            TelemetryKind::CircuitPower => Reading::PowerPerSlot(t.circuit_power.to_vec()),
            TelemetryKind::CircuitCurrent => Reading::CurrentPerSlot(t.circuit_current.to_vec()),
            TelemetryKind::GridPower => Reading::Power(t.grid_power),
            TelemetryKind::InUsePower => Reading::Power(t.in_use_power),
            TelemetryKind::ChannelPower => Reading::PowerPerSlot(t.channel_power.to_vec()),
            TelemetryKind::ErrorHappened => Reading::Flag(t.error_count > 0),
        };
        Some(reading)
    }

    fn update(&self, packet: &Packet) -> Update {
        if packet.src() != SRC || packet.cmd_set() != CMD_SET {
            return Update::Ignored;
        }

        match packet.cmd_id() {
            CMD_ID_STATUS => self.update_status(packet.payload()),
            CMD_ID_BACKUP => self.update_backup(packet.payload()),
            _ => Update::Ignored,
        }
    }
}
