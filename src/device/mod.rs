//! Supported devices and the telemetry they report.
//!
//! [`new_device`] picks the device variant from the serial number in the
//! advertisement. Every variant implements [`DeviceModel`]: it interprets the
//! packets it knows and keeps typed telemetry, which callers read through
//! [`Device::reading`] after a registered callback fires.

pub mod dpu;
pub mod shp2;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionConfig, ConnectionState, PacketHandler};
use crate::error::{Error, Result};
use crate::packet::Packet;
use crate::transport::Transport;

/// Company id the devices advertise their serial number under.
pub const MANUFACTURER_KEY: u16 = 0xB5B5;

const SERIAL_OFFSET: usize = 1;
const SERIAL_LEN: usize = 16;

/// What the Bluetooth stack saw while scanning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advertisement {
    pub address: String,
    pub local_name: Option<String>,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
}

impl Advertisement {
    /// Raw serial number bytes, if the advertisement carries our manufacturer data.
    pub fn serial(&self) -> Option<&[u8]> {
        let data = self.manufacturer_data.get(&MANUFACTURER_KEY)?;
        let end = data.len().min(SERIAL_OFFSET + SERIAL_LEN);
        data.get(SERIAL_OFFSET..end)
    }
}

/// Stable identity of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub address: String,
    pub name: Option<String>,
    pub name_by_user: Option<String>,
    pub serial: String,
    pub model: &'static str,
}

/// Zero-argument change notification.
pub type Callback = Arc<dyn Fn() + Send + Sync>;

/// Registered change callbacks, each at most once.
#[derive(Default)]
pub struct Callbacks {
    callbacks: Mutex<Vec<Callback>>,
}

impl Callbacks {
    pub fn register(&self, callback: Callback) {
        let mut callbacks = self.callbacks.lock();
        if !callbacks.iter().any(|c| same_callback(c, &callback)) {
            callbacks.push(callback);
        }
    }

    pub fn remove(&self, callback: &Callback) {
        self.callbacks.lock().retain(|c| !same_callback(c, callback));
    }

    pub fn len(&self) -> usize {
        self.callbacks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every callback once. Callbacks may register or remove callbacks.
    pub fn notify_all(&self) {
        let callbacks = self.callbacks.lock().clone();
        for callback in callbacks {
            callback();
        }
    }
}

fn same_callback(a: &Callback, b: &Callback) -> bool {
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Callbacks({})", self.len())
    }
}

/// A kind of telemetry, without its shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TelemetryKind {
    BatteryLevel,
    CircuitPower,
    CircuitCurrent,
    GridPower,
    InUsePower,
    ChannelPower,
    ErrorHappened,
}

/// A kind of telemetry a device reports, with its shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Percent.
    BatteryLevel,
    /// Watts per circuit.
    CircuitPower { circuits: usize },
    /// Amperes per circuit.
    CircuitCurrent { circuits: usize },
    /// Watts drawn from the grid.
    GridPower,
    /// Watts consumed by all circuits.
    InUsePower,
    /// Watts per backup channel.
    ChannelPower { channels: usize },
    /// The device reported at least one error in its last update.
    ErrorHappened,
}

impl Capability {
    pub fn kind(&self) -> TelemetryKind {
        match self {
            Capability::BatteryLevel => TelemetryKind::BatteryLevel,
            Capability::CircuitPower { .. } => TelemetryKind::CircuitPower,
            Capability::CircuitCurrent { .. } => TelemetryKind::CircuitCurrent,
            Capability::GridPower => TelemetryKind::GridPower,
            Capability::InUsePower => TelemetryKind::InUsePower,
            Capability::ChannelPower { .. } => TelemetryKind::ChannelPower,
            Capability::ErrorHappened => TelemetryKind::ErrorHappened,
        }
    }
}

/// Current value of one kind of telemetry. `None` means not reported yet.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    Percent(Option<u32>),
    Power(Option<f32>),
    PowerPerSlot(Vec<Option<f32>>),
    CurrentPerSlot(Vec<Option<f32>>),
    Flag(bool),
}

/// Result of offering a packet to a [`DeviceModel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Update {
    /// Not a packet this model understands.
    Ignored,
    /// Understood, nothing changed.
    Unchanged,
    /// Understood, at least one telemetry field changed.
    Changed,
}

/// Packet interpreter and telemetry store for one device variant.
pub trait DeviceModel: Send + Sync {
    /// Human readable model name.
    fn model(&self) -> &'static str;

    fn capabilities(&self) -> Vec<Capability>;

    /// `None` for kinds the model does not report.
    fn reading(&self, kind: TelemetryKind) -> Option<Reading>;

    /// Interpret one decrypted packet, updating only fields whose value differs.
    fn update(&self, packet: &Packet) -> Update;
}

/// Store `value` in `slot` if it differs, returning whether it did.
pub(crate) fn update<T: PartialEq + Clone>(slot: &mut T, value: &T) -> bool {
    if slot != value {
        *slot = value.clone();
        true
    } else {
        false
    }
}

struct Variant {
    matches: fn(&[u8]) -> bool,
    build: fn(&str) -> Arc<dyn DeviceModel>,
}

const VARIANTS: &[Variant] = &[
    Variant { matches: dpu::DeltaProUltra::matches, build: dpu::DeltaProUltra::build },
    Variant { matches: shp2::SmartHomePanel2::matches, build: shp2::SmartHomePanel2::build },
];

/// Create the device for an advertisement, if it is one we support.
pub fn new_device(adv: &Advertisement, transport: impl Transport + 'static) -> Option<Device> {
    let serial = adv.serial()?;

    let Some(variant) = VARIANTS.iter().find(|variant| (variant.matches)(serial)) else {
        warn!(address = %adv.address, "Unknown SN: {}", String::from_utf8_lossy(serial));
        return None;
    };

    let Ok(serial) = std::str::from_utf8(serial) else {
        warn!(address = %adv.address, "SN is not ASCII: {}", hex::encode(serial));
        return None;
    };

    let model = (variant.build)(&adv.address);
    let info = DeviceInfo {
        address: adv.address.clone(),
        name: adv.local_name.clone(),
        name_by_user: adv.local_name.clone(),
        serial: serial.to_string(),
        model: model.model(),
    };
    debug!(address = %info.address, "Creating new device: {} {:?} ({})", info.model, info.name, info.serial);

    Some(Device {
        info,
        model,
        callbacks: Arc::new(Callbacks::default()),
        transport: Some(Box::new(transport)),
        connection: None,
    })
}

/// A supported device: identity, telemetry and the session to it.
pub struct Device {
    info: DeviceInfo,
    model: Arc<dyn DeviceModel>,
    callbacks: Arc<Callbacks>,
    transport: Option<Box<dyn Transport>>,
    connection: Option<Connection>,
}

impl Device {
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn address(&self) -> &str {
        &self.info.address
    }

    pub fn name(&self) -> Option<&str> {
        self.info.name.as_deref()
    }

    pub fn name_by_user(&self) -> Option<&str> {
        self.info.name_by_user.as_deref()
    }

    pub fn serial(&self) -> &str {
        &self.info.serial
    }

    pub fn model(&self) -> &'static str {
        self.info.model
    }

    pub fn capabilities(&self) -> Vec<Capability> {
        self.model.capabilities()
    }

    pub fn reading(&self, kind: TelemetryKind) -> Option<Reading> {
        self.model.reading(kind)
    }

    pub fn register_callback(&self, callback: Callback) {
        self.callbacks.register(callback);
    }

    pub fn remove_callback(&self, callback: &Callback) {
        self.callbacks.remove(callback);
    }

    pub fn is_connected(&self) -> bool {
        self.connection.as_ref().is_some_and(Connection::is_connected)
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.as_ref().map_or(ConnectionState::Disconnected, Connection::state)
    }

    /// Connect and authenticate. The first call fixes the configuration, later calls reuse it.
    pub async fn connect(&mut self, config: ConnectionConfig) -> Result<()> {
        if let Some(transport) = self.transport.take() {
            self.connection = Some(Connection::new(
                transport,
                self.info.address.clone(),
                self.info.serial.clone(),
                config,
                self.packet_handler(),
            ));
        }

        match self.connection.as_mut() {
            Some(connection) => connection.connect().await,
            None => Err(Error::NotConnected),
        }
    }

    pub async fn disconnect(&mut self) -> Result<()> {
        match self.connection.as_mut() {
            Some(connection) => connection.disconnect().await,
            None => {
                warn!(address = %self.info.address, "Device is not connected");
                Ok(())
            }
        }
    }

    pub async fn wait_disconnected(&self) {
        match &self.connection {
            Some(connection) => connection.wait_disconnected().await,
            None => warn!(address = %self.info.address, "Device is not connected"),
        }
    }

    fn packet_handler(&self) -> PacketHandler {
        let model = self.model.clone();
        let callbacks = self.callbacks.clone();
        Arc::new(move |packet: &Packet| match model.update(packet) {
            Update::Ignored => false,
            Update::Unchanged => true,
            Update::Changed => {
                callbacks.notify_all();
                true
            }
        })
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("info", &self.info)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use prost::Message;

    use super::*;
    use crate::proto::{BackupIncreInfo, ProtoPushAndSet};
    use crate::transport::Notifications;

    struct NoTransport;

    #[async_trait]
    impl Transport for NoTransport {
        async fn connect(&mut self, _max_attempts: u32) -> Result<()> {
            Err(Error::NotConnected)
        }

        async fn write(&mut self, _data: &[u8]) -> Result<()> {
            Err(Error::NotConnected)
        }

        async fn subscribe(&mut self) -> Result<Notifications> {
            Err(Error::NotConnected)
        }

        async fn unsubscribe(&mut self) -> Result<()> {
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<()> {
            Ok(())
        }

        async fn disconnected(&mut self) -> Result<()> {
            Ok(())
        }

        async fn is_connected(&self) -> bool {
            false
        }
    }

    fn advertisement(serial: &[u8]) -> Advertisement {
        let mut data = vec![0x13];
        data.extend_from_slice(serial);
        data.extend_from_slice(&[0x00, 0x01]);
        Advertisement {
            address: "AA:BB:CC:DD:EE:FF".to_string(),
            local_name: Some("EF-HD31".to_string()),
            manufacturer_data: HashMap::from([(MANUFACTURER_KEY, data)]),
        }
    }

    fn counter(device: &Device) -> (Arc<AtomicUsize>, Callback) {
        let count = Arc::new(AtomicUsize::new(0));
        let callback: Callback = {
            let count = count.clone();
            Arc::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        device.register_callback(callback.clone());
        (count, callback)
    }

    fn battery_packet(level: u32) -> Packet {
        let payload = ProtoPushAndSet {
            backup_incre_info: Some(BackupIncreInfo { errcode: None, backup_bat_per: Some(level) }),
        }
        .encode_to_vec();
        Packet::new(0x0B, 0x21, 0x0C, 0x20, payload)
    }

    #[test]
    fn test_dispatch_smart_home_panel() {
        let device = new_device(&advertisement(b"HD31ABCDEFGH1234"), NoTransport).unwrap();
        assert_eq!(device.model(), "Smart Home Panel 2");
        assert_eq!(device.serial(), "HD31ABCDEFGH1234");
        assert_eq!(device.name(), Some("EF-HD31"));
        assert_eq!(device.name_by_user(), Some("EF-HD31"));
        assert!(!device.is_connected());
        assert_eq!(device.state(), ConnectionState::Disconnected);
        assert!(device.capabilities().contains(&Capability::CircuitPower { circuits: 12 }));
    }

    #[test]
    fn test_dispatch_delta_pro_ultra() {
        let device = new_device(&advertisement(b"Y711ABCDEFGH1234"), NoTransport).unwrap();
        assert_eq!(device.model(), "Delta Pro Ultra");
        assert!(device.capabilities().is_empty());
    }

    #[test]
    fn test_dispatch_unknown_serial() {
        assert!(new_device(&advertisement(b"R331ABCDEFGH1234"), NoTransport).is_none());
    }

    #[test]
    fn test_dispatch_without_manufacturer_data() {
        let mut adv = advertisement(b"HD31ABCDEFGH1234");
        adv.manufacturer_data = HashMap::from([(0x004C, vec![0x01, 0x02])]);
        assert!(new_device(&adv, NoTransport).is_none());
    }

    #[test]
    fn test_serial_is_sixteen_bytes_after_offset() {
        let adv = advertisement(b"HD31ABCDEFGH1234");
        assert_eq!(adv.serial(), Some(&b"HD31ABCDEFGH1234"[..]));
    }

    #[test]
    fn test_callbacks_are_deduplicated() {
        let callbacks = Callbacks::default();
        let callback: Callback = Arc::new(|| {});
        callbacks.register(callback.clone());
        callbacks.register(callback.clone());
        assert_eq!(callbacks.len(), 1);
        callbacks.remove(&callback);
        assert!(callbacks.is_empty());
    }

    #[test]
    fn test_changed_packet_notifies_every_callback_once() {
        let device = new_device(&advertisement(b"HD31ABCDEFGH1234"), NoTransport).unwrap();
        let (first, _) = counter(&device);
        let (second, _) = counter(&device);
        let handler = device.packet_handler();

        assert!(handler(&battery_packet(80)));
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(device.reading(TelemetryKind::BatteryLevel), Some(Reading::Percent(Some(80))));
    }

    #[test]
    fn test_unchanged_packet_notifies_nobody() {
        let device = new_device(&advertisement(b"HD31ABCDEFGH1234"), NoTransport).unwrap();
        let handler = device.packet_handler();
        assert!(handler(&battery_packet(80)));

        let (count, _) = counter(&device);
        assert!(handler(&battery_packet(80)));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_removed_callback_is_not_called() {
        let device = new_device(&advertisement(b"HD31ABCDEFGH1234"), NoTransport).unwrap();
        let (count, callback) = counter(&device);
        device.remove_callback(&callback);
        assert!(device.packet_handler()(&battery_packet(55)));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unrecognized_packet() {
        let device = new_device(&advertisement(b"HD31ABCDEFGH1234"), NoTransport).unwrap();
        let (count, _) = counter(&device);
        assert!(!device.packet_handler()(&Packet::new(0x02, 0x21, 0x0C, 0x01, Vec::new())));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disconnect_before_connect() {
        let mut device = new_device(&advertisement(b"Y711ABCDEFGH1234"), NoTransport).unwrap();
        device.disconnect().await.unwrap();
        device.wait_disconnected().await;
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let mut device = new_device(&advertisement(b"Y711ABCDEFGH1234"), NoTransport).unwrap();
        let config = ConnectionConfig::new("12345", crate::crypto::KeyTable::from_bytes(vec![0u8; 16]));
        assert!(matches!(device.connect(config).await, Err(Error::NotConnected)));
        assert_eq!(device.state(), ConnectionState::Disconnected);
    }
}
