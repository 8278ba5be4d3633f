//! Talk to EcoFlow power stations and home panels over Bluetooth Low Energy
//!
//! Tested with a Smart Home Panel 2. A Delta Pro Ultra is recognized and can be connected to, but none of its
//! telemetry is decoded yet.
//!
//! The devices speak a proprietary protocol on top of two GATT characteristics. A session starts with an
//! ECDH key exchange on SECP160r1, continues with a session key derived from a vendor key table and ends
//! with the controller proving it knows the user id the device is bound to. After that the device pushes
//! AES-CBC encrypted frames carrying protobuf telemetry.
//!
//! Currently the following data can be accessed on the Smart Home Panel 2:
//!
//! - Battery level (%)
//! - Power and current per circuit (W, A)
//! - Grid power and total power in use (W)
//! - Power per backup channel (W)
//! - Whether the panel reports an error
//!
//! # Example
//!
//! ```ignore
//! # use std::sync::Arc;
//! # use efble::{ConnectionConfig, KeyTable, TelemetryKind};
//! #
//! # #[tokio::main]
//! # pub async fn main() -> efble::Result<()> {
//!     let config = ConnectionConfig::new("1234567890", KeyTable::from_file("keydata.bin")?);
//!     // `adv` and `transport` come from scanning, see the `efble` binary
//!     let mut device = efble::new_device(&adv, transport).expect("not a supported device");
//!     device.register_callback(Arc::new(|| println!("telemetry changed")));
//!     device.connect(config).await?;
//!     println!("{:?}", device.reading(TelemetryKind::BatteryLevel));
//!     device.wait_disconnected().await;
//! #   Ok(())
//! # }
//! ```

pub mod connection;
pub mod crc;
pub mod crypto;
pub mod device;
pub mod enc_packet;
pub mod error;
pub mod packet;
pub mod proto;
pub mod transport;

pub use connection::{Connection, ConnectionConfig, ConnectionState, PacketHandler};
pub use crypto::KeyTable;
pub use device::{new_device, Advertisement, Callback, Capability, Device, DeviceInfo, Reading, TelemetryKind};
pub use error::{Error, Result};
pub use packet::Packet;
pub use transport::Transport;
