//! The GATT link the connection drives.
//!
//! Discovery, connection retries and characteristic access belong to the
//! Bluetooth stack; [`Transport`] is the narrow surface the handshake needs from it.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

#[cfg(feature = "bluest")]
mod bluest;

#[cfg(feature = "bluest")]
pub use self::bluest::BluestTransport;

/// Characteristic the controller writes requests to.
pub const WRITE_CHARACTERISTIC: &str = "00000002-0000-1000-8000-00805f9b34fb";

/// Characteristic the device sends responses and telemetry on.
pub const NOTIFY_CHARACTERISTIC: &str = "00000003-0000-1000-8000-00805f9b34fb";

/// Notification deliveries, one `Vec` per notification.
pub type Notifications = mpsc::UnboundedReceiver<Vec<u8>>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the link, trying at most `max_attempts` times.
    async fn connect(&mut self, max_attempts: u32) -> Result<()>;

    /// Negotiate the MTU on backends that need it once after connecting.
    async fn acquire_mtu(&mut self) -> Result<Option<usize>> {
        Ok(None)
    }

    /// Write one request to the write characteristic.
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Start notifications on the notify characteristic.
    async fn subscribe(&mut self) -> Result<Notifications>;

    async fn unsubscribe(&mut self) -> Result<()>;

    async fn disconnect(&mut self) -> Result<()>;

    /// Resolves once the link goes down.
    async fn disconnected(&mut self) -> Result<()>;

    async fn is_connected(&self) -> bool;
}
