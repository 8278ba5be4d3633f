//! [`Transport`] over a `bluest` adapter.

use std::collections::HashMap;

use async_trait::async_trait;
use bluest::{Adapter, AdvertisingDevice, Characteristic, ConnectionEvent, Device, Uuid};
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{Notifications, Transport, NOTIFY_CHARACTERISTIC, WRITE_CHARACTERISTIC};
use crate::device::Advertisement;
use crate::error::{Error, Result};

pub struct BluestTransport {
    adapter: Adapter,
    device: Device,
    write: Option<Characteristic>,
    notify: Option<Characteristic>,
    forwarder: Option<JoinHandle<()>>,
}

impl BluestTransport {
    pub fn new(adapter: Adapter, device: Device) -> Self {
        Self { adapter, device, write: None, notify: None, forwarder: None }
    }

    async fn try_connect(&self, max_attempts: u32) -> Result<()> {
        let mut retries = max_attempts.saturating_sub(1);
        loop {
            match self.adapter.connect_device(&self.device).await {
                Ok(()) => return Ok(()),
                Err(err) if retries > 0 => {
                    warn!(device = ?self.device.id(), "Failed to connect: {err}");
                    retries -= 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn discover_characteristic(&self, id: &str) -> Result<Characteristic> {
        let uuid = Uuid::parse_str(id).map_err(anyhow::Error::from)?;
        for service in self.device.discover_services().await? {
            if let Some(characteristic) = service.discover_characteristics_with_uuid(uuid).await?.first() {
                return Ok(characteristic.clone());
            }
        }
        Err(Error::Transport(anyhow::anyhow!("The device does not expose characteristic {uuid}")))
    }

    fn write_characteristic(&self) -> Result<&Characteristic> {
        self.write.as_ref().ok_or(Error::NotConnected)
    }
}

#[async_trait]
impl Transport for BluestTransport {
    async fn connect(&mut self, max_attempts: u32) -> Result<()> {
        if !self.device.is_connected().await {
            self.try_connect(max_attempts).await?;
        }

        self.write = Some(self.discover_characteristic(WRITE_CHARACTERISTIC).await?);
        self.notify = Some(self.discover_characteristic(NOTIFY_CHARACTERISTIC).await?);
        Ok(())
    }

    async fn acquire_mtu(&mut self) -> Result<Option<usize>> {
        Ok(Some(self.write_characteristic()?.max_write_len()?))
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.write_characteristic()?.write(data).await?;
        Ok(())
    }

    async fn subscribe(&mut self) -> Result<Notifications> {
        self.unsubscribe().await?;

        let notify = self.notify.clone().ok_or(Error::NotConnected)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let (started_tx, started_rx) = oneshot::channel();
        self.forwarder = Some(tokio::spawn(async move {
            let mut reader = match notify.notify().await {
                Ok(reader) => {
                    let _ = started_tx.send(Ok(()));
                    reader
                }
                Err(err) => {
                    let _ = started_tx.send(Err(err));
                    return;
                }
            };
            while let Some(item) = reader.next().await {
                match item {
                    Ok(data) => {
                        debug!("RX notification: 0x{}", hex::encode(&data));
                        if tx.send(data).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!("Notification error: {err}");
                        break;
                    }
                }
            }
        }));

        // Notifications must be on before the caller writes a request
        started_rx.await.map_err(|_| Error::ConnectionClosed)??;
        Ok(rx)
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.unsubscribe().await?;
        self.adapter.disconnect_device(&self.device).await?;
        Ok(())
    }

    async fn disconnected(&mut self) -> Result<()> {
        let mut events = self.adapter.device_connection_events(&self.device).await?;
        if !self.device.is_connected().await {
            return Ok(());
        }
        while let Some(event) = events.next().await {
            if matches!(event, ConnectionEvent::Disconnected) {
                break;
            }
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.device.is_connected().await
    }
}

impl From<&AdvertisingDevice> for Advertisement {
    fn from(adv: &AdvertisingDevice) -> Self {
        let manufacturer_data: HashMap<u16, Vec<u8>> = adv
            .adv_data
            .manufacturer_data
            .iter()
            .map(|data| (data.company_id, data.data.to_vec()))
            .collect();

        Advertisement {
            address: format!("{:?}", adv.device.id()),
            local_name: adv.adv_data.local_name.clone(),
            manufacturer_data,
        }
    }
}
