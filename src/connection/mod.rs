//! Authenticated session with one device.
//!
//! A [`Connection`] owns the transport through a background supervisor task.
//! The supervisor runs the handshake, then forwards every decrypted packet to
//! the packet handler until the link drops or [`Connection::disconnect`] is
//! called. An unexpected drop is followed by a reconnect as long as the user
//! has not asked to disconnect.

pub mod config;
mod handshake;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use config::ConnectionConfig;

use self::handshake::{Handshake, HandshakeContext};
use crate::crypto::AesKey;
use crate::enc_packet::EncPacketDecoder;
use crate::error::{Error, Result};
use crate::packet::Packet;
use crate::transport::{Notifications, Transport};

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    KeyExchange,
    SharedKeySet,
    KeyInfoRequested,
    SessionKeyDerived,
    AuthStatusRequested,
    AuthSent,
    Authenticated,
    Listening,
}

/// Receives every packet decrypted while listening. Returns whether the packet was understood.
pub type PacketHandler = Arc<dyn Fn(&Packet) -> bool + Send + Sync>;

/// Everything the supervisor task needs, handed back to the [`Connection`] when it exits.
struct Link {
    address: String,
    serial: String,
    config: ConnectionConfig,
    transport: Box<dyn Transport>,
    decoder: EncPacketDecoder,
    handler: PacketHandler,
    session: Option<AesKey>,
    state: Arc<watch::Sender<ConnectionState>>,
}

enum ListenEnd {
    Cancelled,
    Dropped,
}

impl Link {
    fn set_state(&self, state: ConnectionState) {
        if self.state.send_replace(state) != state {
            debug!(address = %self.address, "State changed to {state:?}");
        }
    }

    /// Write one request and wait for the next notification.
    async fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        let mut notifications = self.transport.subscribe().await?;
        debug!(address = %self.address, "TX: {}", hex::encode(request));
        self.transport.write(request).await?;
        let response = timeout(self.config.response_timeout, notifications.recv()).await;
        self.transport.unsubscribe().await?;

        match response {
            Ok(Some(data)) => Ok(data),
            Ok(None) => Err(Error::ConnectionClosed),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Connect, authenticate and start notifications for telemetry.
    async fn establish(&mut self) -> Result<Notifications> {
        self.set_state(ConnectionState::Connecting);
        self.session = None;
        info!(address = %self.address, "Connecting");

        self.transport.connect(self.config.max_attempts).await?;
        if let Some(mtu) = self.transport.acquire_mtu().await? {
            debug!(address = %self.address, mtu, "MTU acquired");
        }
        self.decoder.clear();

        let mut handshake = Handshake::begin()?;
        let session = loop {
            self.set_state(handshake.state());
            let response = match handshake.request()? {
                Some(request) => Some(self.exchange(&request).await?),
                None => None,
            };

            let mut ctx = HandshakeContext {
                address: &self.address,
                key_table: &self.config.key_table,
                user_id: &self.config.user_id,
                serial: &self.serial,
                decoder: &mut self.decoder,
            };
            handshake = handshake.advance(response.as_deref(), &mut ctx)?;
            if let Some(session) = handshake.session() {
                break session;
            }
        };

        let notifications = self.transport.subscribe().await?;
        self.session = Some(session);
        self.set_state(ConnectionState::Listening);
        info!(address = %self.address, serial = %self.serial, "Session established");
        Ok(notifications)
    }

    async fn listen(&mut self, mut notifications: Notifications, cancel: &CancellationToken) -> ListenEnd {
        let Self { address, transport, decoder, handler, session, .. } = self;
        let Some(session) = *session else {
            return ListenEnd::Dropped;
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return ListenEnd::Cancelled,
                result = transport.disconnected() => {
                    if let Err(err) = result {
                        warn!(address = %address, "Lost track of the link: {err}");
                    }
                    return ListenEnd::Dropped;
                }
                data = notifications.recv() => match data {
                    Some(data) => {
                        for packet in decoder.decode(&data, &session) {
                            if !handler(&packet) {
                                debug!(
                                    address = %address,
                                    "Unhandled packet: src {:#04x} cmd_set {:#04x} cmd_id {:#04x}: {}",
                                    packet.src(),
                                    packet.cmd_set(),
                                    packet.cmd_id(),
                                    hex::encode(packet.payload())
                                );
                            }
                        }
                    }
                    None => return ListenEnd::Dropped,
                },
            }
        }
    }

    async fn close(&mut self) {
        if let Err(err) = self.transport.unsubscribe().await {
            warn!(address = %self.address, "Failed to stop notifications: {err}");
        }
        if self.transport.is_connected().await {
            if let Err(err) = self.transport.disconnect().await {
                warn!(address = %self.address, "Failed to disconnect: {err}");
            }
        }
        self.session = None;
        self.decoder.clear();
    }
}

async fn supervise(
    mut link: Link,
    retry: Arc<AtomicBool>,
    cancel: CancellationToken,
    ready: oneshot::Sender<Result<()>>,
) -> Link {
    let mut ready = Some(ready);
    // Consecutive reconnects that failed on the link
    let mut failures = 0;

    loop {
        let established = tokio::select! {
            _ = cancel.cancelled() => None,
            result = link.establish() => Some(result),
        };

        let notifications = match established {
            None => break,
            Some(Ok(notifications)) => {
                failures = 0;
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Ok(()));
                }
                notifications
            }
            Some(Err(err)) => {
                if let Some(ready) = ready.take() {
                    error!(address = %link.address, "Failed to establish session: {err}");
                    let _ = ready.send(Err(err));
                    break;
                }

                failures += 1;
                if err.is_link_failure() && retry.load(Ordering::SeqCst) && failures < link.config.max_attempts {
                    warn!(address = %link.address, attempt = failures, "Reconnect failed, retrying: {err}");
                    link.close().await;
                    continue;
                }
                error!(address = %link.address, "Failed to re-establish session: {err}");
                break;
            }
        };

        match link.listen(notifications, &cancel).await {
            ListenEnd::Cancelled => break,
            ListenEnd::Dropped if retry.load(Ordering::SeqCst) => {
                warn!(address = %link.address, "Connection lost, reconnecting");
            }
            ListenEnd::Dropped => {
                info!(address = %link.address, "Connection closed by device");
                break;
            }
        }
    }

    link.close().await;
    link.set_state(ConnectionState::Disconnected);
    info!(address = %link.address, "Disconnected");
    link
}

/// An encrypted session with one device, reconnecting while wanted.
pub struct Connection {
    address: String,
    link: Option<Link>,
    task: Option<JoinHandle<Link>>,
    retry: Arc<AtomicBool>,
    cancel: CancellationToken,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl Connection {
    pub fn new(
        transport: Box<dyn Transport>,
        address: impl Into<String>,
        serial: impl Into<String>,
        config: ConnectionConfig,
        handler: PacketHandler,
    ) -> Self {
        let address = address.into();
        let state = Arc::new(watch::channel(ConnectionState::Disconnected).0);
        let link = Link {
            address: address.clone(),
            serial: serial.into(),
            config,
            transport,
            decoder: EncPacketDecoder::new(),
            handler,
            session: None,
            state: state.clone(),
        };

        Self {
            address,
            link: Some(link),
            task: None,
            retry: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            state,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// True only once the session is authenticated and telemetry is flowing.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Listening
    }

    /// Connect and authenticate, resolving once the session is listening.
    ///
    /// Calling this on a listening connection does nothing. If a reconnect is
    /// in flight its outcome is awaited instead of starting another one.
    pub async fn connect(&mut self) -> Result<()> {
        self.retry.store(true, Ordering::SeqCst);

        if self.task.as_ref().is_some_and(|task| !task.is_finished()) {
            if self.is_connected() {
                warn!(address = %self.address, "Already connected");
                return Ok(());
            }

            let mut states = self.state.subscribe();
            let state = *states
                .wait_for(|state| matches!(state, ConnectionState::Listening | ConnectionState::Disconnected))
                .await
                .map_err(|_| Error::ConnectionClosed)?;
            if state == ConnectionState::Listening {
                return Ok(());
            }
        }

        self.reclaim().await?;
        let link = self.link.take().ok_or(Error::NotConnected)?;

        self.cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        self.task = Some(tokio::spawn(supervise(link, self.retry.clone(), self.cancel.clone(), ready_tx)));

        let result = ready_rx.await.unwrap_or(Err(Error::ConnectionClosed));
        if result.is_err() {
            self.reclaim().await?;
        }
        result
    }

    /// Stop listening, disable reconnects and close the link.
    pub async fn disconnect(&mut self) -> Result<()> {
        self.retry.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        self.reclaim().await
    }

    /// Resolves once the connection is down for good: the device went away
    /// with reconnects disabled, a reconnect failed, or [`disconnect`](Self::disconnect) was called.
    pub async fn wait_disconnected(&self) {
        let mut states = self.state.subscribe();
        let _ = states.wait_for(|state| *state == ConnectionState::Disconnected).await;
    }

    async fn reclaim(&mut self) -> Result<()> {
        if let Some(task) = self.task.take() {
            self.link = Some(task.await?);
        }
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.retry.store(false, Ordering::SeqCst);
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address)
            .field("state", &self.state())
            .finish()
    }
}
