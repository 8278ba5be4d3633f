//! A device that answers the handshake in memory.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use efble::crypto::{auth_credential, derive_session_key, AesKey, EcdhKeyPair};
use efble::device::MANUFACTURER_KEY;
use efble::enc_packet::{parse_simple, EncPacket, EncPacketDecoder, FrameType, PayloadType};
use efble::transport::{Notifications, Transport};
use efble::{Advertisement, ConnectionConfig, KeyTable, Packet, Result};

pub const USER_ID: &str = "1234567890";
pub const SERIAL: &str = "HD31ABCDEFGH1234";
pub const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

const SRAND: [u8; 16] = [0x10, 0x32, 0x54, 0x76, 0x98, 0xba, 0xdc, 0xfe, 1, 2, 3, 4, 5, 6, 7, 8];
const SEED: [u8; 2] = [0x03, 0x02];

pub fn key_table() -> KeyTable {
    KeyTable::from_bytes((0..0x11000u32).map(|i| (i * 31 % 256) as u8).collect::<Vec<u8>>())
}

pub fn config() -> ConnectionConfig {
    ConnectionConfig::new(USER_ID, key_table()).with_response_timeout(Duration::from_secs(2))
}

pub fn advertisement(serial: &str) -> Advertisement {
    let mut data = vec![0x13];
    data.extend_from_slice(serial.as_bytes());
    data.extend_from_slice(&[0x00, 0x00, 0x01]);
    Advertisement {
        address: ADDRESS.to_string(),
        local_name: Some("EF-Panel".to_string()),
        manufacturer_data: HashMap::from([(MANUFACTURER_KEY, data)]),
    }
}

/// How the simulated device misbehaves.
#[derive(Debug, Clone, Copy, Default)]
pub struct Faults {
    /// Answer the key info request with this tag instead of 0x02.
    pub key_info_tag: Option<u8>,
    /// Reject the credential even if it is correct.
    pub reject_auth: bool,
    /// Drop the link on the first handshake write of these connects, counted from 1.
    pub drop_handshake_on: &'static [usize],
}

struct State {
    faults: Faults,
    user_id: String,
    serial: String,
    subscriber: Option<mpsc::UnboundedSender<Vec<u8>>>,
    keypair: Option<EcdhKeyPair>,
    shared: Option<AesKey>,
    session: Option<AesKey>,
    decoder: EncPacketDecoder,
    connects: usize,
    authenticated: bool,
}

impl State {
    fn respond(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        if let Some(session) = self.session {
            let packet = self.decoder.decode(request, &session).into_iter().next()?;
            let reply = match packet.cmd_id() {
                0x89 => vec![0x01],
                0x86 => {
                    let accepted = !self.faults.reject_auth
                        && packet.payload() == auth_credential(&self.user_id, &self.serial).as_slice();
                    self.authenticated = accepted;
                    vec![if accepted { 0x00 } else { 0x01 }]
                }
                _ => return None,
            };
            let packet = Packet::new(0x35, 0x21, 0x35, packet.cmd_id(), reply);
            return Some(seal(&packet, &session));
        }

        let payload = parse_simple(request).ok()?;
        match self.shared {
            None => {
                let keypair = EcdhKeyPair::generate().ok()?;
                let secret = keypair.shared_secret(payload.get(2..)?).ok()?;
                self.shared = Some(AesKey::from_shared_secret(&secret).ok()?);

                let mut response = vec![0x01, 0x00, 0x00];
                response.extend_from_slice(&keypair.public_key().ok()?);
                self.keypair = Some(keypair);
                Some(EncPacket::new(FrameType::Command, PayloadType::VxProtocol, &response).to_bytes())
            }
            Some(shared) => {
                if payload != [0x02] {
                    return None;
                }
                let mut key_info = SRAND.to_vec();
                key_info.extend_from_slice(&SEED);

                let mut response = vec![self.faults.key_info_tag.unwrap_or(0x02)];
                response.extend_from_slice(&shared.encrypt(&key_info));
                let session_key = derive_session_key(&key_table(), SEED, &SRAND).ok()?;
                self.session = Some(shared.with_key(session_key));
                Some(EncPacket::new(FrameType::Command, PayloadType::VxProtocol, &response).to_bytes())
            }
        }
    }
}

fn seal(packet: &Packet, session: &AesKey) -> Vec<u8> {
    EncPacket::new(FrameType::Protocol, PayloadType::VxProtocol, &packet.to_bytes())
        .encrypted(session)
        .to_bytes()
}

/// The transport half, handed to the crate under test.
pub struct SimTransport {
    state: Arc<Mutex<State>>,
    link: Arc<watch::Sender<bool>>,
}

/// The test's half: pushes telemetry and pulls the plug.
#[derive(Clone)]
pub struct SimDevice {
    state: Arc<Mutex<State>>,
    link: Arc<watch::Sender<bool>>,
}

pub fn simulated(faults: Faults) -> (SimTransport, SimDevice) {
    let state = Arc::new(Mutex::new(State {
        faults,
        user_id: USER_ID.to_string(),
        serial: SERIAL.to_string(),
        subscriber: None,
        keypair: None,
        shared: None,
        session: None,
        decoder: EncPacketDecoder::new(),
        connects: 0,
        authenticated: false,
    }));
    let link = Arc::new(watch::channel(false).0);
    (
        SimTransport { state: state.clone(), link: link.clone() },
        SimDevice { state, link },
    )
}

impl SimDevice {
    pub fn connects(&self) -> usize {
        self.state.lock().connects
    }

    pub fn authenticated(&self) -> bool {
        self.state.lock().authenticated
    }

    pub fn is_connected(&self) -> bool {
        *self.link.borrow()
    }

    /// Encrypt `packet` with the session key and split it over `chunks` notifications.
    pub fn push(&self, packet: &Packet, chunks: usize) -> bool {
        let state = self.state.lock();
        let (Some(session), Some(subscriber)) = (state.session, state.subscriber.as_ref()) else {
            return false;
        };
        let frame = seal(packet, &session);
        let size = frame.len().div_ceil(chunks.max(1));
        frame.chunks(size).all(|chunk| subscriber.send(chunk.to_vec()).is_ok())
    }

    /// Drop the link as if the device went out of range.
    pub fn drop_link(&self) {
        self.state.lock().subscriber = None;
        self.link.send_replace(false);
    }
}

#[async_trait]
impl Transport for SimTransport {
    async fn connect(&mut self, _max_attempts: u32) -> Result<()> {
        let mut state = self.state.lock();
        state.connects += 1;
        state.keypair = None;
        state.shared = None;
        state.session = None;
        state.authenticated = false;
        state.decoder.clear();
        self.link.send_replace(true);
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if state.session.is_none() && state.shared.is_none() && state.faults.drop_handshake_on.contains(&state.connects) {
            state.subscriber = None;
            self.link.send_replace(false);
            return Ok(());
        }
        if let Some(response) = state.respond(data) {
            if let Some(subscriber) = &state.subscriber {
                let _ = subscriber.send(response);
            }
        }
        Ok(())
    }

    async fn subscribe(&mut self) -> Result<Notifications> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().subscriber = Some(tx);
        Ok(rx)
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        self.state.lock().subscriber = None;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.state.lock().subscriber = None;
        self.link.send_replace(false);
        Ok(())
    }

    async fn disconnected(&mut self) -> Result<()> {
        let mut link = self.link.subscribe();
        let _ = link.wait_for(|up| !*up).await;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        *self.link.borrow()
    }
}

/// Poll `condition` until it holds or a few seconds have passed.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
