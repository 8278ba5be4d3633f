//! Session setup as an explicit state machine.
//!
//! Each state knows the request it sends on entry (if any) and how to turn the
//! device's response into the next state. The connection drives it one
//! exchange at a time, so there is never more than one request in flight.

use tracing::{debug, error};

use super::ConnectionState;
use crate::crypto::kdf::SRAND_LEN;
use crate::crypto::{auth_credential, derive_session_key, ecdh_public_key_len, AesKey, EcdhKeyPair, KeyTable};
use crate::enc_packet::{parse_simple, EncPacket, EncPacketDecoder, FrameType, PayloadType};
use crate::error::{Error, Result};
use crate::packet::Packet;

/// Prefix in front of our public key in the key exchange request.
const KEY_EXCHANGE_PREFIX: [u8; 2] = [0x01, 0x00];

/// Command asking for the session key material.
const KEY_INFO_REQUEST: u8 = 0x02;

/// Tag of the key info response.
const KEY_INFO_TAG: u8 = 0x02;

const AUTH_SRC: u8 = 0x21;
const AUTH_DST: u8 = 0x35;
const AUTH_CMD_SET: u8 = 0x35;
const AUTH_STATUS_CMD_ID: u8 = 0x89;
const AUTH_CMD_ID: u8 = 0x86;

const AUTH_OK: [u8; 1] = [0x00];

/// What the state machine needs besides its own state.
pub(crate) struct HandshakeContext<'a> {
    pub address: &'a str,
    pub key_table: &'a KeyTable,
    pub user_id: &'a str,
    pub serial: &'a str,
    pub decoder: &'a mut EncPacketDecoder,
}

#[derive(Debug)]
pub(crate) enum Handshake {
    KeyExchange { keypair: EcdhKeyPair },
    SharedKeySet { shared: AesKey },
    KeyInfoRequested { shared: AesKey },
    SessionKeyDerived { session: AesKey },
    AuthStatusRequested { session: AesKey },
    AuthSent { session: AesKey, credential: Vec<u8> },
    Authenticated { session: AesKey },
    Listening { session: AesKey },
}

impl Handshake {
    pub fn begin() -> Result<Self> {
        Ok(Self::KeyExchange { keypair: EcdhKeyPair::generate()? })
    }

    pub fn state(&self) -> ConnectionState {
        match self {
            Self::KeyExchange { .. } => ConnectionState::KeyExchange,
            Self::SharedKeySet { .. } => ConnectionState::SharedKeySet,
            Self::KeyInfoRequested { .. } => ConnectionState::KeyInfoRequested,
            Self::SessionKeyDerived { .. } => ConnectionState::SessionKeyDerived,
            Self::AuthStatusRequested { .. } => ConnectionState::AuthStatusRequested,
            Self::AuthSent { .. } => ConnectionState::AuthSent,
            Self::Authenticated { .. } => ConnectionState::Authenticated,
            Self::Listening { .. } => ConnectionState::Listening,
        }
    }

    /// The session key once the device accepted our credential.
    pub fn session(&self) -> Option<AesKey> {
        match self {
            Self::Listening { session } => Some(*session),
            _ => None,
        }
    }

    /// Bytes to write on entering this state, `None` for purely local steps.
    pub fn request(&self) -> Result<Option<Vec<u8>>> {
        let request = match self {
            Self::KeyExchange { keypair } => {
                let mut payload = KEY_EXCHANGE_PREFIX.to_vec();
                payload.extend_from_slice(&keypair.public_key()?);
                EncPacket::new(FrameType::Command, PayloadType::VxProtocol, &payload).to_bytes()
            }
            Self::KeyInfoRequested { .. } => {
                EncPacket::new(FrameType::Command, PayloadType::VxProtocol, &[KEY_INFO_REQUEST]).to_bytes()
            }
            Self::AuthStatusRequested { session } => {
                let packet = Packet::new(AUTH_SRC, AUTH_DST, AUTH_CMD_SET, AUTH_STATUS_CMD_ID, Vec::new());
                EncPacket::new(FrameType::Protocol, PayloadType::VxProtocol, &packet.to_bytes())
                    .encrypted(session)
                    .to_bytes()
            }
            Self::AuthSent { session, credential } => {
                let packet = Packet::new(AUTH_SRC, AUTH_DST, AUTH_CMD_SET, AUTH_CMD_ID, credential.clone());
                EncPacket::new(FrameType::Protocol, PayloadType::VxProtocol, &packet.to_bytes())
                    .encrypted(session)
                    .to_bytes()
            }
            Self::SharedKeySet { .. }
            | Self::SessionKeyDerived { .. }
            | Self::Authenticated { .. }
            | Self::Listening { .. } => return Ok(None),
        };
        Ok(Some(request))
    }

    /// Move to the next state given the response to [`request`](Self::request).
    pub fn advance(self, response: Option<&[u8]>, ctx: &mut HandshakeContext<'_>) -> Result<Self> {
        match self {
            Self::KeyExchange { keypair } => {
                let data = parse_simple(require(response, "key exchange")?)?;
                if data.len() < 3 {
                    return Err(Error::FrameTooShort { len: data.len(), min: 3 });
                }
                let (status, curve_type) = (data[1], data[2]);
                let key_len = ecdh_public_key_len(curve_type);
                debug!(address = ctx.address, status, curve_type, "Received device public key");

                let device_key = data
                    .get(3..3 + key_len)
                    .ok_or(Error::FrameTooShort { len: data.len(), min: 3 + key_len })?;
                let secret = keypair.shared_secret(device_key)?;
                Ok(Self::SharedKeySet { shared: AesKey::from_shared_secret(&secret)? })
            }

            Self::SharedKeySet { shared } => Ok(Self::KeyInfoRequested { shared }),

            Self::KeyInfoRequested { shared } => {
                let data = parse_simple(require(response, "key info request")?)?;
                let (&tag, encrypted) = data.split_first().ok_or(Error::EmptyResponse("key info request"))?;
                if tag != KEY_INFO_TAG {
                    error!(address = ctx.address, "Unexpected key info type: {}", hex::encode(&data));
                    return Err(Error::UnexpectedResponseTag { expected: KEY_INFO_TAG, actual: tag });
                }

                let key_info = shared.decrypt(encrypted)?;
                if key_info.len() < SRAND_LEN + 2 {
                    return Err(Error::FrameTooShort { len: key_info.len(), min: SRAND_LEN + 2 });
                }
                let srand = &key_info[..SRAND_LEN];
                let seed = [key_info[SRAND_LEN], key_info[SRAND_LEN + 1]];
                let session_key = derive_session_key(ctx.key_table, seed, srand)?;
                Ok(Self::SessionKeyDerived { session: shared.with_key(session_key) })
            }

            Self::SessionKeyDerived { session } => Ok(Self::AuthStatusRequested { session }),

            Self::AuthStatusRequested { session } => {
                let packet = first_packet(response, "auth status request", &session, ctx)?;
                debug!(address = ctx.address, "Auth status: {}", hex::encode(packet.payload()));
                Ok(Self::AuthSent { session, credential: auth_credential(ctx.user_id, ctx.serial) })
            }

            Self::AuthSent { session, .. } => {
                let packet = first_packet(response, "authentication", &session, ctx)?;
                if packet.payload() != AUTH_OK {
                    error!(address = ctx.address, "Auth failed with response: {}", hex::encode(packet.payload()));
                    return Err(Error::AuthenticationRejected(packet.payload().to_vec()));
                }
                Ok(Self::Authenticated { session })
            }

            Self::Authenticated { session } | Self::Listening { session } => Ok(Self::Listening { session }),
        }
    }
}

fn require<'a>(response: Option<&'a [u8]>, step: &'static str) -> Result<&'a [u8]> {
    response.filter(|data| !data.is_empty()).ok_or(Error::EmptyResponse(step))
}

fn first_packet(
    response: Option<&[u8]>,
    step: &'static str,
    session: &AesKey,
    ctx: &mut HandshakeContext<'_>,
) -> Result<Packet> {
    let data = require(response, step)?;
    ctx.decoder.decode(data, session).into_iter().next().ok_or(Error::EmptyResponse(step))
}
