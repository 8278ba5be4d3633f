//! Outer frame that actually travels over the GATT characteristics.
//!
//! Wire format:
//! ```text
//! ┌────────────┬──────────────────┬────────────┬──────────────────┬────────────┐
//! │ 5A 5A      │ frameType<<4, 01 │ len (LE)   │ payload          │ CRC16 (LE) │
//! │            │                  │ payload+2  │ (maybe AES-CBC)  │            │
//! └────────────┴──────────────────┴────────────┴──────────────────┴────────────┘
//! ```

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, error};

use crate::crc::crc16;
use crate::crypto::AesKey;
use crate::error::{Error, Result};
use crate::packet::Packet;

pub const PREFIX: [u8; 2] = [0x5A, 0x5A];

/// Prefix, frame type byte, marker byte and length.
pub const HEADER_SIZE: usize = 6;

const CRC_SIZE: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Command = 0x00,
    Protocol = 0x01,
    /// Shifting this into the high nibble leaves zero, same as the firmware does.
    ProtocolInt = 0x10,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadType {
    VxProtocol = 0x00,
    OdmProtocol = 0x04,
}

/// An outer frame ready to be serialized.
///
/// The payload is encrypted if and only if a key is attached.
#[derive(Debug, Clone)]
pub struct EncPacket<'a> {
    pub frame_type: FrameType,
    pub payload_type: PayloadType,
    pub payload: &'a [u8],
    pub key: Option<&'a AesKey>,
}

impl<'a> EncPacket<'a> {
    pub fn new(frame_type: FrameType, payload_type: PayloadType, payload: &'a [u8]) -> Self {
        Self {
            frame_type,
            payload_type,
            payload,
            key: None,
        }
    }

    pub fn encrypted(mut self, key: &'a AesKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let payload = match self.key {
            Some(key) => key.encrypt(self.payload),
            None => self.payload.to_vec(),
        };

        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        data.extend_from_slice(&PREFIX);
        data.push((self.frame_type as u8) << 4);
        data.push(0x01);
        data.extend_from_slice(&((payload.len() + CRC_SIZE) as u16).to_le_bytes());
        data.extend_from_slice(&payload);
        let crc = crc16(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        data
    }
}

/// Parse a single unencrypted outer frame, returning its payload.
///
/// Used for the handshake responses that arrive before any session key exists.
pub fn parse_simple(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < HEADER_SIZE + CRC_SIZE {
        return Err(Error::FrameTooShort { len: data.len(), min: HEADER_SIZE + CRC_SIZE });
    }
    if data[..2] != PREFIX {
        return Err(Error::BadPrefix(hex::encode(&data[..2])));
    }

    let end = HEADER_SIZE + u16::from_le_bytes([data[4], data[5]]) as usize;
    if end < HEADER_SIZE + CRC_SIZE || end > data.len() {
        return Err(Error::FrameTooShort { len: data.len(), min: end.max(HEADER_SIZE + CRC_SIZE) });
    }

    let (body, trailer) = data[..end].split_at(end - CRC_SIZE);
    let actual = u16::from_le_bytes([trailer[0], trailer[1]]);
    let expected = crc16(body);
    if actual != expected {
        return Err(Error::EncPacketChecksum { expected, actual });
    }

    Ok(body[HEADER_SIZE..].to_vec())
}

/// Reassembles outer frames from notification deliveries.
///
/// A delivery may hold several frames and may end in the middle of one. The
/// unconsumed tail is kept until the next delivery; between calls the buffer is
/// either empty or the prefix of a single incomplete frame.
#[derive(Debug, Default)]
pub struct EncPacketDecoder {
    buffer: BytesMut,
}

impl EncPacketDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one delivery and return the payloads of every complete frame whose
    /// checksum holds. Frames with a bad checksum are logged and skipped.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(data);

        let mut payloads = Vec::new();
        while !self.buffer.is_empty() {
            let prefix_len = self.buffer.len().min(PREFIX.len());
            if self.buffer[..prefix_len] != PREFIX[..prefix_len] {
                error!("Unable to parse encrypted packet - prefix is incorrect: {}", hex::encode(&self.buffer));
                self.buffer.clear();
                break;
            }

            if self.buffer.len() < HEADER_SIZE {
                break;
            }

            let end = HEADER_SIZE + u16::from_le_bytes([self.buffer[4], self.buffer[5]]) as usize;
            if end < HEADER_SIZE + CRC_SIZE {
                error!("Unable to parse encrypted packet - invalid length: {}", hex::encode(&self.buffer));
                self.buffer.clear();
                break;
            }
            if end > self.buffer.len() {
                break;
            }

            let frame = self.buffer.split_to(end).freeze();
            let (body, trailer) = frame.split_at(end - CRC_SIZE);
            let actual = u16::from_le_bytes([trailer[0], trailer[1]]);
            if crc16(body) != actual {
                error!("Unable to parse encrypted packet - incorrect CRC16: {}", hex::encode(&frame));
                continue;
            }

            let mut payload = frame.slice(..end - CRC_SIZE);
            payload.advance(HEADER_SIZE);
            payloads.push(payload);
        }

        payloads
    }

    /// Feed one delivery, decrypt each complete frame with `key` and parse the
    /// inner packets. Anything that fails to decrypt or parse is logged and skipped.
    pub fn decode(&mut self, data: &[u8], key: &AesKey) -> Vec<Packet> {
        debug!("parse enc packets: {}", hex::encode(data));
        self.feed(data)
            .into_iter()
            .filter_map(|payload| {
                let plain = key
                    .decrypt(&payload)
                    .map_err(|err| error!("Unable to decrypt packet: {err}: {}", hex::encode(&payload)))
                    .ok()?;
                debug!("decrypted payload: {}", hex::encode(&plain));
                Packet::from_bytes(&plain)
                    .map_err(|err| error!("Unable to parse packet: {err}: {}", hex::encode(&plain)))
                    .ok()
            })
            .collect()
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
