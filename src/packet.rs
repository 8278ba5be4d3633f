//! Inner frame exchanged once the session is authenticated.
//!
//! The frame format is:
//!
//! Start Byte | End Byte | Meaning
//! 0          | 0        | Prefix, always 0xAA
//! 1          | 1        | Version
//! 2          | 3        | Payload length (LE)
//! 4          | 4        | CRC8 over bytes 0-3
//! 5          | 5        | Product byte
//! 6          | 9        | Sequence number (LE)
//! 10         | 11       | Always zero
//! 12         | 17       | src, dst, dsrc, ddst, cmd set, cmd id
//! 18         | x        | Payload
//! x+1        | x+2      | CRC16 over bytes 0-x, only checked for version 3

use crate::crc::{crc16, crc8};
use crate::error::{Error, Result};

/// A decoded or to-be-encoded inner frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    src: u8,
    dst: u8,
    cmd_set: u8,
    cmd_id: u8,
    payload: Vec<u8>,
    dsrc: u8,
    ddst: u8,
    version: u8,
    seq: u32,
    product_id: i32,
}

impl Packet {
    pub const PREFIX: u8 = 0xAA;
    /// Smallest frame that can be decoded: header, routing and trailing CRC16.
    pub const MIN_LEN: usize = 20;
    const HEADER_LEN: usize = 18;
    const V19_TRAILER: [u8; 2] = [0xBB, 0xBB];

    /// Create a version 3 packet with default device routing (`dsrc = ddst = 1`).
    pub fn new(src: u8, dst: u8, cmd_set: u8, cmd_id: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            src,
            dst,
            cmd_set,
            cmd_id,
            payload: payload.into(),
            dsrc: 1,
            ddst: 1,
            version: 3,
            seq: 0,
            product_id: 0,
        }
    }

    pub fn with_device_route(mut self, dsrc: u8, ddst: u8) -> Self {
        self.dsrc = dsrc;
        self.ddst = ddst;
        self
    }

    pub fn with_version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    pub fn with_seq(mut self, seq: u32) -> Self {
        self.seq = seq;
        self
    }

    pub fn with_product_id(mut self, product_id: i32) -> Self {
        self.product_id = product_id;
        self
    }

    pub fn src(&self) -> u8 {
        self.src
    }

    pub fn dst(&self) -> u8 {
        self.dst
    }

    pub fn dsrc(&self) -> u8 {
        self.dsrc
    }

    pub fn ddst(&self) -> u8 {
        self.ddst
    }

    pub fn cmd_set(&self) -> u8 {
        self.cmd_set
    }

    pub fn cmd_id(&self) -> u8 {
        self.cmd_id
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The product discriminator written after the header CRC.
    pub fn product_byte(&self) -> u8 {
        if self.product_id >= 0 {
            0x0d
        } else {
            0x0c
        }
    }

    /// Decode a packet from exactly one frame worth of bytes.
    ///
    /// The product id cannot be recovered from the wire and is left at 0.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::MIN_LEN {
            return Err(Error::FrameTooShort { len: data.len(), min: Self::MIN_LEN });
        }

        if data[0] != Self::PREFIX {
            return Err(Error::BadPrefix(hex::encode(&data[..1])));
        }

        let version = data[1];
        let payload_len = u16::from_le_bytes([data[2], data[3]]) as usize;

        if version == 3 {
            let (body, trailer) = data.split_at(data.len() - 2);
            let actual = u16::from_le_bytes([trailer[0], trailer[1]]);
            let expected = crc16(body);
            if actual != expected {
                return Err(Error::PacketChecksum { expected, actual });
            }
        }

        let expected = crc8(&data[..4]);
        if data[4] != expected {
            return Err(Error::HeaderChecksum { expected, actual: data[4] });
        }

        let seq = u32::from_le_bytes([data[6], data[7], data[8], data[9]]);

        let payload_end = Self::HEADER_LEN + payload_len;
        let mut payload = data
            .get(Self::HEADER_LEN..payload_end)
            .ok_or(Error::FrameTooShort { len: data.len(), min: payload_end })?
            .to_vec();

        if version == 19 && payload.ends_with(&Self::V19_TRAILER) {
            payload.truncate(payload.len() - Self::V19_TRAILER.len());
        }

        Ok(Self {
            src: data[12],
            dst: data[13],
            dsrc: data[14],
            ddst: data[15],
            cmd_set: data[16],
            cmd_id: data[17],
            payload,
            version,
            seq,
            product_id: 0,
        })
    }

    /// Encode the packet, computing both checksums.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(Self::MIN_LEN + self.payload.len());
        data.push(Self::PREFIX);
        data.push(self.version);
        data.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        data.push(crc8(&data));
        data.push(self.product_byte());
        data.extend_from_slice(&self.seq.to_le_bytes());
        data.extend_from_slice(&[0x00, 0x00]);
        data.extend_from_slice(&[self.src, self.dst, self.dsrc, self.ddst, self.cmd_set, self.cmd_id]);
        data.extend_from_slice(&self.payload);
        let crc = crc16(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        data
    }
}

#[test]
fn test_decode_literal_frame() {
    let data = hex::decode("aa030000de0d040302010000213535350100faad").unwrap();
    let packet = Packet::from_bytes(&data).unwrap();
    assert_eq!(packet.version(), 3);
    assert_eq!(packet.seq(), 0x01020304);
    assert_eq!(packet.src(), 0x21);
    assert_eq!(packet.dst(), 0x35);
    assert_eq!(packet.dsrc(), 0x35);
    assert_eq!(packet.ddst(), 0x35);
    assert_eq!(packet.cmd_set(), 0x01);
    assert_eq!(packet.cmd_id(), 0x00);
    assert!(packet.payload().is_empty());
}

#[test]
fn test_encode_literal_frame() {
    let packet = Packet::new(0x21, 0x35, 0x01, 0x00, Vec::new())
        .with_device_route(0x35, 0x35)
        .with_seq(0x01020304);
    assert_eq!(hex::encode(packet.to_bytes()), "aa030000de0d040302010000213535350100faad");
}

#[test]
fn test_roundtrip_with_payload() {
    let packet = Packet::new(0x21, 0x35, 0x35, 0x86, b"D886DBEE71F5B1212525D569CB123AA5".to_vec()).with_seq(7);
    let decoded = Packet::from_bytes(&packet.to_bytes()).unwrap();
    assert_eq!(decoded, packet);
}

#[test]
fn test_product_byte() {
    let packet = Packet::new(0x21, 0x35, 0x35, 0x89, Vec::new());
    assert_eq!(packet.product_byte(), 0x0d);
    assert_eq!(packet.with_product_id(-1).product_byte(), 0x0c);
}

#[test]
fn test_decode_too_short() {
    let data = hex::decode("aa030000de0d0403020100002135353501").unwrap();
    assert!(matches!(Packet::from_bytes(&data), Err(Error::FrameTooShort { len: 17, min: 20 })));
}

#[test]
fn test_decode_bad_prefix() {
    let mut data = hex::decode("aa030000de0d040302010000213535350100faad").unwrap();
    data[0] = 0xab;
    assert!(matches!(Packet::from_bytes(&data), Err(Error::BadPrefix(_))));
}

#[test]
fn test_decode_bad_crc16() {
    let data = hex::decode("aa030000de0d040302010000213535350100faae").unwrap();
    assert!(matches!(Packet::from_bytes(&data), Err(Error::PacketChecksum { .. })));
}

#[test]
fn test_decode_bad_header_crc8() {
    let mut data = hex::decode("aa030000df0d040302010000213535350100").unwrap();
    let crc = crc16(&data);
    data.extend_from_slice(&crc.to_le_bytes());
    assert!(matches!(
        Packet::from_bytes(&data),
        Err(Error::HeaderChecksum { expected: 0xde, actual: 0xdf })
    ));
}

#[test]
fn test_decode_version_19_strips_trailer() {
    // Version 19 frames carry no whole-frame CRC16, the last two bytes are not checked.
    let mut data = vec![0xaa, 19, 0x04, 0x00];
    data.push(crc8(&data));
    data.extend_from_slice(&[0x0d, 0, 0, 0, 0, 0, 0, 0x02, 0x20, 0x01, 0x01, 0xfe, 0x11]);
    data.extend_from_slice(&[0x12, 0x34, 0xbb, 0xbb]);
    data.extend_from_slice(&[0x00, 0x00]);
    let packet = Packet::from_bytes(&data).unwrap();
    assert_eq!(packet.version(), 19);
    assert_eq!(packet.payload(), &[0x12, 0x34]);
    assert_eq!(packet.cmd_set(), 0xfe);
}
