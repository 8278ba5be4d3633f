//! Checksums used by both frame layers.
//!
//! The inner frame header carries a CRC-8 (polynomial 0x07, no reflection, what the
//! device firmware calls "CCITT"), and both frame layers end in a CRC-16/ARC.

use ::crc::{Crc, CRC_8_SMBUS};
use crc16::{State, ARC};

const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);

/// CRC-8 over `data`.
pub fn crc8(data: &[u8]) -> u8 {
    CRC8.checksum(data)
}

/// CRC-16/ARC over `data`.
pub fn crc16(data: &[u8]) -> u16 {
    State::<ARC>::calculate(data)
}

#[test]
fn test_crc8_check_value() {
    assert_eq!(crc8(b"123456789"), 0xf4);
}

#[test]
fn test_crc8_header() {
    let header = hex::decode("aa030000").unwrap();
    assert_eq!(crc8(&header), 0xde);
}

#[test]
fn test_crc16_check_value() {
    assert_eq!(crc16(b"123456789"), 0xbb3d);
}

#[test]
fn test_crc16_empty() {
    assert_eq!(crc16(&[]), 0);
}

#[test]
fn test_checksums_are_stable() {
    let payload = hex::decode("5a5a0001040001").unwrap();
    assert_eq!(crc16(&payload), crc16(&payload));
    assert_eq!(crc8(&payload), crc8(&payload));
}
