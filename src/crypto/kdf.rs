//! Session key derivation and the authentication credential.

use std::path::Path;

use bytes::Bytes;

use super::md5;
use crate::error::{Error, Result};

/// Random values at least this long select the extended derivation, which is not supported.
pub const EXTENDED_SRAND_LEN: usize = 32;

/// Length of the random value the session key is derived from.
pub const SRAND_LEN: usize = 16;

/// Read-only key material the session key derivation looks constants up in.
///
/// The table ships with the vendor application and is supplied by the caller;
/// cloning is cheap.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyTable(Bytes);

impl KeyTable {
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self(data.into())
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self(std::fs::read(path)?.into()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The 8 bytes starting at `pos`.
    pub fn get8(&self, pos: usize) -> Result<[u8; 8]> {
        let bytes = self
            .0
            .get(pos..pos + 8)
            .ok_or(Error::KeyTableRange { pos, len: self.0.len() })?;
        let mut out = [0u8; 8];
        out.copy_from_slice(bytes);
        Ok(out)
    }
}

impl std::fmt::Debug for KeyTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyTable({} bytes)", self.0.len())
    }
}

/// Offset into the key table selected by the 2-byte seed.
pub fn key_table_offset(seed: [u8; 2]) -> usize {
    seed[0] as usize * 0x10 + seed[1].wrapping_sub(1) as usize * 0x100
}

/// Derive the 16-byte session key.
///
/// Two 8-byte constants from the key table followed by the two halves of `srand`
/// are hashed with MD5.
pub fn derive_session_key(table: &KeyTable, seed: [u8; 2], srand: &[u8]) -> Result<[u8; 16]> {
    if srand.len() >= EXTENDED_SRAND_LEN {
        return Err(Error::UnsupportedKeyDerivation { srand_len: srand.len() });
    }
    if srand.len() < SRAND_LEN {
        return Err(Error::FrameTooShort { len: srand.len(), min: SRAND_LEN });
    }

    let pos = key_table_offset(seed);
    let mut data = [0u8; 32];
    data[..8].copy_from_slice(&table.get8(pos)?);
    data[8..16].copy_from_slice(&table.get8(pos + 8)?);
    data[16..32].copy_from_slice(&srand[..SRAND_LEN]);

    Ok(md5(&data))
}

/// Authentication payload: uppercase hex MD5 of the user id followed by the serial number.
pub fn auth_credential(user_id: &str, serial: &str) -> Vec<u8> {
    let digest = md5(format!("{user_id}{serial}").as_bytes());
    hex::encode_upper(digest).into_bytes()
}
