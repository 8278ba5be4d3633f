//! AES-128-CBC as used by both the pre-session and the session key.

use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use super::md5;
use crate::error::{Error, Result};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// Key size for AES-128.
pub const KEY_SIZE: usize = 16;

/// An AES-128 key with its CBC initialization vector.
///
/// Every frame is encrypted from the IV, CBC state never carries over.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AesKey {
    key: [u8; KEY_SIZE],
    iv: [u8; KEY_SIZE],
}

impl AesKey {
    pub fn new(key: [u8; KEY_SIZE], iv: [u8; KEY_SIZE]) -> Self {
        Self { key, iv }
    }

    /// Pre-session key from an ECDH shared secret: the IV is the MD5 of the
    /// whole secret, the key is its first 16 bytes.
    pub fn from_shared_secret(secret: &[u8]) -> Result<Self> {
        let key = secret
            .get(..KEY_SIZE)
            .ok_or(Error::FrameTooShort { len: secret.len(), min: KEY_SIZE })?;
        let mut shared = [0u8; KEY_SIZE];
        shared.copy_from_slice(key);
        Ok(Self { key: shared, iv: md5(secret) })
    }

    /// Same IV, different key.
    pub fn with_key(&self, key: [u8; KEY_SIZE]) -> Self {
        Self { key, iv: self.iv }
    }

    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    pub fn iv(&self) -> &[u8; KEY_SIZE] {
        &self.iv
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        Aes128CbcEnc::new(&self.key.into(), &self.iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        Aes128CbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| Error::Decrypt)
    }
}

impl std::fmt::Debug for AesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesKey").finish_non_exhaustive()
    }
}
