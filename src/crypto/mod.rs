//! Cryptographic building blocks for the session handshake.
//!
//! - [`ecdh`]: ephemeral SECP160r1 key pair and the shared secret
//! - [`symmetric`]: AES-128-CBC with PKCS#7 padding
//! - [`kdf`]: session key derivation and the authentication credential

pub mod ecdh;
pub mod kdf;
pub mod symmetric;

pub use ecdh::{ecdh_public_key_len, EcdhKeyPair};
pub use kdf::{auth_credential, derive_session_key, KeyTable};
pub use symmetric::AesKey;

use md5::{Digest, Md5};

/// MD5 digest of `data`.
pub fn md5(data: &[u8]) -> [u8; 16] {
    Md5::digest(data).into()
}
