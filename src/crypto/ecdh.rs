//! Ephemeral ECDH over SECP160r1.
//!
//! Public keys travel as raw `x || y` (20 bytes each), without the SEC1 `0x04` tag.

use openssl::bn::BigNumContext;
use openssl::derive::Deriver;
use openssl::ec::{EcGroup, EcKey, EcPoint, PointConversionForm};
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};

use crate::error::Result;

const CURVE: Nid = Nid::SECP160R1;
const SEC1_UNCOMPRESSED: u8 = 0x04;

/// Length of the device public key announced by the curve type byte of the
/// key exchange response.
pub fn ecdh_public_key_len(curve_type: u8) -> usize {
    match curve_type {
        1 => 52,
        2 => 56,
        3 | 4 => 64,
        _ => 40,
    }
}

/// The controller's ephemeral key pair, created per handshake.
pub struct EcdhKeyPair {
    key: EcKey<Private>,
}

impl EcdhKeyPair {
    pub fn generate() -> Result<Self> {
        let group = EcGroup::from_curve_name(CURVE)?;
        let key = EcKey::generate(&group)?;
        Ok(Self { key })
    }

    /// Raw public key, `x || y`.
    pub fn public_key(&self) -> Result<Vec<u8>> {
        let mut ctx = BigNumContext::new()?;
        let bytes = self.key.public_key().to_bytes(self.key.group(), PointConversionForm::UNCOMPRESSED, &mut ctx)?;
        Ok(bytes[1..].to_vec())
    }

    /// Shared secret with the peer's raw public key: the x coordinate,
    /// padded to the field size.
    pub fn shared_secret(&self, peer_public_key: &[u8]) -> Result<Vec<u8>> {
        let group = EcGroup::from_curve_name(CURVE)?;
        let mut ctx = BigNumContext::new()?;

        let mut sec1 = Vec::with_capacity(peer_public_key.len() + 1);
        sec1.push(SEC1_UNCOMPRESSED);
        sec1.extend_from_slice(peer_public_key);
        let point = EcPoint::from_bytes(&group, &sec1, &mut ctx)?;
        let peer = PKey::from_ec_key(EcKey::from_public_key(&group, &point)?)?;

        let ours = PKey::from_ec_key(self.key.clone())?;
        let mut deriver = Deriver::new(&ours)?;
        deriver.set_peer(&peer)?;
        Ok(deriver.derive_to_vec()?)
    }
}

impl std::fmt::Debug for EcdhKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EcdhKeyPair").finish_non_exhaustive()
    }
}
