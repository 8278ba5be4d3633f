use thiserror::Error;

/// Result type alias for efble operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong between an advertisement and a listening session.
#[derive(Error, Debug)]
pub enum Error {
    // Framing
    #[error("frame too short: {len} bytes, need at least {min}")]
    FrameTooShort { len: usize, min: usize },

    #[error("unexpected frame prefix: {0}")]
    BadPrefix(String),

    #[error("header CRC8 mismatch: expected {expected:#04x}, got {actual:#04x}")]
    HeaderChecksum { expected: u8, actual: u8 },

    #[error("packet CRC16 mismatch: expected {expected:#06x}, got {actual:#06x}")]
    PacketChecksum { expected: u16, actual: u16 },

    #[error("encrypted packet CRC16 mismatch: expected {expected:#06x}, got {actual:#06x}")]
    EncPacketChecksum { expected: u16, actual: u16 },

    // Handshake
    #[error("unexpected response tag: expected {expected:#04x}, got {actual:#04x}")]
    UnexpectedResponseTag { expected: u8, actual: u8 },

    #[error("session key derivation for {srand_len}-byte random values is not supported")]
    UnsupportedKeyDerivation { srand_len: usize },

    #[error("authentication rejected by device: {}", hex::encode(.0))]
    AuthenticationRejected(Vec<u8>),

    #[error("empty response to {0}")]
    EmptyResponse(&'static str),

    #[error("key table lookup at {pos} is out of range ({len} bytes)")]
    KeyTableRange { pos: usize, len: usize },

    #[error("payload decryption failed")]
    Decrypt,

    #[error("crypto error: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),

    // Connection
    #[error("timed out waiting for a response")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("device is not connected")]
    NotConnected,

    #[error("connection task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("transport error: {0}")]
    Transport(#[from] anyhow::Error),

    #[cfg(feature = "bluest")]
    #[error("bluetooth error: {0}")]
    Ble(#[from] bluest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True when the link failed rather than the device refusing the session.
    pub fn is_link_failure(&self) -> bool {
        match self {
            Error::Timeout | Error::ConnectionClosed | Error::Transport(_) => true,
            #[cfg(feature = "bluest")]
            Error::Ble(_) => true,
            _ => false,
        }
    }
}
