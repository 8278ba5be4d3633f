use std::time::Duration;

use crate::crypto::KeyTable;

/// Connection attempts handed to the transport before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;

/// How long to wait for the device to answer one handshake request.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for a [`Connection`](super::Connection).
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Account identifier the device was bound to.
    pub user_id: String,
    /// Key material for the session key derivation.
    pub key_table: KeyTable,
    pub max_attempts: u32,
    pub response_timeout: Duration,
}

impl ConnectionConfig {
    pub fn new(user_id: impl Into<String>, key_table: KeyTable) -> Self {
        Self {
            user_id: user_id.into(),
            key_table,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_response_timeout(mut self, response_timeout: Duration) -> Self {
        self.response_timeout = response_timeout;
        self
    }
}
