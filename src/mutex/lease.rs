use std::{fmt, sync::Arc, time::Duration};

use derive_more::From;
use rand::{rngs::OsRng, RngCore};
use tokio::time::Instant;

/// Number of random bytes in a lock token
const TOKEN_BYTES: usize = 16;

/// Proof of ownership stored as the lock value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, From)]
pub struct Token(Arc<str>);

impl Token {
    /// A fresh token from the operating system's CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);

        Self(Arc::from(hex::encode(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Token {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A held lock. Ownership lasts until `valid_until`, unless extended.
///
/// The holder must stop touching the protected resource once [`is_valid`](Self::is_valid) returns false, whether or
/// not the store has evicted the key yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    name: Arc<str>,
    token: Token,
    acquired_at: Instant,
    valid_until: Instant,
}

impl Lease {
    pub(crate) fn new(name: Arc<str>, token: Token, acquired_at: Instant, valid_until: Instant) -> Self {
        Self {
            name,
            token,
            acquired_at,
            valid_until,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> &Token {
        &self.token
    }

    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    pub fn valid_until(&self) -> Instant {
        self.valid_until
    }

    pub fn is_valid(&self) -> bool {
        Instant::now() < self.valid_until
    }

    pub fn remaining(&self) -> Duration {
        self.valid_until.saturating_duration_since(Instant::now())
    }
}
