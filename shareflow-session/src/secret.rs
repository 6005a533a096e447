//! bcrypt secret hashes for private shares.
//!
//! Encoded form is the standard modular crypt string,
//! `$2b$<cost>$<22 char salt><31 char digest>`. The plaintext secret is
//! never stored, and the hash itself never leaves the process except
//! through the store codec.

use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// Work factor for newly created shares.
pub const DEFAULT_COST: u32 = 10;
/// Smallest work factor bcrypt accepts.
pub const MIN_COST: u32 = 4;

const ENCODED_LEN: usize = 60;

/// An encoded secret hash.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretHash(String);

impl std::fmt::Debug for SecretHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretHash(<redacted>)")
    }
}

impl SecretHash {
    /// Hash `secret` with a fresh random salt at [`DEFAULT_COST`].
    pub fn derive(secret: &str) -> Result<Self, SessionError> {
        Self::derive_with_cost(secret, DEFAULT_COST)
    }

    pub fn derive_with_cost(secret: &str, cost: u32) -> Result<Self, SessionError> {
        let encoded = bcrypt::hash(secret, cost)
            .map_err(|e| SessionError::BadRequest(format!("secret could not be hashed: {e}")))?;
        Ok(Self(encoded))
    }

    /// Wrap an already-encoded hash. Returns `None` if it is malformed.
    pub fn from_encoded(encoded: impl Into<String>) -> Option<Self> {
        let hash = Self(encoded.into());
        hash.is_well_formed().then_some(hash)
    }

    /// Whether the encoded form has the bcrypt shape.
    pub fn is_well_formed(&self) -> bool {
        let s = self.0.as_str();
        if s.len() != ENCODED_LEN || !s.is_ascii() {
            return false;
        }
        let version_ok = matches!(&s[..4], "$2a$" | "$2b$" | "$2x$" | "$2y$");
        let cost_ok = s[4..6]
            .parse::<u32>()
            .is_ok_and(|cost| (MIN_COST..=31).contains(&cost));
        let body_ok = s[7..]
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'/');
        version_ok && cost_ok && &s[6..7] == "$" && body_ok
    }

    /// Check `candidate` against this hash.
    ///
    /// A malformed hash never verifies.
    pub fn verify(&self, candidate: &str) -> bool {
        self.is_well_formed() && bcrypt::verify(candidate, &self.0).unwrap_or(false)
    }

    /// Work factor recorded in the hash.
    pub fn cost(&self) -> Option<u32> {
        self.is_well_formed().then(|| self.0[4..6].parse().ok()).flatten()
    }
}
