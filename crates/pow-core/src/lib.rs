//! Proof-of-work primitives shared by the session gate and its clients.
//!
//! A challenge is the nonce `"{candidate}.{issued_at}"` plus a checksum keyed
//! with a server secret. A client proves work by finding a `solution` such
//! that `sha256(solution ‖ nonce)` starts with `difficulty` zero hex digits.
//!
//! The solver is a unary counter (`"0"`, `"00"`, `"000"`, ...). It is
//! deliberately naive: every interoperable client must reproduce it bit for bit.
//!
//! Nothing in this crate performs I/O or reads the clock.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Errors produced while parsing a nonce string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NonceError {
    /// The nonce has no `.` separating candidate and timestamp.
    #[error("nonce is missing the '.' separator")]
    MissingSeparator,

    /// The candidate part is empty.
    #[error("nonce candidate is empty")]
    EmptyCandidate,

    /// The timestamp part is not a non-negative integer.
    #[error("nonce timestamp is not a unix time: {0}")]
    BadTimestamp(String),
}

/// A challenge nonce: the candidate session id and its issuance time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Nonce {
    /// Candidate session identifier the challenge is bound to.
    pub candidate: String,
    /// Unix seconds at which the challenge was issued.
    pub issued_at: i64,
}

impl Nonce {
    /// Build a nonce from its parts.
    #[must_use]
    pub fn new(candidate: impl Into<String>, issued_at: i64) -> Self {
        Self {
            candidate: candidate.into(),
            issued_at,
        }
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.candidate, self.issued_at)
    }
}

impl FromStr for Nonce {
    type Err = NonceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (candidate, issued) = s.rsplit_once('.').ok_or(NonceError::MissingSeparator)?;
        if candidate.is_empty() {
            return Err(NonceError::EmptyCandidate);
        }
        let issued_at = issued
            .parse::<i64>()
            .ok()
            .filter(|t| *t >= 0)
            .ok_or_else(|| NonceError::BadTimestamp(issued.to_string()))?;
        Ok(Self::new(candidate, issued_at))
    }
}

/// A solved challenge: the winning candidate string and its hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Solution {
    /// The string prepended to the nonce.
    pub solution: String,
    /// Lowercase hex `sha256(solution ‖ nonce)`.
    pub hash: String,
}

fn sha256_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hex::encode(hasher.finalize().as_slice())
}

/// Keyed checksum over a nonce: `hex(sha256(nonce ‖ secret))`.
#[must_use]
pub fn checksum(nonce: &str, secret: &str) -> String {
    sha256_hex(&[nonce.as_bytes(), secret.as_bytes()])
}

/// Hash of a proposed solution: `hex(sha256(solution ‖ nonce))`.
#[must_use]
pub fn solution_hash(solution: &str, nonce: &str) -> String {
    sha256_hex(&[solution.as_bytes(), nonce.as_bytes()])
}

/// Hex digits in a SHA-256 hash; no difficulty above this can be met.
pub const MAX_DIFFICULTY: u32 = 64;

/// Whether a hex hash starts with `difficulty` `'0'` characters.
#[must_use]
pub fn meets_difficulty(hash: &str, difficulty: u32) -> bool {
    let wanted = difficulty as usize;
    hash.len() >= wanted && hash.bytes().take(wanted).all(|b| b == b'0')
}

/// Find the first unary-counter solution for `nonce` at `difficulty`.
///
/// Expected work grows as `16^difficulty`; callers on the server side should
/// only use this in tests and tooling.
#[must_use]
pub fn solve(nonce: &str, difficulty: u32) -> Solution {
    let mut solution = String::from("0");
    loop {
        let hash = solution_hash(&solution, nonce);
        if meets_difficulty(&hash, difficulty) {
            return Solution { solution, hash };
        }
        solution.push('0');
    }
}
