//! Proof-of-work admission gate.
//!
//! Issues challenges bound to a candidate session id and verifies submitted
//! solutions before a session claim is allowed to touch the store.
//!
//! # Verification order
//!
//! 1. Checksum: recomputed from `session_id.issued` and the server secret.
//!    A mismatch means the client altered the candidate or the timestamp.
//! 2. Freshness: the challenge must be solved within the freshness window.
//! 3. Hash: recomputed server-side from `solution ‖ nonce`. The client-supplied
//!    hash is untrusted; it must equal the recomputation.
//! 4. Difficulty: the recomputed hash must carry enough leading zeros.

use std::time::Duration;

use pow_core::{Nonce, checksum, meets_difficulty, solution_hash};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::config::PowConfig;
use crate::session::random_string;

/// Why a submitted solution was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PowRejection {
    /// The checksum does not match the nonce (tampered challenge).
    #[error("checksum does not match challenge")]
    ChecksumMismatch,

    /// The challenge is older than the freshness window.
    #[error("challenge expired")]
    Expired,

    /// The supplied hash is not `sha256(solution ‖ nonce)`.
    #[error("hash does not match solution")]
    HashMismatch,

    /// The hash lacks the required leading zeros.
    #[error("hash does not meet difficulty")]
    InsufficientDifficulty,
}

impl PowRejection {
    /// Machine-readable reason.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::ChecksumMismatch => "checksum_mismatch",
            Self::Expired => "expired",
            Self::HashMismatch => "hash_mismatch",
            Self::InsufficientDifficulty => "insufficient_difficulty",
        }
    }
}

/// A challenge handed to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    /// Candidate session id the solution will claim.
    pub session_id: String,
    /// Unix seconds at issuance.
    pub issued: i64,
    /// Keyed checksum over the nonce.
    pub checksum: String,
    /// Required leading zero hex digits.
    pub difficulty: u32,
}

impl Challenge {
    /// The nonce string a client must hash against.
    #[must_use]
    pub fn nonce(&self) -> String {
        Nonce::new(self.session_id.clone(), self.issued).to_string()
    }
}

/// A client's answer to a [`Challenge`].
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    /// Candidate session id from the challenge.
    pub session_id: String,
    /// Issuance time from the challenge.
    pub issued: i64,
    /// Checksum from the challenge.
    pub checksum: String,
    /// Winning solution string.
    pub solution: String,
    /// Client-computed hash (untrusted).
    pub hash: String,
}

/// Issues and verifies proof-of-work challenges.
pub struct PowGate {
    secret: String,
    difficulty: u32,
    freshness: Duration,
}

impl PowGate {
    /// Build a gate from configuration.
    ///
    /// A missing secret degrades to a random per-process secret, so challenges
    /// issued before a restart stop verifying after it.
    #[must_use]
    pub fn new(config: &PowConfig) -> Self {
        let secret = match config.secret.as_deref() {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => {
                warn!("PoW secret not configured, using a random per-process secret");
                random_string(64)
            }
        };
        if config.difficulty == 0 {
            warn!("PoW difficulty is 0, challenges are free to solve");
        }
        Self::with_secret(secret, config.difficulty, Duration::from_secs(config.freshness_secs))
    }

    /// Build a gate with explicit parameters.
    #[must_use]
    pub fn with_secret(secret: impl Into<String>, difficulty: u32, freshness: Duration) -> Self {
        Self {
            secret: secret.into(),
            difficulty,
            freshness,
        }
    }

    /// Configured difficulty.
    #[must_use]
    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }

    /// Issue a challenge for `candidate` at unix time `now`.
    #[must_use]
    pub fn issue(&self, candidate: &str, now: i64) -> Challenge {
        let nonce = Nonce::new(candidate, now).to_string();
        Challenge {
            session_id: candidate.to_string(),
            issued: now,
            checksum: checksum(&nonce, &self.secret),
            difficulty: self.difficulty,
        }
    }

    /// Verify a submission at unix time `now`.
    ///
    /// # Errors
    ///
    /// Returns the first failing [`PowRejection`]; there is no partial credit.
    pub fn verify(&self, submission: &Submission, now: i64) -> Result<(), PowRejection> {
        let nonce = Nonce::new(submission.session_id.clone(), submission.issued).to_string();

        let expected = checksum(&nonce, &self.secret);
        if !bool::from(expected.as_bytes().ct_eq(submission.checksum.as_bytes())) {
            debug!(session = %submission.session_id, "PoW checksum mismatch");
            return Err(PowRejection::ChecksumMismatch);
        }

        let age = now.saturating_sub(submission.issued);
        let max_age = i64::try_from(self.freshness.as_secs()).unwrap_or(i64::MAX);
        if age > max_age {
            debug!(session = %submission.session_id, age, "PoW challenge expired");
            return Err(PowRejection::Expired);
        }

        let hash = solution_hash(&submission.solution, &nonce);
        if hash != submission.hash.to_ascii_lowercase() {
            return Err(PowRejection::HashMismatch);
        }

        if !meets_difficulty(&hash, self.difficulty) {
            return Err(PowRejection::InsufficientDifficulty);
        }

        Ok(())
    }
}
