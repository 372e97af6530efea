//! Error types for the quorum layer.
//!
//! `RejectKind` is the outcome of validating a network message. It is returned, never thrown, and
//! carries the DoS weight the dispatcher applies to the sending peer.

use crown_crypto::CryptoError;
use crown_shared_types::{Hash, OutPoint};
use thiserror::Error;

/// Infrastructure failures: missing chain data, reprocessing, keys, configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuorumError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("chain reprocessing failed: {0}")]
    Reprocess(String),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Why a message was not accepted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectKind {
    /// Wrong size, format or field values.
    #[error("malformed message: {reason}")]
    Malformed { reason: String, dos: u32 },
    /// Older than, or identical to, what is already known.
    #[error("stale message: {0}")]
    Stale(String),
    /// The signer's outpoint is not in the registry; the entry has been asked for.
    #[error("unknown signer {0}")]
    UnknownSigner(OutPoint),
    #[error("invalid signature: {reason}")]
    SignatureInvalid { reason: String, dos: u32 },
    /// Not enough agreeing votes yet.
    #[error("quorum not reached: {votes} of {required}")]
    QuorumNotReached { votes: u32, required: u32 },
    /// Two quorum-backed locks spend the same input.
    #[error("conflicting locks {} and {}", hex::encode(.0), hex::encode(.1))]
    Conflict(Hash, Hash),
    /// Not processed right now: feature disabled, not synced, rate-limited or out of range.
    #[error("ignored: {0}")]
    Ignored(String),
}

impl RejectKind {
    pub fn malformed(reason: impl Into<String>, dos: u32) -> Self {
        RejectKind::Malformed { reason: reason.into(), dos }
    }

    pub fn bad_signature(reason: impl Into<String>, dos: u32) -> Self {
        RejectKind::SignatureInvalid { reason: reason.into(), dos }
    }

    pub fn stale(reason: impl Into<String>) -> Self {
        RejectKind::Stale(reason.into())
    }

    pub fn ignored(reason: impl Into<String>) -> Self {
        RejectKind::Ignored(reason.into())
    }

    /// Misbehaviour score to apply to the peer that sent the message.
    pub fn dos(&self) -> u32 {
        match self {
            RejectKind::Malformed { dos, .. } | RejectKind::SignatureInvalid { dos, .. } => *dos,
            _ => 0,
        }
    }
}

/// What happened to an accepted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accepted {
    /// Stored for the first time.
    Added,
    /// Replaced or refreshed existing state.
    Updated,
    /// Stored, and it completed a quorum.
    QuorumReached,
    /// Handled with nothing to store (requests, queries).
    Served,
}

pub type QuorumResult<T = Accepted> = Result<T, RejectKind>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_malformed_and_signature_failures_carry_dos() {
        assert_eq!(RejectKind::malformed("bad key", 100).dos(), 100);
        assert_eq!(RejectKind::bad_signature("ping", 33).dos(), 33);
        assert_eq!(RejectKind::stale("older").dos(), 0);
        assert_eq!(RejectKind::UnknownSigner(OutPoint::default()).dos(), 0);
        assert_eq!(RejectKind::Conflict([0u8; 32], [1u8; 32]).dos(), 0);
        assert_eq!(RejectKind::QuorumNotReached { votes: 5, required: 6 }.dos(), 0);
    }

    #[test]
    fn test_conflict_display_uses_hex() {
        let text = RejectKind::Conflict([0xab; 32], [0xcd; 32]).to_string();
        assert!(text.contains(&"ab".repeat(32)));
        assert!(text.contains(&"cd".repeat(32)));
    }
}
