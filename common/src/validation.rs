//! Consensus rule failures and the error taxonomy used across the node

use std::fmt;

use thiserror::Error;

/// How a failure should be handled by whoever observes it
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorClass {
    /// Malformed data from a peer: drop it and penalise the sender
    Structural,
    /// A named rule was broken: invalidate the subtree and report the peer
    ConsensusRule,
    /// Local I/O failure: fatal, flush and shut down
    Storage,
    /// Timeout or disconnect: retried by reassignment
    TransientNetwork,
}

/// A broken consensus rule, identified by a stable code
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Error)]
#[error("{code}: {message}")]
pub struct ConsensusError {
    pub code: String,
    pub message: String,
}

macro_rules! consensus_errors {
    ($($(#[$meta:meta])* $name:ident => $code:literal),* $(,)?) => {
        impl ConsensusError {
            $(
                $(#[$meta])*
                pub fn $name(message: impl fmt::Display) -> Self {
                    Self::new($code, message)
                }
            )*
        }

        /// Every code this crate knows how to raise
        pub const KNOWN_CODES: &[&str] = &[$($code),*];
    };
}

consensus_errors! {
    checkpoint_mismatch => "checkpoint-mismatch",
    time_too_new => "time-too-new",
    time_too_old => "time-too-old",
    bad_diff_bits => "bad-diffbits",
    high_hash => "high-hash",
    bad_prev_block => "bad-prevblk",
    bad_merkle_root => "bad-txnmrklroot",
    /// Body repeats a merkle subtree, so another body shares its root
    merkle_mutated => "bad-txns-mutated",
    bad_block_length => "bad-blk-length",
    coinbase_missing => "bad-cb-missing",
    coinbase_multiple => "bad-cb-multiple",
    coinbase_amount => "bad-cb-amount",
    duplicate_transaction => "bad-txns-duplicate",
    outputs_empty => "bad-txns-vout-empty",
    inputs_missing_or_spent => "bad-txns-inputs-missingorspent",
    inputs_below_outputs => "bad-txns-in-belowout",
    /// Used by networks that mandate segregated witness spends
    missing_witness => "tx-input-missing-witness",
}

impl ConsensusError {
    pub fn new(code: impl Into<String>, message: impl fmt::Display) -> Self {
        Self {
            code: code.into(),
            message: message.to_string(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        ErrorClass::ConsensusRule
    }

    /// The body does not provably belong to its header, so the failure
    /// says something about the sender and nothing about the block
    pub fn is_body_mutation(&self) -> bool {
        self.code == "bad-txnmrklroot" || self.code == "bad-txns-mutated"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code() {
        let err = ConsensusError::high_hash("block 12 above target");
        assert_eq!(err.code, "high-hash");
        assert_eq!(err.to_string(), "high-hash: block 12 above target");
    }

    #[test]
    fn only_merkle_failures_count_as_mutation() {
        assert!(ConsensusError::bad_merkle_root("x").is_body_mutation());
        assert!(ConsensusError::merkle_mutated("x").is_body_mutation());
        assert!(!ConsensusError::duplicate_transaction("x").is_body_mutation());
        assert!(!ConsensusError::bad_block_length("x").is_body_mutation());
    }

    #[test]
    fn codes_are_unique() {
        let mut codes = KNOWN_CODES.to_vec();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), KNOWN_CODES.len());
        assert!(KNOWN_CODES.contains(&"tx-input-missing-witness"));
    }
}
