//! Error types for chained header tree operations.

use tessera_common::{
    validation::{ConsensusError, ErrorClass},
    BlockHash,
};

use crate::chained_header::ValidationState;

/// Errors returned by [`ChainedHeaderTree`](crate::chained_header_tree::ChainedHeaderTree) operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HeaderTreeError {
    /// The header's parent is not in the tree; ask the peer for the gap.
    #[error("parent {parent} of header {hash} is unknown")]
    MissingParent { hash: BlockHash, parent: BlockHash },

    /// The header broke a rule or descends from an invalid header.
    #[error("header {hash} is invalid: {error}")]
    HeaderInvalid { hash: BlockHash, error: ConsensusError },

    /// A batch whose headers do not chain to each other.
    #[error("headers-not-continuous: {hash} does not follow {previous}")]
    NotContinuous { hash: BlockHash, previous: BlockHash },

    /// The fork point lies deeper than the reorganisation limit.
    #[error("fork too deep: header {hash} forks {depth} blocks below the tip, max {max}")]
    ForkTooDeep { hash: BlockHash, depth: u64, max: u64 },

    /// A hash referenced by an operation is not in the tree.
    #[error("block not in tree: {hash}")]
    BlockNotInTree { hash: BlockHash },

    /// The requested state change would move backwards.
    #[error("header {hash} cannot move from {from:?} to {to:?}")]
    InvalidState {
        hash: BlockHash,
        from: ValidationState,
        to: ValidationState,
    },
}

impl HeaderTreeError {
    pub fn class(&self) -> ErrorClass {
        match self {
            HeaderTreeError::HeaderInvalid { .. } => ErrorClass::ConsensusRule,
            HeaderTreeError::NotContinuous { .. } => ErrorClass::Structural,
            HeaderTreeError::MissingParent { .. } | HeaderTreeError::ForkTooDeep { .. } => {
                ErrorClass::TransientNetwork
            }
            HeaderTreeError::BlockNotInTree { .. } | HeaderTreeError::InvalidState { .. } => {
                ErrorClass::Structural
            }
        }
    }

    /// Whether the peer that sent the offending data should be banned
    pub fn is_misbehaviour(&self) -> bool {
        matches!(
            self,
            HeaderTreeError::HeaderInvalid { .. } | HeaderTreeError::NotContinuous { .. }
        )
    }
}
