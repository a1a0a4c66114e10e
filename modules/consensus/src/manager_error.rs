//! Errors surfaced by the consensus manager.

use tessera_common::{
    validation::{ConsensusError, ErrorClass},
    BlockHash, PeerId,
};

use crate::chain_index::ChainIndexError;
use crate::tree_error::HeaderTreeError;

#[derive(Debug, thiserror::Error)]
pub enum ConsensusManagerError {
    #[error(transparent)]
    Header(#[from] HeaderTreeError),

    /// A block broke a consensus rule; its header and descendants are invalid.
    #[error("block {hash} failed validation: {error}")]
    Rule {
        hash: BlockHash,
        peer: Option<PeerId>,
        error: ConsensusError,
    },

    #[error(transparent)]
    Index(#[from] ChainIndexError),

    #[error("storage failure: {0}")]
    Storage(anyhow::Error),

    /// Undoing a failed reorganisation failed; the coin view no longer
    /// matches the chain index.
    #[error("rollback failed, chain state inconsistent: {0}")]
    RollbackFailed(anyhow::Error),

    #[error("validation worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    #[error("consensus manager is shutting down")]
    ShuttingDown,

    #[error("consensus manager is not initialised")]
    NotInitialized,
}

impl ConsensusManagerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ConsensusManagerError::Header(e) => e.class(),
            ConsensusManagerError::Rule { error, .. } => error.class(),
            ConsensusManagerError::Storage(_)
            | ConsensusManagerError::RollbackFailed(_)
            | ConsensusManagerError::Worker(_) => ErrorClass::Storage,
            ConsensusManagerError::Index(_)
            | ConsensusManagerError::ShuttingDown
            | ConsensusManagerError::NotInitialized => ErrorClass::Structural,
        }
    }

    /// True once the manager can no longer make progress
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConsensusManagerError::Storage(_) | ConsensusManagerError::RollbackFailed(_)
        )
    }
}
