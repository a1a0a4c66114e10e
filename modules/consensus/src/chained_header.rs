//! Header representation within the chained header tree.

use std::sync::Arc;

use tessera_common::{
    validation::ConsensusError, Block, BlockHash, BlockHeader, ChainWork, HashHeight, PeerId,
};

/// Where a header is in the download-validate lifecycle.
///
/// States only move forward. `FullyValidated` and `Invalid` are terminal;
/// `Invalid` is also inherited by every descendant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ValidationState {
    /// Stateless header rules passed.
    HeaderValidated,
    /// Body received and integrity-checked.
    DataDownloaded,
    /// Context-free body rules passed.
    PartiallyValidated,
    /// Connected against the coin view at least once.
    FullyValidated,
    /// Failed a rule, or descends from a header that did.
    Invalid,
}

impl ValidationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ValidationState::FullyValidated | ValidationState::Invalid)
    }

    /// True for a legal forward move
    pub fn can_advance_to(&self, next: ValidationState) -> bool {
        match (self, next) {
            (ValidationState::Invalid, _) => false,
            (_, ValidationState::Invalid) => true,
            (ValidationState::FullyValidated, _) => false,
            (current, next) => next > *current,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDataAvailability {
    Missing,
    Requested,
    Available,
}

/// A node in the header tree. The parent is referenced by hash into the
/// same arena.
#[derive(Debug, Clone)]
pub struct ChainedHeader {
    pub hash: BlockHash,
    pub height: u64,
    pub header: BlockHeader,
    /// `None` for the tree root
    pub parent: Option<BlockHash>,
    pub children: Vec<BlockHash>,
    /// Cumulative work from genesis up to and including this header
    pub chain_work: ChainWork,
    pub state: ValidationState,
    pub data: BlockDataAvailability,
    /// Body held between download and connection
    pub block: Option<Arc<Block>>,
    /// Insertion order, for earliest-seen tie-breaks
    pub seen: u64,
    /// Peer that supplied the body
    pub source: Option<PeerId>,
    /// Why this header is invalid, once it is
    pub failure: Option<ConsensusError>,
}

impl ChainedHeader {
    pub fn new(
        header: BlockHeader,
        height: u64,
        parent: Option<BlockHash>,
        chain_work: ChainWork,
        seen: u64,
    ) -> Self {
        Self {
            hash: header.hash(),
            height,
            header,
            parent,
            children: Vec::new(),
            chain_work,
            state: ValidationState::HeaderValidated,
            data: BlockDataAvailability::Missing,
            block: None,
            seen,
            source: None,
            failure: None,
        }
    }

    pub fn hash_height(&self) -> HashHeight {
        HashHeight::new(self.hash, self.height)
    }

    pub fn is_invalid(&self) -> bool {
        self.state == ValidationState::Invalid
    }

    /// Body rules have run far enough for the block to be connected
    pub fn is_connectable(&self) -> bool {
        matches!(
            self.state,
            ValidationState::PartiallyValidated | ValidationState::FullyValidated
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_only_move_forward() {
        use ValidationState::*;
        assert!(HeaderValidated.can_advance_to(DataDownloaded));
        assert!(DataDownloaded.can_advance_to(FullyValidated));
        assert!(!PartiallyValidated.can_advance_to(DataDownloaded));
        assert!(PartiallyValidated.can_advance_to(Invalid));
        assert!(!FullyValidated.can_advance_to(Invalid));
        assert!(!Invalid.can_advance_to(HeaderValidated));
        assert!(!Invalid.can_advance_to(Invalid));
        assert!(FullyValidated.is_terminal() && Invalid.is_terminal());
    }
}
