//! Tree of every known header chain.
//!
//! Headers live in an arena keyed by hash; each records its parent hash and
//! its children, so forks share their ancestors. The tree tracks two tips:
//! the consensus tip (last connected block) and the best known tip (the
//! valid header with the most cumulative work). Everything below the root
//! has been pruned and lives only in the chain index.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use tessera_common::{
    validation::ConsensusError, Block, BlockHash, BlockHeader, ChainWork, HashHeight, PeerId,
};
use tracing::debug;

use crate::chained_header::{BlockDataAvailability, ChainedHeader, ValidationState};
use crate::rules::Stage;
use crate::tree_error::HeaderTreeError;
use crate::validation_pipeline::{RuleSet, ValidationContext};

/// How to order two valid headers carrying equal work
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TieBreak {
    /// The header inserted first wins
    EarliestSeen,
    /// The numerically lowest hash wins
    LowestHash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeSettings {
    pub max_reorg_length: u64,
    pub tie_break: TieBreak,
}

/// Result of merging a batch of announced headers
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConnectOutcome {
    /// Headers added to the tree, in batch order
    pub inserted: Vec<HashHeight>,
    /// Last header of the batch now known to the tree
    pub last: Option<HashHeight>,
    /// Whether the best known tip moved
    pub tip_changed: bool,
}

pub struct ChainedHeaderTree {
    headers: HashMap<BlockHash, ChainedHeader>,
    root: BlockHash,
    best_tip: BlockHash,
    consensus_tip: BlockHash,
    next_seen: u64,
    /// Last header each peer announced
    peer_tips: HashMap<PeerId, BlockHash>,
    settings: TreeSettings,
    rules: Arc<RuleSet>,
}

impl ChainedHeaderTree {
    /// Create a tree rooted at an already connected header
    pub fn new(
        root_header: BlockHeader,
        root_height: u64,
        root_work: ChainWork,
        settings: TreeSettings,
        rules: Arc<RuleSet>,
    ) -> Self {
        let mut root = ChainedHeader::new(root_header, root_height, None, root_work, 0);
        root.state = ValidationState::FullyValidated;
        root.data = BlockDataAvailability::Available;
        let hash = root.hash;
        Self {
            headers: HashMap::from([(hash, root)]),
            root: hash,
            best_tip: hash,
            consensus_tip: hash,
            next_seen: 1,
            peer_tips: HashMap::new(),
            settings,
            rules,
        }
    }

    // ── Readers ───────────────────────────────────────────────────

    pub fn get(&self, hash: &BlockHash) -> Option<&ChainedHeader> {
        self.headers.get(hash)
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.headers.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn settings(&self) -> TreeSettings {
        self.settings
    }

    pub fn root(&self) -> HashHeight {
        self.hash_height(&self.root)
    }

    pub fn best_tip(&self) -> HashHeight {
        self.hash_height(&self.best_tip)
    }

    pub fn consensus_tip(&self) -> HashHeight {
        self.hash_height(&self.consensus_tip)
    }

    pub fn peer_tip(&self, peer: PeerId) -> Option<HashHeight> {
        self.peer_tips.get(&peer).map(|hash| self.hash_height(hash))
    }

    fn hash_height(&self, hash: &BlockHash) -> HashHeight {
        self.headers
            .get(hash)
            .map(ChainedHeader::hash_height)
            .unwrap_or_else(|| HashHeight::new(*hash, 0))
    }

    fn node(&self, hash: &BlockHash) -> Result<&ChainedHeader, HeaderTreeError> {
        self.headers.get(hash).ok_or(HeaderTreeError::BlockNotInTree { hash: *hash })
    }

    fn node_mut(&mut self, hash: &BlockHash) -> Result<&mut ChainedHeader, HeaderTreeError> {
        self.headers.get_mut(hash).ok_or(HeaderTreeError::BlockNotInTree { hash: *hash })
    }

    /// Body cached for a downloaded, not yet connected block
    pub fn block(&self, hash: &BlockHash) -> Option<Arc<Block>> {
        self.headers.get(hash).and_then(|h| h.block.clone())
    }

    /// Deepest header that is an ancestor of both `a` and `b`
    pub fn find_fork(&self, a: BlockHash, b: BlockHash) -> Result<BlockHash, HeaderTreeError> {
        let mut ha = a;
        let mut hb = b;
        let mut na = self.node(&a)?.height;
        let mut nb = self.node(&b)?.height;

        // Walk the higher side down to the same height
        while na > nb {
            ha = self.node(&ha)?.parent.ok_or(HeaderTreeError::BlockNotInTree { hash: ha })?;
            na -= 1;
        }
        while nb > na {
            hb = self.node(&hb)?.parent.ok_or(HeaderTreeError::BlockNotInTree { hash: hb })?;
            nb -= 1;
        }

        // Then both up until they meet
        while ha != hb {
            ha = self.node(&ha)?.parent.ok_or(HeaderTreeError::BlockNotInTree { hash: ha })?;
            hb = self.node(&hb)?.parent.ok_or(HeaderTreeError::BlockNotInTree { hash: hb })?;
        }
        Ok(ha)
    }

    /// True if `block` is on the chain ending at `tip`
    pub fn chain_contains(&self, block: BlockHash, tip: BlockHash) -> bool {
        let Some(target) = self.headers.get(&block) else {
            return false;
        };
        let mut current = self.headers.get(&tip);
        while let Some(node) = current {
            if node.height <= target.height {
                return node.hash == block;
            }
            current = node.parent.and_then(|p| self.headers.get(&p));
        }
        false
    }

    /// Hashes from `ancestor` (exclusive) to `tip` (inclusive), ascending
    pub fn path_between(&self, ancestor: BlockHash, tip: BlockHash) -> Vec<BlockHash> {
        let mut chain = Vec::new();
        let mut current = Some(tip);
        while let Some(hash) = current {
            if hash == ancestor {
                break;
            }
            chain.push(hash);
            current = self.headers.get(&hash).and_then(|h| h.parent);
        }
        chain.reverse();
        chain
    }

    /// Fork point between the consensus chain and the best known chain,
    /// plus the best chain's headers above it in ascending order
    pub fn candidate_chain(&self) -> Result<(HashHeight, Vec<BlockHash>), HeaderTreeError> {
        let fork = self.find_fork(self.consensus_tip, self.best_tip)?;
        Ok((self.hash_height(&fork), self.path_between(fork, self.best_tip)))
    }

    /// Headers whose bodies have been requested and not yet delivered
    pub fn requested_count(&self) -> usize {
        self.headers
            .values()
            .filter(|h| h.data == BlockDataAvailability::Requested)
            .count()
    }

    // ── Header insertion ──────────────────────────────────────────

    /// Seed the consensus chain above the root with an already connected header
    pub fn extend_consensus(&mut self, header: BlockHeader) -> Result<HashHeight, HeaderTreeError> {
        let hash = header.hash();
        let tip = self.node(&self.consensus_tip)?;
        if header.previous_hash != tip.hash {
            return Err(HeaderTreeError::NotContinuous {
                hash,
                previous: tip.hash,
            });
        }
        let height = tip.height + 1;
        let chain_work = tip.chain_work.saturating_add(header.work());
        let parent = tip.hash;

        let mut node = ChainedHeader::new(header, height, Some(parent), chain_work, self.next_seen);
        node.state = ValidationState::FullyValidated;
        node.data = BlockDataAvailability::Available;
        self.next_seen += 1;
        self.headers.insert(hash, node);
        self.node_mut(&parent)?.children.push(hash);
        self.consensus_tip = hash;
        self.update_best_tip();
        Ok(HashHeight::new(hash, height))
    }

    /// Merge a batch of headers, in chain order, announced by `peer`.
    ///
    /// Known headers are skipped. New headers are checked against the
    /// header rules; one that fails is kept as `Invalid` so that it and
    /// its descendants are refused from then on. Headers inserted before
    /// a failure stay in the tree.
    pub fn connect_headers(
        &mut self,
        peer: Option<PeerId>,
        headers: &[BlockHeader],
        adjusted_time: u32,
    ) -> Result<ConnectOutcome, HeaderTreeError> {
        let mut outcome = ConnectOutcome::default();
        if headers.is_empty() {
            return Ok(outcome);
        }
        for pair in headers.windows(2) {
            let previous = pair[0].hash();
            if pair[1].previous_hash != previous {
                return Err(HeaderTreeError::NotContinuous {
                    hash: pair[1].hash(),
                    previous,
                });
            }
        }

        let mut result = Ok(());
        for header in headers {
            match self.connect_one(header, adjusted_time) {
                Ok((block, inserted)) => {
                    if inserted {
                        outcome.inserted.push(block);
                    }
                    outcome.last = Some(block);
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        if let (Some(peer), Some(last)) = (peer, outcome.last) {
            self.peer_tips.insert(peer, last.hash);
        }
        if !outcome.inserted.is_empty() {
            outcome.tip_changed = self.update_best_tip();
        }
        result.map(|_| outcome)
    }

    fn connect_one(
        &mut self,
        header: &BlockHeader,
        adjusted_time: u32,
    ) -> Result<(HashHeight, bool), HeaderTreeError> {
        let hash = header.hash();
        if let Some(existing) = self.headers.get(&hash) {
            if existing.is_invalid() {
                return Err(HeaderTreeError::HeaderInvalid {
                    hash,
                    error: existing.failure.clone().unwrap_or_else(|| {
                        ConsensusError::bad_prev_block(format!("header {hash} is invalid"))
                    }),
                });
            }
            return Ok((existing.hash_height(), false));
        }

        let parent = self.headers.get(&header.previous_hash).ok_or(HeaderTreeError::MissingParent {
            hash,
            parent: header.previous_hash,
        })?;
        if parent.is_invalid() {
            return Err(HeaderTreeError::HeaderInvalid {
                hash,
                error: ConsensusError::bad_prev_block(format!("parent {} is invalid", parent.hash)),
            });
        }
        let height = parent.height + 1;
        let chain_work = parent.chain_work.saturating_add(header.work());
        let parent_hash = parent.hash;

        if let Some(depth) = self.excess_fork_depth(parent_hash)? {
            return Err(HeaderTreeError::ForkTooDeep {
                hash,
                depth,
                max: self.settings.max_reorg_length,
            });
        }

        let mut ctx = ValidationContext::new(header.clone(), height);
        ctx.adjusted_time = adjusted_time;
        let checked = self.rules.run(Stage::Header, &mut ctx);

        let mut node = ChainedHeader::new(header.clone(), height, Some(parent_hash), chain_work, self.next_seen);
        self.next_seen += 1;
        if let Err(error) = &checked {
            node.state = ValidationState::Invalid;
            node.failure = Some(error.clone());
        }
        self.headers.insert(hash, node);
        self.node_mut(&parent_hash)?.children.push(hash);

        match checked {
            Ok(()) => {
                debug!("Header {hash} accepted at height {height}");
                Ok((HashHeight::new(hash, height), true))
            }
            Err(error) => Err(HeaderTreeError::HeaderInvalid { hash, error }),
        }
    }

    /// Depth below the consensus tip of the fork a child of `parent` would
    /// create, if that exceeds the reorganisation limit
    fn excess_fork_depth(&self, parent: BlockHash) -> Result<Option<u64>, HeaderTreeError> {
        let tip_height = self.node(&self.consensus_tip)?.height;
        let root_height = self.node(&self.root)?.height;
        // Every fork point lies at or above the root
        if root_height + self.settings.max_reorg_length >= tip_height {
            return Ok(None);
        }
        let fork = self.find_fork(parent, self.consensus_tip)?;
        let depth = tip_height - self.node(&fork)?.height;
        Ok((depth > self.settings.max_reorg_length).then_some(depth))
    }

    /// True if `a` should be preferred over `b` as the best tip
    fn better(&self, a: &ChainedHeader, b: &ChainedHeader) -> bool {
        if a.chain_work != b.chain_work {
            return a.chain_work > b.chain_work;
        }
        match self.settings.tie_break {
            TieBreak::EarliestSeen => a.seen < b.seen,
            TieBreak::LowestHash => a.hash < b.hash,
        }
    }

    /// Recompute the best known tip. Returns true if it moved.
    fn update_best_tip(&mut self) -> bool {
        let mut best: Option<&ChainedHeader> = None;
        for node in self.headers.values().filter(|h| !h.is_invalid()) {
            if best.is_none_or(|b| self.better(node, b)) {
                best = Some(node);
            }
        }
        let new_tip = best.map_or(self.consensus_tip, |b| b.hash);
        let changed = new_tip != self.best_tip;
        if changed {
            debug!("Best known tip now {}", self.hash_height(&new_tip));
        }
        self.best_tip = new_tip;
        changed
    }

    // ── Block data and validation state ──────────────────────────

    /// The next run of bodiless headers on the best chain, at most `max`
    /// long. Returned headers are marked as requested.
    pub fn headers_to_download(&mut self, max: usize) -> Vec<HashHeight> {
        let Ok((_, path)) = self.candidate_chain() else {
            return Vec::new();
        };
        let mut run = Vec::new();
        for hash in path {
            let Some(node) = self.headers.get(&hash) else {
                break;
            };
            if node.data == BlockDataAvailability::Missing && !node.is_invalid() {
                run.push(node.hash_height());
                if run.len() >= max {
                    break;
                }
            } else if !run.is_empty() {
                break;
            }
        }
        for block in &run {
            if let Some(node) = self.headers.get_mut(&block.hash) {
                node.data = BlockDataAvailability::Requested;
            }
        }
        run
    }

    /// Return a requested body to the missing pool
    pub fn mark_data_missing(&mut self, hash: &BlockHash) {
        if let Some(node) = self.headers.get_mut(hash) {
            if node.data == BlockDataAvailability::Requested {
                node.data = BlockDataAvailability::Missing;
            }
        }
    }

    /// Record an integrity-checked body. Returns false for a duplicate.
    pub fn block_data_downloaded(
        &mut self,
        hash: &BlockHash,
        block: Arc<Block>,
        peer: Option<PeerId>,
    ) -> Result<bool, HeaderTreeError> {
        let node = self.node_mut(hash)?;
        if node.is_invalid() {
            let error = node.failure.clone().unwrap_or_else(|| {
                ConsensusError::bad_prev_block(format!("block {hash} is invalid"))
            });
            return Err(HeaderTreeError::HeaderInvalid { hash: *hash, error });
        }
        if node.data == BlockDataAvailability::Available {
            return Ok(false);
        }
        node.block = Some(block);
        node.data = BlockDataAvailability::Available;
        node.source = peer;
        if node.state == ValidationState::HeaderValidated {
            node.state = ValidationState::DataDownloaded;
        }
        Ok(true)
    }

    /// Move a header forward. Setting the current state again is a no-op.
    pub fn set_state(&mut self, hash: &BlockHash, state: ValidationState) -> Result<(), HeaderTreeError> {
        let node = self.node_mut(hash)?;
        if node.state == state {
            return Ok(());
        }
        if !node.state.can_advance_to(state) {
            return Err(HeaderTreeError::InvalidState {
                hash: *hash,
                from: node.state,
                to: state,
            });
        }
        node.state = state;
        Ok(())
    }

    /// Mark a header and all its descendants invalid and fall back to the
    /// best surviving chain. Returns every header newly invalidated.
    pub fn mark_invalid(
        &mut self,
        hash: &BlockHash,
        error: ConsensusError,
    ) -> Result<Vec<BlockHash>, HeaderTreeError> {
        let node = self.node(hash)?;
        if node.is_invalid() {
            return Ok(Vec::new());
        }
        if node.state == ValidationState::FullyValidated {
            return Err(HeaderTreeError::InvalidState {
                hash: *hash,
                from: node.state,
                to: ValidationState::Invalid,
            });
        }

        let affected = self.collect_all_from(*hash);
        for invalid in &affected {
            if let Some(node) = self.headers.get_mut(invalid) {
                node.state = ValidationState::Invalid;
                node.block = None;
                node.failure = Some(if invalid == hash {
                    error.clone()
                } else {
                    ConsensusError::bad_prev_block(format!("descends from invalid block {hash}"))
                });
            }
        }
        let affected_set: HashSet<&BlockHash> = affected.iter().collect();
        self.peer_tips.retain(|_, tip| !affected_set.contains(tip));
        self.update_best_tip();
        Ok(affected)
    }

    /// Take the cached body of a block that is being connected
    pub fn take_block(&mut self, hash: &BlockHash) -> Option<Arc<Block>> {
        self.headers.get_mut(hash).and_then(|h| h.block.take())
    }

    pub fn set_consensus_tip(&mut self, hash: &BlockHash) -> Result<(), HeaderTreeError> {
        self.node(hash)?;
        self.consensus_tip = *hash;
        Ok(())
    }

    /// `hash` and everything descending from it
    fn collect_all_from(&self, hash: BlockHash) -> Vec<BlockHash> {
        let mut result = vec![hash];
        let mut stack = vec![hash];
        while let Some(h) = stack.pop() {
            if let Some(node) = self.headers.get(&h) {
                for child in &node.children {
                    result.push(*child);
                    stack.push(*child);
                }
            }
        }
        result
    }

    // ── Pruning ───────────────────────────────────────────────────

    /// Move the root up to `max_reorg_length` below the consensus tip and
    /// drop everything not descending from it. Returns the number removed.
    pub fn prune(&mut self) -> usize {
        let Some(tip) = self.headers.get(&self.consensus_tip) else {
            return 0;
        };
        let Some(boundary) = tip.height.checked_sub(self.settings.max_reorg_length) else {
            return 0;
        };

        let mut new_root = self.consensus_tip;
        while let Some(node) = self.headers.get(&new_root) {
            if node.height <= boundary {
                break;
            }
            match node.parent {
                Some(parent) => new_root = parent,
                None => break,
            }
        }
        if new_root == self.root {
            return 0;
        }

        let keep: HashSet<BlockHash> = self.collect_all_from(new_root).into_iter().collect();
        let before = self.headers.len();
        self.headers.retain(|hash, _| keep.contains(hash));
        self.peer_tips.retain(|_, tip| keep.contains(tip));
        if let Some(root) = self.headers.get_mut(&new_root) {
            root.parent = None;
        }
        self.root = new_root;
        let removed = before - self.headers.len();
        debug!("Pruned {removed} headers, root now {}", self.hash_height(&new_root));
        removed
    }

    /// Forget a peer's claim and drop branches nobody needs any more:
    /// off the consensus chain, unclaimed by any peer, holding no
    /// requested or downloaded data, and not known to be invalid.
    pub fn peer_disconnected(&mut self, peer: PeerId) -> Vec<BlockHash> {
        if self.peer_tips.remove(&peer).is_none() {
            return Vec::new();
        }

        let mut seeds = vec![self.consensus_tip];
        seeds.extend(self.peer_tips.values().copied());
        seeds.extend(
            self.headers
                .values()
                .filter(|h| h.data != BlockDataAvailability::Missing || h.is_invalid())
                .map(|h| h.hash),
        );

        let mut keep: HashSet<BlockHash> = HashSet::new();
        for seed in seeds {
            let mut current = Some(seed);
            while let Some(hash) = current {
                if !keep.insert(hash) {
                    break;
                }
                current = self.headers.get(&hash).and_then(|h| h.parent);
            }
        }

        let removed: Vec<BlockHash> =
            self.headers.keys().filter(|h| !keep.contains(*h)).copied().collect();
        if removed.is_empty() {
            return removed;
        }
        self.headers.retain(|hash, _| keep.contains(hash));
        for node in self.headers.values_mut() {
            node.children.retain(|child| keep.contains(child));
        }
        debug!("Dropped {} headers only {peer} claimed", removed.len());
        self.update_best_tip();
        removed
    }
}
