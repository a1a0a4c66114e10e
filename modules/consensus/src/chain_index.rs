//! Dense, height-ordered view of the accepted best header chain

use std::collections::HashMap;

use tessera_common::{interfaces::ChainUpdate, BlockHash, BlockHeader, ChainWork, HashHeight};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChainIndexError {
    #[error("chain index needs at least a genesis header")]
    Empty,

    #[error("header {hash} does not extend the chain at height {height}")]
    NotExtending { hash: BlockHash, height: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub hash: BlockHash,
    pub header: BlockHeader,
    /// Cumulative work up to and including this header
    pub chain_work: ChainWork,
}

/// The accepted chain, genesis at height 0. Every entry's previous hash is
/// the hash of the entry below it.
#[derive(Debug, Clone)]
pub struct ChainIndex {
    entries: Vec<IndexEntry>,
    heights: HashMap<BlockHash, u64>,
    /// Lowest height changed since the last persisted update
    dirty_from: Option<u64>,
}

impl ChainIndex {
    pub fn new(genesis: BlockHeader) -> Self {
        let hash = genesis.hash();
        let chain_work = genesis.work();
        Self {
            entries: vec![IndexEntry {
                hash,
                header: genesis,
                chain_work,
            }],
            heights: HashMap::from([(hash, 0)]),
            dirty_from: None,
        }
    }

    /// Rebuild from a persisted chain, genesis first
    pub fn from_headers(headers: Vec<BlockHeader>) -> Result<Self, ChainIndexError> {
        let mut headers = headers.into_iter();
        let genesis = headers.next().ok_or(ChainIndexError::Empty)?;
        let mut index = Self::new(genesis);
        for header in headers {
            index.push(header)?;
        }
        index.dirty_from = None;
        Ok(index)
    }

    pub fn height(&self) -> u64 {
        self.entries.len() as u64 - 1
    }

    pub fn tip(&self) -> HashHeight {
        HashHeight::new(self.tip_entry().hash, self.height())
    }

    pub fn tip_entry(&self) -> &IndexEntry {
        &self.entries[self.entries.len() - 1]
    }

    pub fn get(&self, height: u64) -> Option<&IndexEntry> {
        self.entries.get(height as usize)
    }

    pub fn hash_at(&self, height: u64) -> Option<BlockHash> {
        self.get(height).map(|e| e.hash)
    }

    pub fn height_of(&self, hash: &BlockHash) -> Option<u64> {
        self.heights.get(hash).copied()
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.heights.contains_key(hash)
    }

    pub fn push(&mut self, header: BlockHeader) -> Result<(), ChainIndexError> {
        let hash = header.hash();
        let height = self.height() + 1;
        let tip = self.tip_entry();
        if header.previous_hash != tip.hash {
            return Err(ChainIndexError::NotExtending { hash, height });
        }
        let chain_work = tip.chain_work.saturating_add(header.work());
        self.entries.push(IndexEntry {
            hash,
            header,
            chain_work,
        });
        self.heights.insert(hash, height);
        self.mark_dirty(height);
        Ok(())
    }

    /// Remove the tip. Genesis is never removed.
    pub fn pop(&mut self) -> Option<IndexEntry> {
        if self.entries.len() <= 1 {
            return None;
        }
        let entry = self.entries.pop()?;
        self.heights.remove(&entry.hash);
        self.mark_dirty(self.height() + 1);
        Some(entry)
    }

    /// Drop everything above `height`
    pub fn truncate(&mut self, height: u64) {
        while self.height() > height {
            self.pop();
        }
    }

    /// Timestamps of up to `count` headers ending at `height`, lowest first
    pub fn recent_times(&self, height: u64, count: usize) -> Vec<u32> {
        let Some(end) = (height as usize).checked_add(1) else {
            return Vec::new();
        };
        let end = end.min(self.entries.len());
        let start = end.saturating_sub(count);
        self.entries[start..end].iter().map(|e| e.header.time).collect()
    }

    /// Hashes stepping back from the tip: the last ten one by one, then
    /// doubling the stride, always ending at genesis
    pub fn block_locator(&self) -> Vec<BlockHash> {
        let mut locator = Vec::new();
        let mut height = self.height();
        let mut step = 1u64;
        loop {
            locator.push(self.entries[height as usize].hash);
            if height == 0 {
                break;
            }
            if locator.len() >= 10 {
                step *= 2;
            }
            height = height.saturating_sub(step);
        }
        locator
    }

    fn mark_dirty(&mut self, height: u64) {
        self.dirty_from = Some(self.dirty_from.map_or(height, |h| h.min(height)));
    }

    /// Changed suffix since the last call, if anything changed
    pub fn take_update(&mut self) -> Option<ChainUpdate> {
        let from = self.dirty_from.take()?;
        let first_height = from.min(self.height() + 1);
        let headers = self.entries[first_height as usize..].iter().map(|e| e.header.clone()).collect();
        Some(ChainUpdate {
            first_height,
            headers,
            tip: self.tip(),
        })
    }

    /// Put back an update that could not be persisted
    pub fn restore_update(&mut self, update: &ChainUpdate) {
        self.mark_dirty(update.first_height);
    }
}
