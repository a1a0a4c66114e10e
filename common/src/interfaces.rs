//! Collaborators the chain core consumes, specified only by their contracts

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;

use crate::hash::BlockHash;
use crate::types::{Block, BlockHeader, HashHeight, OutPoint, PeerId, TxOut};

/// Monotonically allocated identity of a download job
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Changed suffix of the accepted chain: everything from `first_height`
/// onward is replaced by `headers`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainUpdate {
    pub first_height: u64,
    pub headers: Vec<BlockHeader>,
    pub tip: HashHeight,
}

/// Persistent store of the accepted header chain
#[async_trait]
pub trait ChainRepository: Send + Sync {
    /// Load the persisted chain, genesis first. An empty store yields just
    /// `genesis`.
    async fn load(&self, genesis: &BlockHeader) -> Result<Vec<BlockHeader>>;

    async fn save(&self, update: ChainUpdate) -> Result<()>;
}

/// Storage for block bodies
#[async_trait]
pub trait BlockStore: Send + Sync {
    async fn initialize(&self) -> Result<()>;

    /// Queue a connected block for the next flush; readable immediately
    async fn add_pending(&self, block: HashHeight, body: Arc<Block>) -> Result<()>;

    async fn get_block(&self, hash: &BlockHash) -> Result<Option<Block>>;

    async fn flush(&self) -> Result<()>;
}

/// Unspent output set at the consensus tip
#[async_trait]
pub trait CoinView: Send + Sync {
    async fn tip(&self) -> Result<HashHeight>;

    /// Look up unspent outputs; missing entries are simply absent
    async fn fetch_outputs(&self, outpoints: &[OutPoint]) -> Result<HashMap<OutPoint, TxOut>>;

    /// Spend the block's inputs and add its outputs; `block` becomes the tip
    async fn apply(&self, block: HashHeight, body: &Block) -> Result<()>;

    /// Undo the tip block, which must be `block`
    async fn rewind(&self, block: HashHeight) -> Result<()>;
}

#[async_trait]
pub trait PeerBanning: Send + Sync {
    async fn ban(&self, peer: PeerId, reason: &str, duration: Duration) -> Result<()>;
}

/// Receivers of committed chain changes
#[async_trait]
pub trait ChainEvents: Send + Sync {
    async fn block_connected(&self, block: HashHeight) -> Result<()>;

    async fn block_disconnected(&self, block: HashHeight) -> Result<()>;
}

/// Outbound half of the peer transport
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn request_blocks(&self, peer: PeerId, hashes: Vec<BlockHash>) -> Result<()>;

    async fn request_headers(&self, peer: PeerId, locator: Vec<BlockHash>) -> Result<()>;
}

/// The chain core's view of the block download scheduler
#[async_trait]
pub trait BlockDownloader: Send + Sync {
    /// Schedule bodies for a contiguous, ascending run of headers
    async fn request_blocks_download(&self, headers: Vec<HashHeight>) -> Result<JobId>;

    /// Drop any assignment or queued request for these blocks
    async fn cancel_downloads(&self, hashes: &[BlockHash]);

    /// Record the best height a peer claims to have
    fn update_peer_tip(&self, peer: PeerId, height: u64);
}
