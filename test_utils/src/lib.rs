//! Shared test support: a regtest chain builder and in-memory stand-ins
//! for the collaborators the chain core talks to

use std::{
    collections::{HashMap, HashSet},
    ops::RangeInclusive,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use tessera_common::{
    interfaces::{
        BlockDownloader, BlockStore, ChainEvents, ChainRepository, ChainUpdate, JobId,
        PeerBanning, PeerTransport,
    },
    network::NetworkParams,
    Block, BlockHash, BlockHeader, HashHeight, OutPoint, PeerId, Target, Transaction, TxIn,
    TxOut,
};

/// Anyone-can-spend output script
pub const OP_TRUE: [u8; 1] = [0x51];

/// Seconds between consecutive built blocks
pub const BLOCK_SPACING: u32 = 600;

/// Grind the nonce until the header meets its own target. Headers whose
/// bits do not decode are left untouched.
pub fn solve(header: &mut BlockHeader) {
    let Some(target) = header.target() else {
        return;
    };
    while !target.is_met_by(&header.hash()) {
        header.nonce = header.nonce.wrapping_add(1);
    }
}

/// Grind the nonce until the header misses its target
pub fn unsolve(header: &mut BlockHeader) {
    let Some(target) = header.target() else {
        return;
    };
    while target.is_met_by(&header.hash()) {
        header.nonce = header.nonce.wrapping_add(1);
    }
}

pub fn coinbase(height: u64, tag: u8, value: u64) -> Transaction {
    let mut script_sig = height.to_le_bytes().to_vec();
    script_sig.push(tag);
    Transaction {
        version: 1,
        inputs: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig,
            sequence: u32::MAX,
            witness: vec![],
        }],
        outputs: vec![TxOut {
            value,
            script_pubkey: OP_TRUE.to_vec(),
        }],
        lock_time: 0,
    }
}

/// Spend output `vout` of `prev` into outputs of the given values
pub fn spend(prev: &Transaction, vout: u32, values: &[u64]) -> Transaction {
    Transaction {
        version: 2,
        inputs: vec![TxIn {
            previous_output: OutPoint::new(prev.txid(), vout),
            script_sig: vec![],
            sequence: u32::MAX,
            witness: vec![],
        }],
        outputs: values
            .iter()
            .map(|value| TxOut {
                value: *value,
                script_pubkey: OP_TRUE.to_vec(),
            })
            .collect(),
        lock_time: 0,
    }
}

/// Builds a chain of valid blocks on top of a network's genesis
#[derive(Debug, Clone)]
pub struct ChainBuilder {
    params: NetworkParams,
    headers: Vec<BlockHeader>,
    blocks: Vec<Option<Arc<Block>>>,
    tag: u8,
    bits: u32,
}

impl ChainBuilder {
    pub fn new(params: &NetworkParams) -> Self {
        Self {
            params: params.clone(),
            headers: vec![params.genesis.clone()],
            blocks: vec![None],
            tag: 0,
            bits: params.pow_limit_bits,
        }
    }

    pub fn params(&self) -> &NetworkParams {
        &self.params
    }

    /// Branch off at `height`; `tag` keeps the branch's blocks distinct
    pub fn fork_at(&self, height: u64, tag: u8) -> Self {
        let keep = height as usize + 1;
        let mut fork = self.clone();
        fork.headers.truncate(keep);
        fork.blocks.truncate(keep);
        fork.tag = tag;
        fork
    }

    /// Compact target for blocks mined from now on
    pub fn with_bits(mut self, bits: u32) -> Self {
        self.bits = bits;
        self
    }

    pub fn height(&self) -> u64 {
        self.headers.len() as u64 - 1
    }

    pub fn tip(&self) -> HashHeight {
        self.hash_height(self.height())
    }

    pub fn header(&self, height: u64) -> &BlockHeader {
        &self.headers[height as usize]
    }

    pub fn headers(&self, range: RangeInclusive<u64>) -> Vec<BlockHeader> {
        range.map(|h| self.header(h).clone()).collect()
    }

    pub fn block(&self, height: u64) -> Arc<Block> {
        self.blocks[height as usize]
            .clone()
            .unwrap_or_else(|| panic!("no body built at height {height}"))
    }

    pub fn hash_height(&self, height: u64) -> HashHeight {
        HashHeight::new(self.header(height).hash(), height)
    }

    pub fn hash_heights(&self, range: RangeInclusive<u64>) -> Vec<HashHeight> {
        range.map(|h| self.hash_height(h)).collect()
    }

    pub fn mine(&mut self) -> Arc<Block> {
        self.mine_with(vec![])
    }

    pub fn mine_n(&mut self, count: u64) -> Vec<Arc<Block>> {
        (0..count).map(|_| self.mine()).collect()
    }

    /// Mine a block carrying a subsidy-paying coinbase followed by `txs`
    pub fn mine_with(&mut self, txs: Vec<Transaction>) -> Arc<Block> {
        self.mine_edited(txs, |_| {})
    }

    /// Mine a block, letting `edit` tamper with it after the merkle root is
    /// set and before the proof of work is ground
    pub fn mine_edited(&mut self, txs: Vec<Transaction>, edit: impl FnOnce(&mut Block)) -> Arc<Block> {
        let height = self.height() + 1;
        let prev = self.header(height - 1);
        let mut transactions = vec![coinbase(height, self.tag, self.params.subsidy(height))];
        transactions.extend(txs);
        let mut block = Block {
            header: BlockHeader {
                version: 4,
                previous_hash: prev.hash(),
                merkle_root: Default::default(),
                time: prev.time + BLOCK_SPACING,
                bits: self.bits,
                nonce: 0,
            },
            transactions,
        };
        block.header.merkle_root = block.compute_merkle_root();
        edit(&mut block);
        solve(&mut block.header);
        let block = Arc::new(block);
        self.headers.push(block.header.clone());
        self.blocks.push(Some(block.clone()));
        block
    }

    /// Coinbase of the block at `height`
    pub fn coinbase_of(&self, height: u64) -> Transaction {
        self.block(height).transactions[0].clone()
    }
}

/// True if the header's hash satisfies its compact target
pub fn meets_target(header: &BlockHeader) -> bool {
    header.target().is_some_and(|t: Target| t.is_met_by(&header.hash()))
}

// ── Collaborators ─────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryChainRepository {
    chain: Mutex<Vec<BlockHeader>>,
    saves: AtomicUsize,
    failing: AtomicBool,
}

impl InMemoryChainRepository {
    pub fn with_chain(headers: Vec<BlockHeader>) -> Self {
        Self {
            chain: Mutex::new(headers),
            ..Default::default()
        }
    }

    pub fn chain(&self) -> Vec<BlockHeader> {
        self.chain.lock().unwrap().clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChainRepository for InMemoryChainRepository {
    async fn load(&self, genesis: &BlockHeader) -> Result<Vec<BlockHeader>> {
        let chain = self.chain.lock().unwrap();
        if chain.is_empty() {
            return Ok(vec![genesis.clone()]);
        }
        Ok(chain.clone())
    }

    async fn save(&self, update: ChainUpdate) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("chain repository unavailable");
        }
        let mut chain = self.chain.lock().unwrap();
        chain.truncate(update.first_height as usize);
        chain.extend(update.headers);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryBlockStore {
    blocks: Mutex<HashMap<BlockHash, Arc<Block>>>,
    pending: Mutex<Vec<HashHeight>>,
    flushes: AtomicUsize,
    failing: AtomicBool,
}

impl InMemoryBlockStore {
    pub fn pending(&self) -> Vec<HashHeight> {
        self.pending.lock().unwrap().clone()
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.blocks.lock().unwrap().contains_key(hash)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlockStore for InMemoryBlockStore {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn add_pending(&self, block: HashHeight, body: Arc<Block>) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("block store unavailable");
        }
        self.blocks.lock().unwrap().insert(block.hash, body);
        self.pending.lock().unwrap().push(block);
        Ok(())
    }

    async fn get_block(&self, hash: &BlockHash) -> Result<Option<Block>> {
        Ok(self.blocks.lock().unwrap().get(hash).map(|b| (**b).clone()))
    }

    async fn flush(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("block store unavailable");
        }
        self.pending.lock().unwrap().clear();
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingBanning {
    bans: Mutex<Vec<(PeerId, String, Duration)>>,
}

impl RecordingBanning {
    pub fn bans(&self) -> Vec<(PeerId, String)> {
        self.bans.lock().unwrap().iter().map(|(p, r, _)| (*p, r.clone())).collect()
    }

    pub fn is_banned(&self, peer: PeerId) -> bool {
        self.bans.lock().unwrap().iter().any(|(p, _, _)| *p == peer)
    }
}

#[async_trait]
impl PeerBanning for RecordingBanning {
    async fn ban(&self, peer: PeerId, reason: &str, duration: Duration) -> Result<()> {
        self.bans.lock().unwrap().push((peer, reason.to_string(), duration));
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainEvent {
    Connected(HashHeight),
    Disconnected(HashHeight),
}

#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<ChainEvent>>,
}

impl RecordingEvents {
    pub fn events(&self) -> Vec<ChainEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Drain what has been recorded so far
    pub fn take(&self) -> Vec<ChainEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

#[async_trait]
impl ChainEvents for RecordingEvents {
    async fn block_connected(&self, block: HashHeight) -> Result<()> {
        self.events.lock().unwrap().push(ChainEvent::Connected(block));
        Ok(())
    }

    async fn block_disconnected(&self, block: HashHeight) -> Result<()> {
        self.events.lock().unwrap().push(ChainEvent::Disconnected(block));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingTransport {
    block_requests: Mutex<Vec<(PeerId, Vec<BlockHash>)>>,
    header_requests: Mutex<Vec<(PeerId, Vec<BlockHash>)>>,
    failing: Mutex<HashSet<PeerId>>,
}

impl RecordingTransport {
    /// Make every request to `peer` fail
    pub fn fail_peer(&self, peer: PeerId) {
        self.failing.lock().unwrap().insert(peer);
    }

    /// All body hashes successfully requested from `peer`, in order
    pub fn requested_hashes(&self, peer: PeerId) -> Vec<BlockHash> {
        self.block_requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| *p == peer)
            .flat_map(|(_, hashes)| hashes.iter().copied())
            .collect()
    }

    pub fn header_requests(&self) -> Vec<(PeerId, Vec<BlockHash>)> {
        self.header_requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerTransport for RecordingTransport {
    async fn request_blocks(&self, peer: PeerId, hashes: Vec<BlockHash>) -> Result<()> {
        if self.failing.lock().unwrap().contains(&peer) {
            bail!("{peer} unreachable");
        }
        self.block_requests.lock().unwrap().push((peer, hashes));
        Ok(())
    }

    async fn request_headers(&self, peer: PeerId, locator: Vec<BlockHash>) -> Result<()> {
        if self.failing.lock().unwrap().contains(&peer) {
            bail!("{peer} unreachable");
        }
        self.header_requests.lock().unwrap().push((peer, locator));
        Ok(())
    }
}

/// Download scheduler stand-in that records what it was asked for
#[derive(Default)]
pub struct RecordingDownloader {
    next_job: AtomicU64,
    requests: Mutex<Vec<Vec<HashHeight>>>,
    cancelled: Mutex<Vec<BlockHash>>,
    tips: Mutex<Vec<(PeerId, u64)>>,
}

impl RecordingDownloader {
    pub fn requests(&self) -> Vec<Vec<HashHeight>> {
        self.requests.lock().unwrap().clone()
    }

    /// Every requested header, flattened
    pub fn requested(&self) -> Vec<HashHeight> {
        self.requests.lock().unwrap().iter().flatten().copied().collect()
    }

    pub fn cancelled(&self) -> Vec<BlockHash> {
        self.cancelled.lock().unwrap().clone()
    }

    pub fn tips(&self) -> Vec<(PeerId, u64)> {
        self.tips.lock().unwrap().clone()
    }
}

#[async_trait]
impl BlockDownloader for RecordingDownloader {
    async fn request_blocks_download(&self, headers: Vec<HashHeight>) -> Result<JobId> {
        self.requests.lock().unwrap().push(headers);
        Ok(JobId(self.next_job.fetch_add(1, Ordering::SeqCst)))
    }

    async fn cancel_downloads(&self, hashes: &[BlockHash]) {
        self.cancelled.lock().unwrap().extend_from_slice(hashes);
    }

    fn update_peer_tip(&self, peer: PeerId, height: u64) {
        self.tips.lock().unwrap().push((peer, height));
    }
}
