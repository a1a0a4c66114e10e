//! Keeps the consensus tip on the valid chain with the most work.
//!
//! The manager owns the chain index and the header tree. Peers feed it
//! headers and downloaded bodies; it runs them through the validation
//! pipeline, schedules downloads for the best known chain and, once enough
//! of that chain is validated, switches the consensus tip to it. A switch
//! either completes or is rolled back: readers see the old tip until the
//! new one is committed, and chain events go out only after the commit.

use std::{
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use anyhow::anyhow;
use tessera_common::{
    interfaces::{
        BlockDownloader, BlockStore, ChainEvents, ChainRepository, CoinView, PeerBanning,
        PeerTransport,
    },
    network::NetworkParams,
    validation::ConsensusError,
    Block, BlockHash, BlockHeader, ChainWork, HashHeight, OutPoint, PeerId,
};
use tessera_module_block_puller::DownloadedBlock;
use tokio::{
    sync::{watch, Mutex, Semaphore},
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::chain_index::ChainIndex;
use crate::chained_header::ValidationState;
use crate::chained_header_tree::{ChainedHeaderTree, ConnectOutcome, TreeSettings};
use crate::configuration::ConsensusConfig;
use crate::manager_error::ConsensusManagerError;
use crate::rules::Stage;
use crate::tree_error::HeaderTreeError;
use crate::validation_pipeline::{unix_now, RuleSet, ValidationContext};

/// Largest header batch a peer sends; a full batch means it has more
pub const MAX_HEADERS_RESULTS: usize = 2000;

/// Everything the manager talks to outside its own state
#[derive(Clone)]
pub struct Collaborators {
    pub chain_repository: Arc<dyn ChainRepository>,
    pub block_store: Arc<dyn BlockStore>,
    pub coin_view: Arc<dyn CoinView>,
    pub banning: Arc<dyn PeerBanning>,
    pub events: Arc<dyn ChainEvents>,
    pub downloader: Arc<dyn BlockDownloader>,
    pub transport: Arc<dyn PeerTransport>,
}

struct ChainState {
    index: ChainIndex,
    tree: ChainedHeaderTree,
}

impl ChainState {
    /// Median timestamp of up to `span` headers ending at `parent`
    fn median_time_past(&self, parent: BlockHash, span: usize) -> Option<u32> {
        let mut times = Vec::with_capacity(span);
        let mut lowest = None;
        let mut current = self.tree.get(&parent);
        while let Some(node) = current {
            if times.len() >= span {
                break;
            }
            times.push(node.header.time);
            lowest = Some(node.height);
            current = node.parent.and_then(|p| self.tree.get(&p));
        }
        // Below the tree root the chain index holds the same chain
        if let Some(lowest) = lowest.filter(|h| *h > 0) {
            times.extend(self.index.recent_times(lowest - 1, span.saturating_sub(times.len())));
        }
        if times.is_empty() {
            return None;
        }
        times.sort_unstable();
        Some(times[times.len() / 2])
    }
}

struct PlannedBlock {
    block: HashHeight,
    header: BlockHeader,
    chain_work: ChainWork,
    /// Cached body; previously connected blocks come from the block store
    body: Option<Arc<Block>>,
    fully_validated: bool,
    source: Option<PeerId>,
    median_time_past: Option<u32>,
}

/// Switch from the consensus tip to a better chain
struct ConnectPlan {
    fork: HashHeight,
    /// Consensus chain above the fork, tip first
    disconnect: Vec<HashHeight>,
    /// New chain above the fork, ascending
    connect: Vec<PlannedBlock>,
}

enum ConnectFailure {
    Rule(ConsensusError),
    Storage(anyhow::Error),
}

pub struct ConsensusManager {
    config: ConsensusConfig,
    rules: Arc<RuleSet>,
    collaborators: Collaborators,
    state: RwLock<Option<ChainState>>,
    /// Serialises tip changes and flushes
    commit: Mutex<()>,
    partial_workers: Semaphore,
    /// Set once on shutdown or a fatal error
    shutting_down: watch::Sender<bool>,
}

impl ConsensusManager {
    pub fn new(config: ConsensusConfig, params: Arc<NetworkParams>, collaborators: Collaborators) -> Self {
        Self::with_rules(config, Arc::new(RuleSet::for_network(params)), collaborators)
    }

    pub fn with_rules(config: ConsensusConfig, rules: Arc<RuleSet>, collaborators: Collaborators) -> Self {
        let workers = config.partial_validation_workers.max(1);
        Self {
            config,
            rules,
            collaborators,
            state: RwLock::new(None),
            commit: Mutex::new(()),
            partial_workers: Semaphore::new(workers),
            shutting_down: watch::channel(false).0,
        }
    }

    fn tree_settings(&self) -> TreeSettings {
        TreeSettings {
            max_reorg_length: self.config.max_reorg_length,
            tie_break: self.config.tie_break,
        }
    }

    fn read_state<T>(&self, f: impl FnOnce(&ChainState) -> T) -> Result<T, ConsensusManagerError> {
        let guard = self.state.read().unwrap_or_else(PoisonError::into_inner);
        guard.as_ref().map(f).ok_or(ConsensusManagerError::NotInitialized)
    }

    fn write_state<T>(&self, f: impl FnOnce(&mut ChainState) -> T) -> Result<T, ConsensusManagerError> {
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        guard.as_mut().map(f).ok_or(ConsensusManagerError::NotInitialized)
    }

    fn ensure_running(&self) -> Result<(), ConsensusManagerError> {
        if self.is_shutting_down() {
            return Err(ConsensusManagerError::ShuttingDown);
        }
        Ok(())
    }

    /// Load the persisted chain and seed the header tree from it.
    ///
    /// Headers the coin view has not caught up with are taken off the
    /// chain index and put back into the tree as plain validated headers,
    /// so their bodies are downloaded and connected again.
    pub async fn initialize(&self) -> Result<(), ConsensusManagerError> {
        let params = self.rules.params();
        let headers = self
            .collaborators
            .chain_repository
            .load(&params.genesis)
            .await
            .map_err(ConsensusManagerError::Storage)?;
        if headers.first().map(BlockHeader::hash) != Some(params.genesis_hash()) {
            return Err(ConsensusManagerError::Storage(anyhow!(
                "persisted chain does not start at the {} genesis",
                params.name
            )));
        }
        let mut index = ChainIndex::from_headers(headers)?;

        let coin_tip = self.collaborators.coin_view.tip().await.map_err(ConsensusManagerError::Storage)?;
        if index.hash_at(coin_tip.height) != Some(coin_tip.hash) {
            return Err(ConsensusManagerError::Storage(anyhow!(
                "coin view tip {coin_tip} is not on the persisted chain"
            )));
        }
        let unconnected: Vec<BlockHeader> = ((coin_tip.height + 1)..=index.height())
            .filter_map(|h| index.get(h).map(|e| e.header.clone()))
            .collect();
        if !unconnected.is_empty() {
            warn!(
                "Coin view is at {coin_tip}, revalidating {} persisted headers above it",
                unconnected.len()
            );
            index.truncate(coin_tip.height);
        }

        let root_height = index.height().saturating_sub(self.config.max_reorg_length);
        let root = index.get(root_height).ok_or_else(|| {
            ConsensusManagerError::Storage(anyhow!("chain index has no header at {root_height}"))
        })?;
        let mut tree = ChainedHeaderTree::new(
            root.header.clone(),
            root_height,
            root.chain_work,
            self.tree_settings(),
            self.rules.clone(),
        );
        for height in (root_height + 1)..=index.height() {
            if let Some(entry) = index.get(height) {
                tree.extend_consensus(entry.header.clone())?;
            }
        }
        if let Err(e) = tree.connect_headers(None, &unconnected, unix_now()) {
            warn!("Persisted headers above the coin view rejected: {e}");
        }

        self.collaborators.block_store.initialize().await.map_err(ConsensusManagerError::Storage)?;

        let tip = index.tip();
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = Some(ChainState { index, tree });
        info!("Consensus manager initialised at {tip}");
        self.schedule_downloads().await
    }

    // ── Readers ───────────────────────────────────────────────────

    pub fn tip(&self) -> Result<HashHeight, ConsensusManagerError> {
        self.read_state(|s| s.index.tip())
    }

    pub fn best_known_tip(&self) -> Result<HashHeight, ConsensusManagerError> {
        self.read_state(|s| s.tree.best_tip())
    }

    pub fn header_at(&self, height: u64) -> Result<Option<BlockHeader>, ConsensusManagerError> {
        self.read_state(|s| s.index.get(height).map(|e| e.header.clone()))
    }

    pub fn block_locator(&self) -> Result<Vec<BlockHash>, ConsensusManagerError> {
        self.read_state(|s| s.index.block_locator())
    }

    /// Validation state of a header still held in the tree
    pub fn header_state(&self, hash: &BlockHash) -> Result<Option<ValidationState>, ConsensusManagerError> {
        self.read_state(|s| s.tree.get(hash).map(|h| h.state))
    }

    pub async fn get_block(&self, hash: &BlockHash) -> Result<Option<Block>, ConsensusManagerError> {
        self.collaborators.block_store.get_block(hash).await.map_err(ConsensusManagerError::Storage)
    }

    // ── Peer input ────────────────────────────────────────────────

    /// Merge headers announced by `peer` and schedule downloads for the
    /// best chain. Peers sending invalid or broken batches are banned.
    pub async fn headers_presented(
        &self,
        peer: PeerId,
        headers: Vec<BlockHeader>,
    ) -> Result<ConnectOutcome, ConsensusManagerError> {
        self.ensure_running()?;
        let full_batch = headers.len() >= MAX_HEADERS_RESULTS;
        let result = self.write_state(|s| s.tree.connect_headers(Some(peer), &headers, unix_now()))?;

        match result {
            Ok(outcome) => {
                if let Some(last) = outcome.last {
                    self.collaborators.downloader.update_peer_tip(peer, last.height);
                    if full_batch {
                        self.request_headers(peer, Some(last.hash)).await;
                    }
                }
                if outcome.tip_changed {
                    debug!("Best known tip now {}", self.best_known_tip()?);
                }
                self.schedule_downloads().await?;
                Ok(outcome)
            }
            Err(e) => {
                match &e {
                    HeaderTreeError::MissingParent { .. } => self.request_headers(peer, None).await,
                    other if other.is_misbehaviour() => self.ban(peer, &other.to_string()).await,
                    _ => {}
                }
                self.schedule_downloads().await?;
                Err(e.into())
            }
        }
    }

    /// Check a delivered body, validate it and connect whatever became
    /// connectable
    pub async fn block_downloaded(&self, downloaded: DownloadedBlock) -> Result<(), ConsensusManagerError> {
        self.ensure_running()?;
        let DownloadedBlock { peer, block, .. } = downloaded;
        let hash = block.hash();

        let Some(height) = self.read_state(|s| s.tree.get(&hash).map(|h| h.height))? else {
            debug!("Ignoring block {hash} from {peer}: header unknown");
            return Ok(());
        };

        let mut ctx = ValidationContext::for_block(block.clone(), height).with_peer(Some(peer));
        if let Err(error) = self.rules.run(Stage::Integrity, &mut ctx) {
            if error.is_body_mutation() {
                // The header may be fine; fetch the body again elsewhere
                self.ban(peer, &error.to_string()).await;
                self.write_state(|s| s.tree.mark_data_missing(&hash))?;
                self.schedule_downloads().await?;
                return Err(ConsensusManagerError::Rule {
                    hash,
                    peer: Some(peer),
                    error,
                });
            }
            let failure = self.invalidate(hash, error, Some(peer)).await;
            self.schedule_downloads().await?;
            return Err(failure);
        }

        let fresh = self.write_state(|s| s.tree.block_data_downloaded(&hash, block, Some(peer)))??;
        if !fresh {
            return Ok(());
        }

        let checked = {
            let _permit = self
                .partial_workers
                .acquire()
                .await
                .map_err(|_| ConsensusManagerError::ShuttingDown)?;
            let rules = self.rules.clone();
            tokio::task::spawn_blocking(move || rules.run(Stage::Partial, &mut ctx)).await?
        };

        match checked {
            Ok(()) => {
                let advanced = self.write_state(|s| s.tree.set_state(&hash, ValidationState::PartiallyValidated))?;
                if let Err(e) = advanced {
                    debug!("Block {hash} changed while validating: {e}");
                    return Ok(());
                }
            }
            Err(error) => {
                let failure = self.invalidate(hash, error, Some(peer)).await;
                self.schedule_downloads().await?;
                return Err(failure);
            }
        }

        let connected = self.try_connect_best_chain().await;
        self.schedule_downloads().await?;
        connected.map(|_| ())
    }

    /// Every peer failed to deliver this body; request it again
    pub async fn download_failed(&self, hash: &BlockHash) -> Result<(), ConsensusManagerError> {
        warn!("Download of block {hash} failed on every peer");
        self.write_state(|s| s.tree.mark_data_missing(hash))?;
        if self.is_shutting_down() {
            return Ok(());
        }
        self.schedule_downloads().await
    }

    pub async fn peer_connected(&self, peer: PeerId, best_height: u64) -> Result<(), ConsensusManagerError> {
        self.ensure_running()?;
        self.collaborators.downloader.update_peer_tip(peer, best_height);
        if best_height > self.best_known_tip()?.height {
            self.request_headers(peer, None).await;
        }
        self.schedule_downloads().await
    }

    pub async fn peer_disconnected(&self, peer: PeerId) -> Result<(), ConsensusManagerError> {
        let removed = self.write_state(|s| s.tree.peer_disconnected(peer))?;
        if !removed.is_empty() {
            debug!("{peer} left, dropped {} headers", removed.len());
        }
        if self.is_shutting_down() {
            return Ok(());
        }
        self.schedule_downloads().await
    }

    async fn request_headers(&self, peer: PeerId, from: Option<BlockHash>) {
        let Ok(locator) = self.block_locator() else {
            return;
        };
        let locator = from.into_iter().chain(locator).collect();
        if let Err(e) = self.collaborators.transport.request_headers(peer, locator).await {
            warn!("Failed to request headers from {peer}: {e:#}");
        }
    }

    async fn ban(&self, peer: PeerId, reason: &str) {
        warn!("Banning {peer}: {reason}");
        if let Err(e) = self.collaborators.banning.ban(peer, reason, self.config.ban_duration()).await {
            error!("Failed to ban {peer}: {e:#}");
        }
    }

    /// Invalidate a header and its descendants, penalising the peer that
    /// supplied the data
    async fn invalidate(&self, hash: BlockHash, error: ConsensusError, peer: Option<PeerId>) -> ConsensusManagerError {
        match self.write_state(|s| s.tree.mark_invalid(&hash, error.clone())) {
            Ok(Ok(affected)) if !affected.is_empty() => {
                warn!("Block {hash} is invalid ({error}), dropping {} headers", affected.len());
                self.collaborators.downloader.cancel_downloads(&affected).await;
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("Could not invalidate {hash}: {e}"),
            Err(e) => return e,
        }
        if let Some(peer) = peer {
            self.ban(peer, &error.to_string()).await;
        }
        ConsensusManagerError::Rule { hash, peer, error }
    }

    /// Request bodies for the best chain, up to the in-flight limit
    async fn schedule_downloads(&self) -> Result<(), ConsensusManagerError> {
        let batch = self.config.download_batch_size.max(1);
        let limit = self.config.max_blocks_in_flight;
        let runs = self.write_state(|s| {
            let mut runs = Vec::new();
            let mut in_flight = s.tree.requested_count();
            while in_flight < limit {
                let run = s.tree.headers_to_download(batch.min(limit - in_flight));
                if run.is_empty() {
                    break;
                }
                in_flight += run.len();
                runs.push(run);
            }
            runs
        })?;

        for run in runs {
            if let Err(e) = self.collaborators.downloader.request_blocks_download(run.clone()).await {
                warn!("Download request for {} blocks refused: {e:#}", run.len());
                self.write_state(|s| {
                    for block in &run {
                        s.tree.mark_data_missing(&block.hash);
                    }
                })?;
            }
        }
        Ok(())
    }

    // ── Tip changes ───────────────────────────────────────────────

    /// Connect as much of the best known chain as is ready. Switching to a
    /// fork happens only once the ready part of it carries more work than
    /// the current tip. Returns the new tip if it moved.
    pub async fn try_connect_best_chain(&self) -> Result<Option<HashHeight>, ConsensusManagerError> {
        self.ensure_running()?;
        let _commit = self.commit.lock().await;
        let mut first_failure = None;
        let mut new_tip = None;

        // Each rule failure invalidates a header, so this ends
        loop {
            let Some(plan) = self.read_state(|s| self.plan_connection(s))?? else {
                break;
            };
            match self.execute(plan).await {
                Ok(Some(tip)) => {
                    new_tip = Some(tip);
                    break;
                }
                // The tree changed under the plan and it was undone; plan again
                Ok(None) => {}
                Err(e @ ConsensusManagerError::Rule { .. }) => {
                    first_failure.get_or_insert(e);
                }
                Err(e) => {
                    if e.is_fatal() {
                        self.halt(&e);
                    }
                    return Err(e);
                }
            }
        }

        match first_failure {
            Some(e) => Err(e),
            None => Ok(new_tip),
        }
    }

    fn plan_connection(&self, s: &ChainState) -> Result<Option<ConnectPlan>, HeaderTreeError> {
        let (fork, path) = s.tree.candidate_chain()?;
        let span = self.rules.params().median_time_span;

        let mut connect: Vec<PlannedBlock> = Vec::new();
        let mut parent = fork.hash;
        for hash in &path {
            let Some(node) = s.tree.get(hash) else {
                break;
            };
            let fully_validated = node.state == ValidationState::FullyValidated;
            if !node.is_connectable() || (node.block.is_none() && !fully_validated) {
                break;
            }
            connect.push(PlannedBlock {
                block: node.hash_height(),
                header: node.header.clone(),
                chain_work: node.chain_work,
                body: node.block.clone(),
                fully_validated,
                source: node.source,
                median_time_past: s.median_time_past(parent, span),
            });
            parent = node.hash;
        }

        let Some(last) = connect.last() else {
            return Ok(None);
        };
        let tip = s.index.tip();
        if fork.hash != tip.hash && last.chain_work <= s.index.tip_entry().chain_work {
            debug!("Fork at {fork} not yet heavier than {tip}, waiting for more blocks");
            return Ok(None);
        }

        let disconnect = ((fork.height + 1)..=tip.height)
            .rev()
            .filter_map(|h| s.index.hash_at(h).map(|hash| HashHeight::new(hash, h)))
            .collect();
        Ok(Some(ConnectPlan {
            fork,
            disconnect,
            connect,
        }))
    }

    /// Apply a plan to the coin view, then commit it to the index and tree.
    /// Returns `None` if the plan no longer fits the tree by commit time,
    /// in which case the coin view has been put back.
    async fn execute(&self, plan: ConnectPlan) -> Result<Option<HashHeight>, ConsensusManagerError> {
        let coins = &self.collaborators.coin_view;

        let mut disconnected = Vec::new();
        for block in &plan.disconnect {
            if let Err(e) = coins.rewind(*block).await {
                self.roll_back(&[], &disconnected).await?;
                return Err(ConsensusManagerError::Storage(e));
            }
            disconnected.push(*block);
        }

        let mut connected = Vec::new();
        for planned in &plan.connect {
            match self.connect_block(planned).await {
                Ok(()) => connected.push(planned.block),
                Err(failure) => {
                    self.roll_back(&connected, &disconnected).await?;
                    return Err(match failure {
                        ConnectFailure::Rule(error) => {
                            self.invalidate(planned.block.hash, error, planned.source).await
                        }
                        ConnectFailure::Storage(e) => ConsensusManagerError::Storage(e),
                    });
                }
            }
        }

        let committed = self.write_state(|s| match Self::check_plan(s, &plan) {
            Ok(()) => Some(Self::commit(s, &plan)),
            Err(reason) => {
                debug!("Plan forking at {} went stale: {reason}", plan.fork);
                None
            }
        })?;
        let tip = match committed {
            Some(Ok(tip)) => tip,
            Some(Err(e)) => {
                return Err(ConsensusManagerError::RollbackFailed(anyhow!(
                    "chain index left part updated: {e}"
                )))
            }
            None => {
                self.roll_back(&connected, &disconnected).await?;
                return Ok(None);
            }
        };

        if !disconnected.is_empty() {
            info!(
                "Reorganised at {}: {} blocks disconnected, {} connected",
                plan.fork,
                disconnected.len(),
                connected.len()
            );
        }
        info!("Chain tip now {tip}");

        let events = &self.collaborators.events;
        for block in &disconnected {
            if let Err(e) = events.block_disconnected(*block).await {
                warn!("Failed to publish disconnection of {block}: {e:#}");
            }
        }
        for block in &connected {
            if let Err(e) = events.block_connected(*block).await {
                warn!("Failed to publish connection of {block}: {e:#}");
            }
        }
        Ok(Some(tip))
    }

    async fn connect_block(&self, planned: &PlannedBlock) -> Result<(), ConnectFailure> {
        let store = &self.collaborators.block_store;
        let coins = &self.collaborators.coin_view;

        let body = match &planned.body {
            Some(body) => body.clone(),
            None => store
                .get_block(&planned.block.hash)
                .await
                .map_err(ConnectFailure::Storage)?
                .map(Arc::new)
                .ok_or_else(|| {
                    ConnectFailure::Storage(anyhow!("body of {} missing from the block store", planned.block))
                })?,
        };

        if !planned.fully_validated {
            let outpoints: Vec<OutPoint> = body
                .transactions
                .iter()
                .filter(|tx| !tx.is_coinbase())
                .flat_map(|tx| tx.inputs.iter().map(|input| input.previous_output))
                .collect();
            let spent = coins.fetch_outputs(&outpoints).await.map_err(ConnectFailure::Storage)?;

            let mut ctx = ValidationContext::for_block(body.clone(), planned.block.height).with_peer(planned.source);
            ctx.median_time_past = planned.median_time_past;
            ctx.spent_outputs = spent;
            self.rules.run(Stage::Full, &mut ctx).map_err(ConnectFailure::Rule)?;
        }

        store
            .add_pending(planned.block, body.clone())
            .await
            .map_err(ConnectFailure::Storage)?;
        coins.apply(planned.block, &body).await.map_err(ConnectFailure::Storage)
    }

    /// Undo a partly executed plan: rewind what was connected and re-apply
    /// what was disconnected
    async fn roll_back(&self, connected: &[HashHeight], disconnected: &[HashHeight]) -> Result<(), ConsensusManagerError> {
        let coins = &self.collaborators.coin_view;
        for block in connected.iter().rev() {
            coins.rewind(*block).await.map_err(ConsensusManagerError::RollbackFailed)?;
        }
        for block in disconnected.iter().rev() {
            let body = self
                .collaborators
                .block_store
                .get_block(&block.hash)
                .await
                .map_err(ConsensusManagerError::RollbackFailed)?
                .ok_or_else(|| ConsensusManagerError::RollbackFailed(anyhow!("body of {block} missing")))?;
            coins.apply(*block, &body).await.map_err(ConsensusManagerError::RollbackFailed)?;
        }
        warn!(
            "Rolled back {} connected blocks, restored {}",
            connected.len(),
            disconnected.len()
        );
        Ok(())
    }

    /// Everything `commit` relies on, checked before it changes anything
    fn check_plan(s: &ChainState, plan: &ConnectPlan) -> Result<(), String> {
        if s.index.hash_at(plan.fork.height) != Some(plan.fork.hash) {
            return Err(format!("fork {} left the chain index", plan.fork));
        }
        let mut parent = plan.fork.hash;
        for planned in &plan.connect {
            if planned.header.previous_hash != parent {
                return Err(format!("{} does not extend {parent}", planned.block));
            }
            let Some(node) = s.tree.get(&planned.block.hash) else {
                return Err(format!("{} left the header tree", planned.block));
            };
            if node.state != ValidationState::FullyValidated
                && !node.state.can_advance_to(ValidationState::FullyValidated)
            {
                return Err(format!("{} is now {:?}", planned.block, node.state));
            }
            parent = planned.block.hash;
        }
        Ok(())
    }

    fn commit(s: &mut ChainState, plan: &ConnectPlan) -> Result<HashHeight, ConsensusManagerError> {
        s.index.truncate(plan.fork.height);
        for planned in &plan.connect {
            s.index.push(planned.header.clone())?;
            s.tree.set_state(&planned.block.hash, ValidationState::FullyValidated)?;
            s.tree.take_block(&planned.block.hash);
        }
        let tip = s.index.tip();
        s.tree.set_consensus_tip(&tip.hash)?;
        s.tree.prune();
        Ok(tip)
    }

    // ── Persistence and shutdown ─────────────────────────────────

    /// Persist connected bodies, then the changed part of the chain
    pub async fn flush(&self) -> Result<(), ConsensusManagerError> {
        let _commit = self.commit.lock().await;
        self.collaborators.block_store.flush().await.map_err(ConsensusManagerError::Storage)?;

        let Some(update) = self.write_state(|s| s.index.take_update())? else {
            return Ok(());
        };
        let tip = update.tip;
        if let Err(e) = self.collaborators.chain_repository.save(update.clone()).await {
            self.write_state(|s| s.index.restore_update(&update))?;
            return Err(ConsensusManagerError::Storage(e));
        }
        debug!("Chain persisted up to {tip}");
        Ok(())
    }

    /// Refuse further input and write out everything pending
    pub async fn shutdown(&self) -> Result<(), ConsensusManagerError> {
        self.shutting_down.send_replace(true);
        self.flush().await?;
        info!("Consensus manager stopped");
        Ok(())
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutting_down.borrow()
    }

    /// Resolves once the manager stops accepting input
    pub fn halted(&self) -> watch::Receiver<bool> {
        self.shutting_down.subscribe()
    }

    fn halt(&self, cause: &ConsensusManagerError) {
        error!("Stopping consensus manager: {cause}");
        self.shutting_down.send_replace(true);
    }

    /// Flush on every interval tick; on shutdown flush one last time. A
    /// failed flush halts the manager, leaving the final flush as the one
    /// retry.
    pub fn spawn_flush_loop(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(manager.config.flush_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = manager.flush().await {
                            manager.halt(&e);
                            break;
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            if let Err(e) = manager.shutdown().await {
                error!("Final flush failed: {e:#}");
            }
        })
    }

    pub fn flush_interval(&self) -> Duration {
        self.config.flush_interval()
    }
}
