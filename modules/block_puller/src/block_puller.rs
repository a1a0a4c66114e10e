//! Tessera block puller
//! Turns runs of headers that need bodies into per-peer block requests,
//! reassigns stalled requests and ranks peers by how well they serve us

pub mod configuration;
mod download_job;
mod peer_performance;

pub use configuration::PullerConfig;
pub use download_job::DownloadJob;
pub use peer_performance::PeerPerformance;

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use futures::future::join_all;
use tessera_common::{
    interfaces::{BlockDownloader, JobId, PeerTransport},
    Block, BlockHash, HashHeight, PeerId,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{interval, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum PullerError {
    #[error("download job has no headers")]
    EmptyJob,

    #[error("download job is not contiguous: height {next} follows {after}")]
    NonContiguousJob { after: u64, next: u64 },

    #[error("block puller is shut down")]
    ShuttingDown,
}

/// A body that arrived from the peer it was assigned to
#[derive(Debug, Clone)]
pub struct DownloadedBlock {
    pub peer: PeerId,
    pub job: JobId,
    pub height: u64,
    pub block: Arc<Block>,
}

#[derive(Debug, Clone)]
pub enum PullerEvent {
    BlockDownloaded(DownloadedBlock),
    /// Every eligible peer failed to deliver this body
    DownloadFailed { job: JobId, hash: BlockHash },
}

#[derive(Debug)]
struct Assignment {
    peer: PeerId,
    job: JobId,
    height: u64,
    /// Peers that already stalled on this body
    excluded: HashSet<PeerId>,
    requested_at: Instant,
    deadline: Instant,
}

#[derive(Debug)]
struct Pending {
    job: JobId,
    header: HashHeight,
    excluded: HashSet<PeerId>,
}

enum Selection {
    Peer(PeerId),
    /// Nobody can take it right now; keep it queued
    Wait,
    /// Everybody able to serve it has already failed
    Exhausted,
}

/// Work produced under the lock, carried out after it is released
#[derive(Default)]
struct Dispatch {
    requests: BTreeMap<PeerId, Vec<BlockHash>>,
    failed: Vec<(JobId, BlockHash)>,
}

#[derive(Default)]
struct PullerState {
    next_job_id: u64,
    peers: BTreeMap<PeerId, PeerPerformance>,
    /// At most one active assignment per body
    assignments: HashMap<BlockHash, Assignment>,
    pending: VecDeque<Pending>,
    jobs: HashMap<JobId, DownloadJob>,
    shut_down: bool,
}

impl PullerState {
    fn job_tracking(&self, hash: &BlockHash) -> Option<JobId> {
        self.assignments
            .get(hash)
            .map(|a| a.job)
            .or_else(|| self.pending.iter().find(|p| p.header.hash == *hash).map(|p| p.job))
    }

    fn finish(&mut self, job: JobId, hash: &BlockHash) {
        if let Some(entry) = self.jobs.get_mut(&job) {
            if entry.complete(hash) {
                self.jobs.remove(&job);
            }
        }
    }

    fn select_peer(&self, height: u64, excluded: &HashSet<PeerId>, max_in_flight: usize) -> Selection {
        let mut any_untried = false;
        let mut best: Option<(PeerId, f64)> = None;
        for (id, perf) in &self.peers {
            if !perf.eligible || perf.best_height < height || excluded.contains(id) {
                continue;
            }
            any_untried = true;
            if !perf.can_serve(height, max_in_flight) {
                continue;
            }
            let score = perf.score();
            // Strictly greater keeps the lowest id on ties
            if best.is_none_or(|(_, s)| score > s) {
                best = Some((*id, score));
            }
        }
        match best {
            Some((peer, _)) => Selection::Peer(peer),
            None if !any_untried && !excluded.is_empty() => Selection::Exhausted,
            None => Selection::Wait,
        }
    }

    fn dispatch(&mut self, config: &PullerConfig, now: Instant) -> Dispatch {
        let mut out = Dispatch::default();
        let mut waiting = VecDeque::new();
        while let Some(item) = self.pending.pop_front() {
            let hash = item.header.hash;
            if !self.jobs.get(&item.job).is_some_and(|j| j.is_outstanding(&hash)) {
                continue;
            }
            match self.select_peer(item.header.height, &item.excluded, config.max_in_flight_per_peer)
            {
                Selection::Peer(peer) => {
                    if let Some(perf) = self.peers.get_mut(&peer) {
                        perf.in_flight += 1;
                    }
                    out.requests.entry(peer).or_default().push(hash);
                    self.assignments.insert(
                        hash,
                        Assignment {
                            peer,
                            job: item.job,
                            height: item.header.height,
                            excluded: item.excluded,
                            requested_at: now,
                            deadline: now + config.stall_timeout(),
                        },
                    );
                }
                Selection::Wait => waiting.push_back(item),
                Selection::Exhausted => {
                    self.finish(item.job, &hash);
                    out.failed.push((item.job, hash));
                }
            }
        }
        self.pending = waiting;
        out
    }

    /// Put an assignment back at the head of the queue
    fn requeue(&mut self, hash: BlockHash, assignment: Assignment) {
        self.pending.push_front(Pending {
            job: assignment.job,
            header: HashHeight::new(hash, assignment.height),
            excluded: assignment.excluded,
        });
    }

    fn remove_peer(&mut self, peer: PeerId) -> usize {
        self.peers.remove(&peer);
        let orphaned: Vec<BlockHash> = self
            .assignments
            .iter()
            .filter(|(_, a)| a.peer == peer)
            .map(|(hash, _)| *hash)
            .collect();
        let mut ordered: Vec<(BlockHash, Assignment)> = orphaned
            .into_iter()
            .filter_map(|hash| self.assignments.remove(&hash).map(|a| (hash, a)))
            .collect();
        // Highest first so the lowest ends up at the head of the queue
        ordered.sort_by_key(|(_, a)| std::cmp::Reverse(a.height));
        let count = ordered.len();
        for (hash, assignment) in ordered {
            self.requeue(hash, assignment);
        }
        count
    }
}

/// Download scheduler shared between the consensus core and the peer layer
pub struct BlockPuller {
    config: PullerConfig,
    transport: Arc<dyn PeerTransport>,
    state: Mutex<PullerState>,
    events: mpsc::Sender<PullerEvent>,
}

impl BlockPuller {
    pub fn new(
        config: PullerConfig,
        transport: Arc<dyn PeerTransport>,
    ) -> (Arc<Self>, mpsc::Receiver<PullerEvent>) {
        let (events, receiver) = mpsc::channel(config.event_queue_size.max(1));
        let puller = Arc::new(Self {
            config,
            transport,
            state: Mutex::new(PullerState::default()),
            events,
        });
        (puller, receiver)
    }

    fn lock(&self) -> MutexGuard<'_, PullerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a peer or raise its advertised height
    pub fn peer_connected(&self, peer: PeerId, best_height: u64) {
        let mut state = self.lock();
        let perf = state.peers.entry(peer).or_insert_with(|| {
            debug!("Peer {peer} available for downloads at height {best_height}");
            PeerPerformance::new(best_height)
        });
        perf.best_height = perf.best_height.max(best_height);
    }

    /// Allocate a job for a contiguous ascending run of headers and hand its
    /// bodies to the best available peers. Headers already being fetched are
    /// left with their current assignment.
    pub async fn request_download(&self, headers: Vec<HashHeight>) -> Result<JobId, PullerError> {
        let dispatch = {
            let mut state = self.lock();
            if state.shut_down {
                return Err(PullerError::ShuttingDown);
            }

            let id = JobId(state.next_job_id);
            let mut job = DownloadJob::new(id, headers)?;

            let mut existing = None;
            for header in &job.headers {
                if let Some(tracking) = state.job_tracking(&header.hash) {
                    existing.get_or_insert(tracking);
                }
            }
            let fresh: Vec<HashHeight> = job
                .headers
                .iter()
                .filter(|h| state.job_tracking(&h.hash).is_none())
                .copied()
                .collect();
            if fresh.is_empty() {
                // Everything is already on its way
                return Ok(existing.unwrap_or(id));
            }
            let tracked: Vec<BlockHash> = job
                .headers
                .iter()
                .filter(|h| !fresh.contains(h))
                .map(|h| h.hash)
                .collect();
            for hash in &tracked {
                job.complete(hash);
            }

            state.next_job_id += 1;
            debug!(
                "Download {id}: {} bodies from height {}",
                fresh.len(),
                fresh[0].height
            );
            for header in fresh {
                state.pending.push_back(Pending {
                    job: id,
                    header,
                    excluded: HashSet::new(),
                });
            }
            state.jobs.insert(id, job);
            let dispatch = state.dispatch(&self.config, Instant::now());
            (id, dispatch)
        };

        let (id, dispatch) = dispatch;
        self.complete_dispatch(dispatch).await;
        Ok(id)
    }

    /// Match a delivered body against the assignment table. Unrequested,
    /// duplicate and wrong-peer deliveries are dropped and return false.
    pub async fn on_block_received(&self, peer: PeerId, block: Block) -> bool {
        let hash = block.hash();
        let now = Instant::now();
        let (downloaded, dispatch) = {
            let mut state = self.lock();
            match state.assignments.get(&hash) {
                Some(assignment) if assignment.peer == peer => {}
                Some(assignment) => {
                    debug!("Discarding block {hash} from {peer}, assigned to {}", assignment.peer);
                    return false;
                }
                None => {
                    debug!("Discarding unrequested block {hash} from {peer}");
                    return false;
                }
            }
            let Some(assignment) = state.assignments.remove(&hash) else {
                return false;
            };
            if let Some(perf) = state.peers.get_mut(&peer) {
                perf.record_delivery(now.saturating_duration_since(assignment.requested_at));
            }
            state.finish(assignment.job, &hash);
            let downloaded = DownloadedBlock {
                peer,
                job: assignment.job,
                height: assignment.height,
                block: Arc::new(block),
            };
            (downloaded, state.dispatch(&self.config, now))
        };

        self.events
            .send(PullerEvent::BlockDownloaded(downloaded))
            .await
            .unwrap_or_else(|e| error!("Failed to forward downloaded block: {e}"));
        self.complete_dispatch(dispatch).await;
        true
    }

    /// Cancel assignments whose deadline has passed, penalise the peers
    /// involved and hand the bodies to someone else. Returns the number of
    /// stalled assignments.
    pub async fn stall_sweep(&self, now: Instant) -> usize {
        let (stalled, dispatch) = {
            let mut state = self.lock();
            let expired: Vec<BlockHash> = state
                .assignments
                .iter()
                .filter(|(_, a)| a.deadline <= now)
                .map(|(hash, _)| *hash)
                .collect();
            let mut stalled: Vec<(BlockHash, Assignment)> = expired
                .into_iter()
                .filter_map(|hash| state.assignments.remove(&hash).map(|a| (hash, a)))
                .collect();
            stalled.sort_by_key(|(_, a)| std::cmp::Reverse(a.height));

            let count = stalled.len();
            for (hash, mut assignment) in stalled {
                let peer = assignment.peer;
                warn!("Peer {peer} stalled on block {hash} at height {}", assignment.height);
                if let Some(perf) = state.peers.get_mut(&peer) {
                    if perf.penalise(self.config.penalty_limit) {
                        warn!("Peer {peer} removed from download rotation after {} stalls", perf.penalties);
                    }
                }
                assignment.excluded.insert(peer);
                state.requeue(hash, assignment);
            }
            (count, state.dispatch(&self.config, now))
        };

        self.complete_dispatch(dispatch).await;
        stalled
    }

    /// Requeue everything the peer had in flight and forget it
    pub async fn peer_disconnected(&self, peer: PeerId) {
        let dispatch = {
            let mut state = self.lock();
            let requeued = state.remove_peer(peer);
            if requeued > 0 {
                info!("Peer {peer} disconnected with {requeued} bodies in flight");
            }
            state.dispatch(&self.config, Instant::now())
        };
        self.complete_dispatch(dispatch).await;
    }

    /// Drop assignments and queued requests for these bodies
    pub async fn cancel(&self, hashes: &[BlockHash]) {
        let dispatch = {
            let mut state = self.lock();
            for hash in hashes {
                if let Some(assignment) = state.assignments.remove(hash) {
                    if let Some(perf) = state.peers.get_mut(&assignment.peer) {
                        perf.in_flight = perf.in_flight.saturating_sub(1);
                    }
                    state.finish(assignment.job, hash);
                }
                if let Some(position) = state.pending.iter().position(|p| p.header.hash == *hash) {
                    if let Some(pending) = state.pending.remove(position) {
                        state.finish(pending.job, hash);
                    }
                }
            }
            state.dispatch(&self.config, Instant::now())
        };
        self.complete_dispatch(dispatch).await;
    }

    /// Give queued bodies another chance at a peer
    pub async fn pump(&self) {
        let dispatch = self.lock().dispatch(&self.config, Instant::now());
        self.complete_dispatch(dispatch).await;
    }

    /// Abandon all outstanding work and refuse new jobs
    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.shut_down = true;
        state.assignments.clear();
        state.pending.clear();
        state.jobs.clear();
        for perf in state.peers.values_mut() {
            perf.in_flight = 0;
        }
        info!("Block puller shut down");
    }

    /// Run the stall sweep periodically until `shutdown` flips to true
    pub fn spawn_stall_monitor(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let puller = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(puller.config.stall_sweep_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        puller.stall_sweep(Instant::now()).await;
                        puller.pump().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            puller.shutdown();
                            return;
                        }
                    }
                }
            }
        })
    }

    /// Peer currently responsible for a body
    pub fn assigned_peer(&self, hash: &BlockHash) -> Option<PeerId> {
        self.lock().assignments.get(hash).map(|a| a.peer)
    }

    pub fn peer_performance(&self, peer: PeerId) -> Option<PeerPerformance> {
        self.lock().peers.get(&peer).cloned()
    }

    pub fn queued(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn in_flight(&self) -> usize {
        self.lock().assignments.len()
    }

    pub fn active_jobs(&self) -> usize {
        self.lock().jobs.len()
    }

    async fn complete_dispatch(&self, mut dispatch: Dispatch) {
        loop {
            for (job, hash) in dispatch.failed.drain(..) {
                warn!("No peer left to serve block {hash} for {job}");
                self.events
                    .send(PullerEvent::DownloadFailed { job, hash })
                    .await
                    .unwrap_or_else(|e| error!("Failed to report download failure: {e}"));
            }
            if dispatch.requests.is_empty() {
                return;
            }

            let requests = std::mem::take(&mut dispatch.requests);
            let results = join_all(requests.into_iter().map(|(peer, hashes)| {
                let transport = self.transport.clone();
                async move {
                    debug!("Requesting {} bodies from {peer}", hashes.len());
                    (peer, transport.request_blocks(peer, hashes).await)
                }
            }))
            .await;

            let failed: Vec<PeerId> = results
                .into_iter()
                .filter_map(|(peer, result)| {
                    result.err().map(|e| {
                        warn!("Could not request blocks from {peer}: {e:#}");
                        peer
                    })
                })
                .collect();
            if failed.is_empty() {
                return;
            }

            // Unreachable peers are treated as disconnected
            dispatch = {
                let mut state = self.lock();
                for peer in failed {
                    state.remove_peer(peer);
                }
                state.dispatch(&self.config, Instant::now())
            };
        }
    }
}

#[async_trait]
impl BlockDownloader for BlockPuller {
    async fn request_blocks_download(&self, headers: Vec<HashHeight>) -> anyhow::Result<JobId> {
        Ok(self.request_download(headers).await?)
    }

    async fn cancel_downloads(&self, hashes: &[BlockHash]) {
        self.cancel(hashes).await;
    }

    fn update_peer_tip(&self, peer: PeerId, height: u64) {
        self.peer_connected(peer, height);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use tessera_common::network::NetworkParams;
    use tessera_test_utils::{ChainBuilder, RecordingTransport};

    fn setup(config: PullerConfig) -> (Arc<BlockPuller>, mpsc::Receiver<PullerEvent>, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let (puller, events) = BlockPuller::new(config, transport.clone());
        (puller, events, transport)
    }

    fn chain(length: u64) -> ChainBuilder {
        let mut builder = ChainBuilder::new(&NetworkParams::regtest());
        builder.mine_n(length);
        builder
    }

    fn after_timeout(config: &PullerConfig) -> Instant {
        Instant::now() + config.stall_timeout() + Duration::from_millis(1)
    }

    // ── Job allocation ────────────────────────────────────────────

    #[tokio::test]
    async fn job_ids_increase_and_bodies_are_assigned_once() {
        let (puller, _events, transport) = setup(PullerConfig::default());
        let chain = chain(6);
        puller.peer_connected(PeerId(1), 6);

        let first = puller.request_download(chain.hash_heights(1..=3)).await.unwrap();
        let second = puller.request_download(chain.hash_heights(4..=6)).await.unwrap();
        assert!(second > first);
        assert_eq!(puller.in_flight(), 6);
        assert_eq!(transport.requested_hashes(PeerId(1)).len(), 6);
    }

    #[tokio::test]
    async fn rerequesting_is_idempotent() {
        let (puller, _events, transport) = setup(PullerConfig::default());
        let chain = chain(3);
        puller.peer_connected(PeerId(1), 3);

        let first = puller.request_download(chain.hash_heights(1..=3)).await.unwrap();
        let again = puller.request_download(chain.hash_heights(1..=3)).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(puller.in_flight(), 3);
        assert_eq!(puller.active_jobs(), 1);
        assert_eq!(transport.requested_hashes(PeerId(1)).len(), 3);
    }

    #[tokio::test]
    async fn overlapping_job_only_requests_untracked_bodies() {
        let (puller, _events, transport) = setup(PullerConfig::default());
        let chain = chain(5);
        puller.peer_connected(PeerId(1), 5);

        let first = puller.request_download(chain.hash_heights(1..=3)).await.unwrap();
        let second = puller.request_download(chain.hash_heights(2..=5)).await.unwrap();
        assert!(second > first);
        assert_eq!(puller.in_flight(), 5);
        assert_eq!(puller.active_jobs(), 2);
        assert_eq!(transport.requested_hashes(PeerId(1)).len(), 5);
    }

    #[tokio::test]
    async fn non_contiguous_job_is_rejected() {
        let (puller, _events, _transport) = setup(PullerConfig::default());
        let chain = chain(4);
        let mut headers = chain.hash_heights(1..=2);
        headers.push(chain.hash_height(4));
        assert!(matches!(
            puller.request_download(headers).await,
            Err(PullerError::NonContiguousJob { after: 2, next: 4 })
        ));
    }

    #[tokio::test]
    async fn headers_wait_for_a_peer_with_enough_height() {
        let (puller, _events, transport) = setup(PullerConfig::default());
        let chain = chain(4);
        puller.peer_connected(PeerId(1), 2);

        puller.request_download(chain.hash_heights(1..=4)).await.unwrap();
        assert_eq!(puller.in_flight(), 2);
        assert_eq!(puller.queued(), 2);

        puller.peer_connected(PeerId(2), 4);
        puller.pump().await;
        assert_eq!(puller.queued(), 0);
        assert_eq!(puller.assigned_peer(&chain.hash_height(4).hash), Some(PeerId(2)));
        assert_eq!(transport.requested_hashes(PeerId(2)).len(), 2);
    }

    #[tokio::test]
    async fn work_spreads_by_load() {
        let config = PullerConfig::default();
        let (puller, _events, transport) = setup(config);
        let chain = chain(4);
        puller.peer_connected(PeerId(1), 4);
        puller.peer_connected(PeerId(2), 4);

        puller.request_download(chain.hash_heights(1..=4)).await.unwrap();
        assert_eq!(transport.requested_hashes(PeerId(1)).len(), 2);
        assert_eq!(transport.requested_hashes(PeerId(2)).len(), 2);
    }

    #[tokio::test]
    async fn in_flight_cap_is_respected() {
        let config = PullerConfig {
            max_in_flight_per_peer: 2,
            ..PullerConfig::default()
        };
        let (puller, _events, _transport) = setup(config);
        let chain = chain(5);
        puller.peer_connected(PeerId(1), 5);

        puller.request_download(chain.hash_heights(1..=5)).await.unwrap();
        assert_eq!(puller.in_flight(), 2);
        assert_eq!(puller.queued(), 3);
    }

    // ── Delivery ──────────────────────────────────────────────────

    #[tokio::test]
    async fn matched_block_is_forwarded_and_cleared() {
        let (puller, mut events, _transport) = setup(PullerConfig::default());
        let chain = chain(2);
        puller.peer_connected(PeerId(1), 2);
        let job = puller.request_download(chain.hash_heights(1..=2)).await.unwrap();

        assert!(puller.on_block_received(PeerId(1), (*chain.block(1)).clone()).await);
        match events.recv().await.unwrap() {
            PullerEvent::BlockDownloaded(downloaded) => {
                assert_eq!(downloaded.peer, PeerId(1));
                assert_eq!(downloaded.job, job);
                assert_eq!(downloaded.height, 1);
                assert_eq!(downloaded.block.hash(), chain.hash_height(1).hash);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(puller.assigned_peer(&chain.hash_height(1).hash), None);
        assert_eq!(puller.peer_performance(PeerId(1)).unwrap().in_flight, 1);
        assert!(puller.peer_performance(PeerId(1)).unwrap().avg_latency.is_some());
    }

    #[tokio::test]
    async fn unmatched_duplicate_and_wrong_peer_blocks_are_discarded() {
        let (puller, mut events, _transport) = setup(PullerConfig::default());
        let chain = chain(2);
        puller.peer_connected(PeerId(1), 2);
        puller.peer_connected(PeerId(2), 2);
        puller.request_download(chain.hash_heights(1..=1)).await.unwrap();
        let owner = puller.assigned_peer(&chain.hash_height(1).hash).unwrap();
        let other = if owner == PeerId(1) { PeerId(2) } else { PeerId(1) };

        // Never requested
        assert!(!puller.on_block_received(owner, (*chain.block(2)).clone()).await);
        // Wrong peer
        assert!(!puller.on_block_received(other, (*chain.block(1)).clone()).await);
        // Right peer, then duplicate
        assert!(puller.on_block_received(owner, (*chain.block(1)).clone()).await);
        assert!(!puller.on_block_received(owner, (*chain.block(1)).clone()).await);

        assert!(matches!(events.recv().await, Some(PullerEvent::BlockDownloaded(_))));
        assert!(events.try_recv().is_err());
        assert_eq!(puller.active_jobs(), 0);
    }

    // ── Stalls ────────────────────────────────────────────────────

    #[tokio::test]
    async fn stalled_body_moves_to_exactly_one_other_peer() {
        let config = PullerConfig::default();
        let (puller, _events, transport) = setup(config.clone());
        let chain = chain(7);
        puller.peer_connected(PeerId(1), 7);
        puller.request_download(chain.hash_heights(7..=7)).await.unwrap();
        assert_eq!(puller.assigned_peer(&chain.hash_height(7).hash), Some(PeerId(1)));

        puller.peer_connected(PeerId(2), 7);
        puller.peer_connected(PeerId(3), 7);
        assert_eq!(puller.stall_sweep(after_timeout(&config)).await, 1);

        let new_owner = puller.assigned_peer(&chain.hash_height(7).hash).unwrap();
        assert_ne!(new_owner, PeerId(1));
        assert_eq!(puller.in_flight(), 1);
        let asked: usize = [PeerId(2), PeerId(3)]
            .iter()
            .map(|p| transport.requested_hashes(*p).len())
            .sum();
        assert_eq!(asked, 1);
        assert_eq!(puller.peer_performance(PeerId(1)).unwrap().penalties, 1);

        // A late delivery from the staller is ignored
        assert!(!puller.on_block_received(PeerId(1), (*chain.block(7)).clone()).await);
        assert_eq!(puller.assigned_peer(&chain.hash_height(7).hash), Some(new_owner));
    }

    #[tokio::test]
    async fn sweep_before_deadline_does_nothing() {
        let (puller, _events, _transport) = setup(PullerConfig::default());
        let chain = chain(1);
        puller.peer_connected(PeerId(1), 1);
        puller.request_download(chain.hash_heights(1..=1)).await.unwrap();
        assert_eq!(puller.stall_sweep(Instant::now()).await, 0);
        assert_eq!(puller.assigned_peer(&chain.hash_height(1).hash), Some(PeerId(1)));
    }

    #[tokio::test]
    async fn repeated_stalls_remove_peer_from_rotation() {
        let config = PullerConfig {
            penalty_limit: 2,
            ..PullerConfig::default()
        };
        let (puller, _events, _transport) = setup(config.clone());
        let chain = chain(2);
        puller.peer_connected(PeerId(1), 2);
        puller.request_download(chain.hash_heights(1..=2)).await.unwrap();

        puller.stall_sweep(after_timeout(&config)).await;
        let perf = puller.peer_performance(PeerId(1)).unwrap();
        assert_eq!(perf.penalties, 2);
        assert!(!perf.eligible);
    }

    #[tokio::test]
    async fn exhausted_body_reports_failure() {
        let config = PullerConfig::default();
        let (puller, mut events, _transport) = setup(config.clone());
        let chain = chain(1);
        puller.peer_connected(PeerId(1), 1);
        let job = puller.request_download(chain.hash_heights(1..=1)).await.unwrap();

        puller.stall_sweep(after_timeout(&config)).await;
        match events.recv().await.unwrap() {
            PullerEvent::DownloadFailed { job: failed_job, hash } => {
                assert_eq!(failed_job, job);
                assert_eq!(hash, chain.hash_height(1).hash);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(puller.active_jobs(), 0);
        assert_eq!(puller.queued(), 0);
    }

    // ── Disconnects and cancellation ──────────────────────────────

    #[tokio::test]
    async fn disconnect_requeues_in_flight_bodies() {
        let (puller, _events, transport) = setup(PullerConfig::default());
        let chain = chain(3);
        puller.peer_connected(PeerId(1), 3);
        puller.request_download(chain.hash_heights(1..=3)).await.unwrap();

        puller.peer_connected(PeerId(2), 3);
        puller.peer_disconnected(PeerId(1)).await;
        assert_eq!(puller.in_flight(), 3);
        for height in 1..=3 {
            assert_eq!(puller.assigned_peer(&chain.hash_height(height).hash), Some(PeerId(2)));
        }
        assert_eq!(transport.requested_hashes(PeerId(2)).len(), 3);
        assert!(puller.peer_performance(PeerId(1)).is_none());
    }

    #[tokio::test]
    async fn disconnect_without_replacement_keeps_bodies_queued() {
        let (puller, mut events, _transport) = setup(PullerConfig::default());
        let chain = chain(2);
        puller.peer_connected(PeerId(1), 2);
        puller.request_download(chain.hash_heights(1..=2)).await.unwrap();

        puller.peer_disconnected(PeerId(1)).await;
        assert_eq!(puller.queued(), 2);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn transport_failure_counts_as_disconnect() {
        let (puller, _events, transport) = setup(PullerConfig::default());
        let chain = chain(2);
        transport.fail_peer(PeerId(1));
        puller.peer_connected(PeerId(1), 2);
        puller.peer_connected(PeerId(2), 2);

        puller.request_download(chain.hash_heights(1..=2)).await.unwrap();
        assert!(puller.peer_performance(PeerId(1)).is_none());
        assert_eq!(puller.assigned_peer(&chain.hash_height(1).hash), Some(PeerId(2)));
        assert_eq!(puller.assigned_peer(&chain.hash_height(2).hash), Some(PeerId(2)));
    }

    #[tokio::test]
    async fn cancel_drops_assignments_and_queue() {
        let config = PullerConfig {
            max_in_flight_per_peer: 1,
            ..PullerConfig::default()
        };
        let (puller, _events, _transport) = setup(config);
        let chain = chain(3);
        puller.peer_connected(PeerId(1), 3);
        puller.request_download(chain.hash_heights(1..=3)).await.unwrap();
        assert_eq!(puller.queued(), 2);

        let hashes: Vec<BlockHash> = chain.hash_heights(1..=3).iter().map(|h| h.hash).collect();
        puller.cancel(&hashes).await;
        assert_eq!(puller.in_flight(), 0);
        assert_eq!(puller.queued(), 0);
        assert_eq!(puller.active_jobs(), 0);
        assert_eq!(puller.peer_performance(PeerId(1)).unwrap().in_flight, 0);
    }

    #[tokio::test]
    async fn shutdown_refuses_new_work() {
        let (puller, _events, _transport) = setup(PullerConfig::default());
        let chain = chain(1);
        puller.peer_connected(PeerId(1), 1);
        puller.request_download(chain.hash_heights(1..=1)).await.unwrap();

        puller.shutdown();
        assert_eq!(puller.in_flight(), 0);
        assert!(matches!(
            puller.request_download(chain.hash_heights(1..=1)).await,
            Err(PullerError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn stall_monitor_stops_on_shutdown_signal() {
        let (puller, _events, _transport) = setup(PullerConfig::default());
        let (tx, rx) = watch::channel(false);
        let handle = puller.spawn_stall_monitor(rx);
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(matches!(
            puller.request_download(chain(1).hash_heights(1..=1)).await,
            Err(PullerError::ShuttingDown)
        ));
    }
}
