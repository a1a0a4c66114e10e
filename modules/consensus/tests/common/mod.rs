//! Shared harness for consensus manager integration tests.
//!
//! Wires a `ConsensusManager` to in-memory collaborators on regtest so a
//! test can play the part of the peers: present headers, hand over bodies
//! and inspect what the manager asked for, banned and announced.

#![allow(dead_code)]

use std::sync::Arc;

use tessera_common::{interfaces::JobId, network::NetworkParams, BlockHash, PeerId};
use tessera_module_block_puller::DownloadedBlock;
use tessera_module_consensus::{
    chained_header::ValidationState,
    coin_view::InMemoryCoinView,
    configuration::ConsensusConfig,
    consensus_manager::{Collaborators, ConsensusManager},
    manager_error::ConsensusManagerError,
};
use tessera_test_utils::{
    ChainBuilder, InMemoryBlockStore, InMemoryChainRepository, RecordingBanning,
    RecordingDownloader, RecordingEvents, RecordingTransport,
};

pub const PEER_A: PeerId = PeerId(1);
pub const PEER_B: PeerId = PeerId(2);

pub fn test_config() -> ConsensusConfig {
    ConsensusConfig {
        network: "regtest".to_string(),
        max_reorg_length: 20,
        download_batch_size: 4,
        max_blocks_in_flight: 64,
        partial_validation_workers: 2,
        ..ConsensusConfig::default()
    }
}

pub struct Harness {
    pub params: Arc<NetworkParams>,
    pub repository: Arc<InMemoryChainRepository>,
    pub block_store: Arc<InMemoryBlockStore>,
    pub coin_view: Arc<InMemoryCoinView>,
    pub banning: Arc<RecordingBanning>,
    pub events: Arc<RecordingEvents>,
    pub downloader: Arc<RecordingDownloader>,
    pub transport: Arc<RecordingTransport>,
    pub manager: Arc<ConsensusManager>,
}

impl Harness {
    pub async fn new() -> Self {
        let genesis = NetworkParams::regtest().genesis;
        Self::with_repository(InMemoryChainRepository::with_chain(vec![genesis])).await
    }

    pub async fn with_config(config: ConsensusConfig) -> Self {
        let genesis = NetworkParams::regtest().genesis;
        Self::build(config, InMemoryChainRepository::with_chain(vec![genesis])).await
    }

    /// Start from a persisted chain; the coin view is always at genesis
    pub async fn with_repository(repository: InMemoryChainRepository) -> Self {
        Self::build(test_config(), repository).await
    }

    async fn build(config: ConsensusConfig, repository: InMemoryChainRepository) -> Self {
        let params = Arc::new(NetworkParams::regtest());
        let repository = Arc::new(repository);
        let block_store = Arc::new(InMemoryBlockStore::default());
        let coin_view = Arc::new(InMemoryCoinView::new(
            params.genesis_tip(),
            config.max_reorg_length as usize,
        ));
        let banning = Arc::new(RecordingBanning::default());
        let events = Arc::new(RecordingEvents::default());
        let downloader = Arc::new(RecordingDownloader::default());
        let transport = Arc::new(RecordingTransport::default());

        let collaborators = Collaborators {
            chain_repository: repository.clone(),
            block_store: block_store.clone(),
            coin_view: coin_view.clone(),
            banning: banning.clone(),
            events: events.clone(),
            downloader: downloader.clone(),
            transport: transport.clone(),
        };
        let manager = Arc::new(ConsensusManager::new(config, params.clone(), collaborators));
        manager.initialize().await.unwrap();

        Self {
            params,
            repository,
            block_store,
            coin_view,
            banning,
            events,
            downloader,
            transport,
            manager,
        }
    }

    pub fn chain(&self) -> ChainBuilder {
        ChainBuilder::new(&self.params)
    }

    /// Hand the manager the body built at `height` of `chain`
    pub async fn deliver(
        &self,
        peer: PeerId,
        chain: &ChainBuilder,
        height: u64,
    ) -> Result<(), ConsensusManagerError> {
        self.manager
            .block_downloaded(DownloadedBlock {
                peer,
                job: JobId(0),
                height,
                block: chain.block(height),
            })
            .await
    }

    /// Present the headers of `chain` in `range`, then deliver their bodies
    /// in ascending order
    pub async fn sync(&self, peer: PeerId, chain: &ChainBuilder, range: std::ops::RangeInclusive<u64>) {
        self.manager.headers_presented(peer, chain.headers(range.clone())).await.unwrap();
        for height in range {
            self.deliver(peer, chain, height).await.unwrap();
        }
    }

    pub fn state_of(&self, hash: &BlockHash) -> Option<ValidationState> {
        self.manager.header_state(hash).unwrap()
    }
}
