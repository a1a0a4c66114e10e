//! Tessera consensus module for Caryatid
//! Follows the valid chain with the most work, built from the headers and
//! blocks peers offer

pub mod bus;
pub mod chain_index;
pub mod chained_header;
pub mod chained_header_tree;
pub mod coin_view;
pub mod configuration;
pub mod consensus_manager;
pub mod manager_error;
pub mod rules;
pub mod tree_error;
pub mod validation_pipeline;

use std::sync::Arc;

use anyhow::Result;
use caryatid_sdk::{module, Context};
use config::Config;
use tessera_common::{messages::Message, validation::ErrorClass, Block, PeerId};
use tessera_module_block_puller::{BlockPuller, PullerConfig, PullerEvent};
use tessera_module_chain_store::{ChainStore, StoreConfig};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, info_span, warn, Instrument};

use bus::{BusBanning, BusEvents, BusTransport};
use coin_view::InMemoryCoinView;
use configuration::ConsensusConfig;
use consensus_manager::{Collaborators, ConsensusManager};
use manager_error::ConsensusManagerError;

/// Consensus module
/// Parameterised by the outer message enum used on the bus
#[module(
    message_type(Message),
    name = "consensus",
    description = "Header tree, block validation and chain selection"
)]
pub struct Consensus;

impl Consensus {
    /// Main init function
    pub async fn init(&self, context: Arc<Context<Message>>, config: Arc<Config>) -> Result<()> {
        let cfg = ConsensusConfig::try_load(&config)?;
        let puller_cfg = PullerConfig::try_load(&config)?;
        let store_cfg = StoreConfig::try_load(&config)?;
        let params = Arc::new(cfg.network_params()?);
        info!(
            "Following {} with max reorg {} and tie-break {:?}",
            params.name, cfg.max_reorg_length, cfg.tie_break
        );

        let store = ChainStore::open(&store_cfg)?;
        let transport = Arc::new(BusTransport::new(context.clone(), &cfg.publish_requests_topic));
        let (puller, mut puller_events) = BlockPuller::new(puller_cfg, transport.clone());
        info!("Requesting blocks and headers on '{}'", cfg.publish_requests_topic);

        let collaborators = Collaborators {
            chain_repository: store.chain_repository(),
            block_store: store.block_store(),
            coin_view: Arc::new(InMemoryCoinView::new(
                params.genesis_tip(),
                cfg.max_reorg_length as usize,
            )),
            banning: Arc::new(BusBanning::new(context.clone(), &cfg.publish_bans_topic)),
            events: Arc::new(BusEvents::new(context.clone(), &cfg.publish_chain_topic)),
            downloader: puller.clone(),
            transport,
        };
        let manager = Arc::new(ConsensusManager::new(cfg.clone(), params, collaborators));
        manager.initialize().await?;
        info!("Publishing chain events on '{}'", cfg.publish_chain_topic);

        info!("Creating headers subscriber on '{}'", cfg.subscribe_headers_topic);
        let mut headers_subscription = context.subscribe(&cfg.subscribe_headers_topic).await?;
        info!("Creating blocks subscriber on '{}'", cfg.subscribe_blocks_topic);
        let mut blocks_subscription = context.subscribe(&cfg.subscribe_blocks_topic).await?;
        info!("Creating peer status subscriber on '{}'", cfg.subscribe_peers_topic);
        let mut peers_subscription = context.subscribe(&cfg.subscribe_peers_topic).await?;

        let mut halted = manager.halted();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        puller.spawn_stall_monitor(shutdown_rx.clone());
        manager.spawn_flush_loop(shutdown_rx);

        context.clone().run(async move {
            loop {
                tokio::select! {
                    result = headers_subscription.read() => {
                        let Ok((_, message)) = result else {
                            error!("Headers message read failed");
                            break;
                        };
                        match message.as_ref() {
                            Message::Headers(msg) => {
                                let peer = PeerId(msg.peer);
                                let span = info_span!("consensus.headers", %peer, count = msg.headers.len());
                                async {
                                    if let Err(e) = manager.headers_presented(peer, msg.headers.clone()).await {
                                        report(&e);
                                    }
                                }
                                .instrument(span)
                                .await;
                            }
                            _ => debug!("Ignoring non-headers message"),
                        }
                    }

                    result = blocks_subscription.read() => {
                        let Ok((_, message)) = result else {
                            error!("Block message read failed");
                            break;
                        };
                        match message.as_ref() {
                            Message::Block(msg) => {
                                forward_block(puller.clone(), PeerId(msg.peer), msg.block.clone());
                            }
                            _ => debug!("Ignoring non-block message"),
                        }
                    }

                    result = peers_subscription.read() => {
                        let Ok((_, message)) = result else {
                            error!("Peer status message read failed");
                            break;
                        };
                        match message.as_ref() {
                            Message::PeerConnected(msg) => {
                                let peer = PeerId(msg.peer);
                                info!("{peer} connected at height {}", msg.best_height);
                                puller.peer_connected(peer, msg.best_height);
                                if let Err(e) = manager.peer_connected(peer, msg.best_height).await {
                                    report(&e);
                                }
                            }
                            Message::PeerDisconnected(msg) => {
                                let peer = PeerId(msg.peer);
                                info!("{peer} disconnected");
                                puller.peer_disconnected(peer).await;
                                if let Err(e) = manager.peer_disconnected(peer).await {
                                    report(&e);
                                }
                            }
                            _ => debug!("Ignoring unknown peer status message"),
                        }
                    }

                    _ = halted.changed() => break,

                    Some(event) = puller_events.recv() => {
                        match event {
                            PullerEvent::BlockDownloaded(downloaded) => {
                                let span = info_span!(
                                    "consensus.block",
                                    height = downloaded.height,
                                    peer = %downloaded.peer
                                );
                                let manager = manager.clone();
                                tokio::spawn(
                                    async move {
                                        if let Err(e) = manager.block_downloaded(downloaded).await {
                                            report(&e);
                                        }
                                    }
                                    .instrument(span),
                                );
                            }
                            PullerEvent::DownloadFailed { job, hash } => {
                                debug!("{job} gave up on block {hash}");
                                if let Err(e) = manager.download_failed(&hash).await {
                                    report(&e);
                                }
                            }
                        }
                    }
                }

                if manager.is_shutting_down() {
                    break;
                }
            }

            info!("Consensus module stopping");
            puller.shutdown();
            shutdown_tx.send(true).unwrap_or_else(|_| warn!("Background tasks already stopped"));
        });

        Ok(())
    }
}

/// Hand a block from the bus to the puller on its own task. The puller
/// may wait for room in its event queue, which only the module loop drains.
fn forward_block(puller: Arc<BlockPuller>, peer: PeerId, block: Block) -> JoinHandle<bool> {
    tokio::spawn(async move {
        let hash = block.hash();
        let matched = puller.on_block_received(peer, block).await;
        if !matched {
            debug!("Unsolicited block {hash} from {peer}");
        }
        matched
    })
}

/// Log a failure at the level its class deserves
fn report(e: &ConsensusManagerError) {
    match e.class() {
        ErrorClass::TransientNetwork => debug!("{e}"),
        ErrorClass::Structural | ErrorClass::ConsensusRule => warn!("{e}"),
        ErrorClass::Storage => error!("{e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_common::network::NetworkParams;
    use tessera_test_utils::{ChainBuilder, RecordingTransport};

    #[tokio::test]
    async fn blocks_reach_the_puller_while_its_events_are_unread() {
        let config = PullerConfig {
            event_queue_size: 1,
            ..PullerConfig::default()
        };
        let (puller, mut events) = BlockPuller::new(config, Arc::new(RecordingTransport::default()));
        let mut chain = ChainBuilder::new(&NetworkParams::regtest());
        chain.mine_n(3);
        puller.peer_connected(PeerId(1), 3);
        puller.request_download(chain.hash_heights(1..=3)).await.unwrap();

        let forwarded: Vec<_> = (1..=3)
            .map(|height| forward_block(puller.clone(), PeerId(1), (*chain.block(height)).clone()))
            .collect();

        let mut heights = Vec::new();
        for _ in 0..3 {
            let Some(PullerEvent::BlockDownloaded(downloaded)) = events.recv().await else {
                panic!("expected a downloaded block");
            };
            heights.push(downloaded.height);
        }
        for handle in forwarded {
            assert!(handle.await.unwrap());
        }
        heights.sort_unstable();
        assert_eq!(heights, [1, 2, 3]);
    }

    #[tokio::test]
    async fn unrequested_block_is_not_matched() {
        let (puller, _events) = BlockPuller::new(PullerConfig::default(), Arc::new(RecordingTransport::default()));
        let mut chain = ChainBuilder::new(&NetworkParams::regtest());
        chain.mine();
        assert!(!forward_block(puller, PeerId(1), (*chain.block(1)).clone()).await.unwrap());
    }
}
