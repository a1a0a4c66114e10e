//! Collaborators that talk to the peer transport and chain subscribers over
//! the message bus

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use caryatid_sdk::Context;
use tessera_common::{
    interfaces::{ChainEvents, PeerBanning, PeerTransport},
    messages::{
        ChainEventMessage, GetDataMessage, GetHeadersMessage, Message, PeerBannedMessage,
    },
    BlockHash, HashHeight, PeerId,
};

/// Publishes block and header requests for the transport to send
pub struct BusTransport {
    context: Arc<Context<Message>>,
    topic: String,
}

impl BusTransport {
    pub fn new(context: Arc<Context<Message>>, topic: &str) -> Self {
        Self {
            context,
            topic: topic.to_string(),
        }
    }
}

#[async_trait]
impl PeerTransport for BusTransport {
    async fn request_blocks(&self, peer: PeerId, hashes: Vec<BlockHash>) -> Result<()> {
        let message = Message::GetData(GetDataMessage {
            peer: peer.0,
            hashes,
        });
        self.context.message_bus.publish(&self.topic, Arc::new(message)).await
    }

    async fn request_headers(&self, peer: PeerId, locator: Vec<BlockHash>) -> Result<()> {
        let message = Message::GetHeaders(GetHeadersMessage {
            peer: peer.0,
            locator,
        });
        self.context.message_bus.publish(&self.topic, Arc::new(message)).await
    }
}

pub struct BusBanning {
    context: Arc<Context<Message>>,
    topic: String,
}

impl BusBanning {
    pub fn new(context: Arc<Context<Message>>, topic: &str) -> Self {
        Self {
            context,
            topic: topic.to_string(),
        }
    }
}

#[async_trait]
impl PeerBanning for BusBanning {
    async fn ban(&self, peer: PeerId, reason: &str, duration: Duration) -> Result<()> {
        let message = Message::PeerBanned(PeerBannedMessage {
            peer: peer.0,
            reason: reason.to_string(),
            duration_secs: duration.as_secs(),
        });
        self.context.message_bus.publish(&self.topic, Arc::new(message)).await
    }
}

/// Announces committed tip changes
pub struct BusEvents {
    context: Arc<Context<Message>>,
    topic: String,
}

impl BusEvents {
    pub fn new(context: Arc<Context<Message>>, topic: &str) -> Self {
        Self {
            context,
            topic: topic.to_string(),
        }
    }
}

#[async_trait]
impl ChainEvents for BusEvents {
    async fn block_connected(&self, block: HashHeight) -> Result<()> {
        let message = Message::BlockConnected(ChainEventMessage { block });
        self.context.message_bus.publish(&self.topic, Arc::new(message)).await
    }

    async fn block_disconnected(&self, block: HashHeight) -> Result<()> {
        let message = Message::BlockDisconnected(ChainEventMessage { block });
        self.context.message_bus.publish(&self.topic, Arc::new(message)).await
    }
}
