//! Definition of Tessera bus messages

use crate::hash::BlockHash;
use crate::types::{Block, BlockHeader, HashHeight, PeerId};

/// Headers announced by a peer, in chain order
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct HeadersMessage {
    pub peer: u64,
    pub headers: Vec<BlockHeader>,
}

/// Block body delivered by a peer
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BlockMessage {
    pub peer: u64,
    pub block: Block,
}

/// Peer connected, advertising its best height
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct PeerConnectedMessage {
    pub peer: u64,
    pub best_height: u64,
}

#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct PeerDisconnectedMessage {
    pub peer: u64,
}

/// Request for block bodies from one peer
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct GetDataMessage {
    pub peer: u64,
    pub hashes: Vec<BlockHash>,
}

/// Request for headers following the first locator hash the peer recognises
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct GetHeadersMessage {
    pub peer: u64,
    pub locator: Vec<BlockHash>,
}

/// A block joined or left the consensus chain
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChainEventMessage {
    pub block: HashHeight,
}

#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct PeerBannedMessage {
    pub peer: u64,
    pub reason: String,
    pub duration_secs: u64,
}

// === Global message enum ===
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Message {
    None(()), // Just so we have a simple default

    // Inbound from the peer transport
    Headers(HeadersMessage),
    Block(BlockMessage),
    PeerConnected(PeerConnectedMessage),
    PeerDisconnected(PeerDisconnectedMessage),

    // Outbound to the peer transport
    GetData(GetDataMessage),
    GetHeaders(GetHeadersMessage),
    PeerBanned(PeerBannedMessage),

    // Chain notifications
    BlockConnected(ChainEventMessage),
    BlockDisconnected(ChainEventMessage),
}

impl Default for Message {
    fn default() -> Self {
        Self::None(())
    }
}

impl Message {
    /// Peer a transport message concerns, if any
    pub fn peer(&self) -> Option<PeerId> {
        match self {
            Message::Headers(m) => Some(PeerId(m.peer)),
            Message::Block(m) => Some(PeerId(m.peer)),
            Message::PeerConnected(m) => Some(PeerId(m.peer)),
            Message::PeerDisconnected(m) => Some(PeerId(m.peer)),
            Message::GetData(m) => Some(PeerId(m.peer)),
            Message::GetHeaders(m) => Some(PeerId(m.peer)),
            Message::PeerBanned(m) => Some(PeerId(m.peer)),
            Message::None(_) | Message::BlockConnected(_) | Message::BlockDisconnected(_) => None,
        }
    }
}

// Casts from specific messages
impl From<HeadersMessage> for Message {
    fn from(msg: HeadersMessage) -> Self {
        Message::Headers(msg)
    }
}

impl From<BlockMessage> for Message {
    fn from(msg: BlockMessage) -> Self {
        Message::Block(msg)
    }
}

impl From<GetDataMessage> for Message {
    fn from(msg: GetDataMessage) -> Self {
        Message::GetData(msg)
    }
}

impl From<GetHeadersMessage> for Message {
    fn from(msg: GetHeadersMessage) -> Self {
        Message::GetHeaders(msg)
    }
}

impl From<PeerBannedMessage> for Message {
    fn from(msg: PeerBannedMessage) -> Self {
        Message::PeerBanned(msg)
    }
}
