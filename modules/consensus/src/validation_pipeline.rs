//! Ordered rule stages applied to a per-block validation context

use std::{
    collections::HashMap,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use tessera_common::{
    network::NetworkParams, validation::ConsensusError, Block, BlockHash, BlockHeader, OutPoint,
    PeerId, TxOut,
};

use crate::rules::{Rule, Stage};

/// Seconds since the unix epoch, clamped into the header time range
pub fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().min(u32::MAX as u64) as u32)
        .unwrap_or(0)
}

/// Scratch data for one block, threaded through the stages
#[derive(Debug, Clone)]
pub struct ValidationContext {
    pub hash: BlockHash,
    pub height: u64,
    pub header: BlockHeader,
    pub block: Option<Arc<Block>>,
    /// Peer that supplied the data, if any
    pub peer: Option<PeerId>,
    pub adjusted_time: u32,
    pub median_time_past: Option<u32>,
    /// Outputs spent by the block, looked up before the Full stage
    pub spent_outputs: HashMap<OutPoint, TxOut>,
    /// First failure recorded by the pipeline
    pub error: Option<ConsensusError>,
}

impl ValidationContext {
    pub fn new(header: BlockHeader, height: u64) -> Self {
        Self {
            hash: header.hash(),
            height,
            header,
            block: None,
            peer: None,
            adjusted_time: unix_now(),
            median_time_past: None,
            spent_outputs: HashMap::new(),
            error: None,
        }
    }

    pub fn for_block(block: Arc<Block>, height: u64) -> Self {
        let mut ctx = Self::new(block.header.clone(), height);
        ctx.block = Some(block);
        ctx
    }

    pub fn with_peer(mut self, peer: Option<PeerId>) -> Self {
        self.peer = peer;
        self
    }
}

/// Rules for one network, run per stage in registration order
#[derive(Debug, Clone)]
pub struct RuleSet {
    params: Arc<NetworkParams>,
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn empty(params: Arc<NetworkParams>) -> Self {
        Self {
            params,
            rules: Vec::new(),
        }
    }

    pub fn for_network(params: Arc<NetworkParams>) -> Self {
        let mut set = Self::empty(params);
        for rule in [
            Rule::CheckpointMatch,
            Rule::TimeTooNew,
            Rule::TargetWithinLimit,
            Rule::ProofOfWork,
            Rule::MerkleRoot,
            Rule::BlockNotEmpty,
            Rule::BlockSize,
            Rule::CoinbaseFirst,
            Rule::SingleCoinbase,
            Rule::NoDuplicateTransactions,
            Rule::OutputsNotEmpty,
            Rule::RequireWitness,
            Rule::TimeAfterMedianPast,
            Rule::InputsAvailable,
            Rule::InputValueCoversOutputs,
            Rule::CoinbaseAmount,
        ] {
            set.register(rule);
        }
        set
    }

    pub fn register(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    pub fn params(&self) -> &NetworkParams {
        &self.params
    }

    pub fn rules(&self, stage: Stage) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(move |r| r.stage() == stage)
    }

    /// True if body rules beyond integrity are skipped at this height
    pub fn skips_body_rules(&self, height: u64) -> bool {
        self.params.is_assumed_valid(height)
    }

    /// Run one stage, stopping at the first failure. The failure is also
    /// recorded in the context.
    pub fn run(&self, stage: Stage, ctx: &mut ValidationContext) -> Result<(), ConsensusError> {
        if matches!(stage, Stage::Partial | Stage::Full) && self.skips_body_rules(ctx.height) {
            return Ok(());
        }
        for rule in self.rules(stage) {
            if let Err(error) = rule.apply(ctx, &self.params) {
                ctx.error = Some(error.clone());
                return Err(error);
            }
        }
        Ok(())
    }
}
