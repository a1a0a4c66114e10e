//! Consensus rule variants, each checked through one `apply` contract

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};

use tessera_common::{
    network::NetworkParams, validation::ConsensusError, Block, OutPoint, Target, TxOut,
};

use crate::validation_pipeline::ValidationContext;

/// Pipeline stage a rule belongs to, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    /// Stateless checks on the header alone
    Header,
    /// Cheap local checks that the body matches its header
    Integrity,
    /// Context-free body rules, run concurrently across blocks
    Partial,
    /// Rules needing the chain state the block connects to
    Full,
}

/// A rule supplied from outside this crate
pub trait BlockRule: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn stage(&self) -> Stage;

    fn apply(&self, ctx: &ValidationContext, params: &NetworkParams) -> Result<(), ConsensusError>;
}

#[derive(Debug, Clone)]
pub enum Rule {
    CheckpointMatch,
    TimeTooNew,
    TargetWithinLimit,
    ProofOfWork,
    MerkleRoot,
    BlockNotEmpty,
    BlockSize,
    CoinbaseFirst,
    SingleCoinbase,
    NoDuplicateTransactions,
    OutputsNotEmpty,
    RequireWitness,
    TimeAfterMedianPast,
    InputsAvailable,
    InputValueCoversOutputs,
    CoinbaseAmount,
    Custom(Arc<dyn BlockRule>),
}

impl Rule {
    pub fn stage(&self) -> Stage {
        match self {
            Rule::CheckpointMatch | Rule::TimeTooNew | Rule::TargetWithinLimit | Rule::ProofOfWork => {
                Stage::Header
            }
            Rule::MerkleRoot | Rule::BlockNotEmpty | Rule::BlockSize => Stage::Integrity,
            Rule::CoinbaseFirst
            | Rule::SingleCoinbase
            | Rule::NoDuplicateTransactions
            | Rule::OutputsNotEmpty
            | Rule::RequireWitness => Stage::Partial,
            Rule::TimeAfterMedianPast
            | Rule::InputsAvailable
            | Rule::InputValueCoversOutputs
            | Rule::CoinbaseAmount => Stage::Full,
            Rule::Custom(rule) => rule.stage(),
        }
    }

    pub fn name(&self) -> String {
        match self {
            Rule::Custom(rule) => rule.name().to_string(),
            other => format!("{other:?}"),
        }
    }

    pub fn apply(&self, ctx: &ValidationContext, params: &NetworkParams) -> Result<(), ConsensusError> {
        if let Rule::Custom(rule) = self {
            return rule.apply(ctx, params);
        }

        match self.stage() {
            Stage::Header => self.apply_header(ctx, params),
            _ => match ctx.block.as_deref() {
                Some(block) => self.apply_body(ctx, block, params),
                None => Err(ConsensusError::bad_block_length(format!(
                    "no body for block {} at height {}",
                    ctx.hash, ctx.height
                ))),
            },
        }
    }

    fn apply_header(&self, ctx: &ValidationContext, params: &NetworkParams) -> Result<(), ConsensusError> {
        let header = &ctx.header;
        match self {
            Rule::CheckpointMatch => match params.checkpoints.get(&ctx.height) {
                Some(expected) if *expected != ctx.hash => Err(ConsensusError::checkpoint_mismatch(
                    format!("height {} expects {expected}, got {}", ctx.height, ctx.hash),
                )),
                _ => Ok(()),
            },
            Rule::TimeTooNew => {
                let limit = ctx.adjusted_time.saturating_add(params.max_future_drift);
                if header.time > limit {
                    return Err(ConsensusError::time_too_new(format!(
                        "block time {} beyond {limit}",
                        header.time
                    )));
                }
                Ok(())
            }
            Rule::TargetWithinLimit => {
                let limit = Target::from_compact(params.pow_limit_bits);
                match (header.target(), limit) {
                    (Some(target), Some(limit)) if !target.is_zero() && target <= limit => Ok(()),
                    _ => Err(ConsensusError::bad_diff_bits(format!(
                        "bits {:#010x} outside the proof-of-work limit",
                        header.bits
                    ))),
                }
            }
            Rule::ProofOfWork => match header.target() {
                Some(target) if target.is_met_by(&ctx.hash) => Ok(()),
                _ => Err(ConsensusError::high_hash(format!(
                    "hash {} does not meet bits {:#010x}",
                    ctx.hash, header.bits
                ))),
            },
            _ => Ok(()),
        }
    }

    fn apply_body(
        &self,
        ctx: &ValidationContext,
        block: &Block,
        params: &NetworkParams,
    ) -> Result<(), ConsensusError> {
        match self {
            Rule::BlockNotEmpty => {
                if block.transactions.is_empty() {
                    return Err(ConsensusError::bad_block_length("block has no transactions"));
                }
                Ok(())
            }
            Rule::BlockSize => {
                let size = block.size();
                if size > params.max_block_size {
                    return Err(ConsensusError::bad_block_length(format!(
                        "size {size} exceeds {}",
                        params.max_block_size
                    )));
                }
                Ok(())
            }
            Rule::MerkleRoot => {
                let (root, mutated) = block.merkle_root_and_mutation();
                if root != block.header.merkle_root {
                    return Err(ConsensusError::bad_merkle_root(format!(
                        "merkle root mismatch in block {}",
                        ctx.hash
                    )));
                }
                if mutated {
                    return Err(ConsensusError::merkle_mutated(format!(
                        "block {} repeats a merkle subtree",
                        ctx.hash
                    )));
                }
                Ok(())
            }
            Rule::CoinbaseFirst => match block.transactions.first() {
                Some(tx) if tx.is_coinbase() => Ok(()),
                _ => Err(ConsensusError::coinbase_missing("first transaction is not a coinbase")),
            },
            Rule::SingleCoinbase => {
                if block.transactions.iter().skip(1).any(|tx| tx.is_coinbase()) {
                    return Err(ConsensusError::coinbase_multiple("more than one coinbase"));
                }
                Ok(())
            }
            Rule::NoDuplicateTransactions => {
                let mut seen = HashSet::new();
                for tx in &block.transactions {
                    let txid = tx.txid();
                    if !seen.insert(txid) {
                        return Err(ConsensusError::duplicate_transaction(format!(
                            "transaction {txid} appears twice"
                        )));
                    }
                }
                Ok(())
            }
            Rule::OutputsNotEmpty => match block.transactions.iter().find(|tx| tx.outputs.is_empty()) {
                Some(tx) => Err(ConsensusError::outputs_empty(format!(
                    "transaction {} has no outputs",
                    tx.txid()
                ))),
                None => Ok(()),
            },
            Rule::RequireWitness => {
                if !params.require_witness {
                    return Ok(());
                }
                for tx in block.transactions.iter().filter(|tx| !tx.is_coinbase()) {
                    if tx.inputs.iter().any(|input| input.witness.is_empty()) {
                        return Err(ConsensusError::missing_witness(format!(
                            "transaction {} spends without witness",
                            tx.txid()
                        )));
                    }
                }
                Ok(())
            }
            Rule::TimeAfterMedianPast => match ctx.median_time_past {
                Some(median) if block.header.time <= median => Err(ConsensusError::time_too_old(
                    format!("block time {} not after median {median}", block.header.time),
                )),
                _ => Ok(()),
            },
            Rule::InputsAvailable => resolve_input_values(block, &ctx.spent_outputs).map(|_| ()),
            Rule::InputValueCoversOutputs => {
                let inputs = resolve_input_values(block, &ctx.spent_outputs)?;
                for (tx, input_value) in block.transactions.iter().zip(inputs) {
                    if !tx.is_coinbase() && input_value < tx.total_output_value() {
                        return Err(ConsensusError::inputs_below_outputs(format!(
                            "transaction {} spends {input_value} into {}",
                            tx.txid(),
                            tx.total_output_value()
                        )));
                    }
                }
                Ok(())
            }
            Rule::CoinbaseAmount => {
                let inputs = resolve_input_values(block, &ctx.spent_outputs)?;
                let fees = block
                    .transactions
                    .iter()
                    .zip(inputs)
                    .filter(|(tx, _)| !tx.is_coinbase())
                    .fold(0u64, |acc, (tx, input_value)| {
                        acc.saturating_add(input_value.saturating_sub(tx.total_output_value()))
                    });
                let allowed = params.subsidy(ctx.height).saturating_add(fees);
                let claimed = block.transactions.first().map_or(0, |tx| tx.total_output_value());
                if claimed > allowed {
                    return Err(ConsensusError::coinbase_amount(format!(
                        "coinbase pays {claimed}, limit {allowed}"
                    )));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Total input value per transaction (zero for the coinbase), resolving
/// each input against the spent outputs or an output created earlier in
/// the same block. An outpoint may be spent only once.
fn resolve_input_values(
    block: &Block,
    spent_outputs: &HashMap<OutPoint, TxOut>,
) -> Result<Vec<u64>, ConsensusError> {
    let mut created: HashMap<OutPoint, u64> = HashMap::new();
    let mut used: HashSet<OutPoint> = HashSet::new();
    let mut totals = Vec::with_capacity(block.transactions.len());

    for tx in &block.transactions {
        let txid = tx.txid();
        if tx.is_coinbase() {
            totals.push(0);
        } else {
            let mut total = 0u64;
            for input in &tx.inputs {
                let outpoint = input.previous_output;
                let value = spent_outputs
                    .get(&outpoint)
                    .map(|out| out.value)
                    .or_else(|| created.get(&outpoint).copied());
                match value {
                    Some(value) if used.insert(outpoint) => total = total.saturating_add(value),
                    _ => {
                        return Err(ConsensusError::inputs_missing_or_spent(format!(
                            "transaction {txid} spends unavailable output {outpoint}"
                        )))
                    }
                }
            }
            totals.push(total);
        }
        for (vout, output) in tx.outputs.iter().enumerate() {
            created.insert(OutPoint::new(txid, vout as u32), output.value);
        }
    }
    Ok(totals)
}
