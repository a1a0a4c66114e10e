//! Per-network consensus parameters

use std::collections::BTreeMap;

use crate::hash::BlockHash;
use crate::types::{BlockHeader, HashHeight};

const COIN: u64 = 100_000_000;

/// Merkle root shared by the genesis blocks of every built-in network
const GENESIS_MERKLE_ROOT: &str =
    "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b";

/// Parse a hash written in the conventional reversed display order
pub fn hash_from_display_hex(s: &str) -> Result<BlockHash, hex::FromHexError> {
    let hash: BlockHash = s.parse()?;
    let mut bytes = hash.into_inner();
    bytes.reverse();
    Ok(BlockHash::new(bytes))
}

fn known_hash(s: &str) -> BlockHash {
    hash_from_display_hex(s).expect("built-in hash literal")
}

#[derive(Debug, Clone)]
pub struct NetworkParams {
    pub name: String,
    pub genesis: BlockHeader,
    /// Easiest allowed compact target
    pub pow_limit_bits: u32,
    pub max_block_size: usize,
    pub initial_subsidy: u64,
    pub halving_interval: u64,
    pub checkpoints: BTreeMap<u64, BlockHash>,
    /// Blocks at or below this height skip body rules beyond integrity
    pub assume_valid_height: Option<u64>,
    /// Seconds a header timestamp may run ahead of local time
    pub max_future_drift: u32,
    /// Number of ancestors contributing to median time past
    pub median_time_span: usize,
    pub require_witness: bool,
}

impl NetworkParams {
    pub fn mainnet() -> Self {
        let genesis = BlockHeader {
            version: 1,
            previous_hash: BlockHash::default(),
            merkle_root: known_hash(GENESIS_MERKLE_ROOT),
            time: 1_231_006_505,
            bits: 0x1d00ffff,
            nonce: 2_083_236_893,
        };
        let checkpoints = BTreeMap::from([
            (
                11_111,
                known_hash("0000000069e244f73d78e8fd29ba2fd2ed618bd6fa2ee92559f542fdb26e7c1d"),
            ),
            (
                33_333,
                known_hash("000000002dd5588a74784eaa7ab0507a18ad16a236e7b1ce69f00d7ddfb5d0a6"),
            ),
        ]);
        Self {
            name: "mainnet".to_string(),
            genesis,
            pow_limit_bits: 0x1d00ffff,
            max_block_size: 4_000_000,
            initial_subsidy: 50 * COIN,
            halving_interval: 210_000,
            checkpoints,
            assume_valid_height: None,
            max_future_drift: 2 * 60 * 60,
            median_time_span: 11,
            require_witness: false,
        }
    }

    pub fn testnet() -> Self {
        let mut params = Self::mainnet();
        params.name = "testnet".to_string();
        params.genesis.time = 1_296_688_602;
        params.genesis.nonce = 414_098_458;
        params.checkpoints = BTreeMap::new();
        params
    }

    pub fn regtest() -> Self {
        let mut params = Self::mainnet();
        params.name = "regtest".to_string();
        params.genesis.time = 1_296_688_602;
        params.genesis.bits = 0x207fffff;
        params.genesis.nonce = 2;
        params.pow_limit_bits = 0x207fffff;
        params.halving_interval = 150;
        params.checkpoints = BTreeMap::new();
        params
    }

    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "mainnet" => Some(Self::mainnet()),
            "testnet" => Some(Self::testnet()),
            "regtest" => Some(Self::regtest()),
            _ => None,
        }
    }

    pub fn genesis_hash(&self) -> BlockHash {
        self.genesis.hash()
    }

    pub fn genesis_tip(&self) -> HashHeight {
        HashHeight::new(self.genesis_hash(), 0)
    }

    /// Block reward before fees at `height`
    pub fn subsidy(&self, height: u64) -> u64 {
        let halvings = height / self.halving_interval.max(1);
        if halvings >= 64 {
            0
        } else {
            self.initial_subsidy >> halvings
        }
    }

    pub fn last_checkpoint_height(&self) -> Option<u64> {
        self.checkpoints.keys().next_back().copied()
    }

    /// True if body rules beyond integrity may be skipped at `height`
    pub fn is_assumed_valid(&self, height: u64) -> bool {
        let checkpointed = self.last_checkpoint_height().is_some_and(|h| height <= h);
        let assumed = self.assume_valid_height.is_some_and(|h| height <= h);
        checkpointed || assumed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mainnet_genesis_hash() {
        assert_eq!(
            NetworkParams::mainnet().genesis_hash(),
            known_hash("000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f")
        );
    }

    #[test]
    fn testnet_genesis_hash() {
        assert_eq!(
            NetworkParams::testnet().genesis_hash(),
            known_hash("000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943")
        );
    }

    #[test]
    fn regtest_genesis_hash() {
        assert_eq!(
            NetworkParams::regtest().genesis_hash(),
            known_hash("0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206")
        );
    }

    #[test]
    fn subsidy_halves() {
        let params = NetworkParams::regtest();
        assert_eq!(params.subsidy(0), 50 * COIN);
        assert_eq!(params.subsidy(150), 25 * COIN);
        assert_eq!(params.subsidy(150 * 64), 0);
    }

    #[test]
    fn assume_valid_covers_checkpoints() {
        let mut params = NetworkParams::mainnet();
        assert!(params.is_assumed_valid(33_333));
        assert!(!params.is_assumed_valid(33_334));
        params.assume_valid_height = Some(50_000);
        assert!(params.is_assumed_valid(40_000));
    }

    #[test]
    fn lookup_by_name() {
        assert_eq!(NetworkParams::by_name("regtest").unwrap().pow_limit_bits, 0x207fffff);
        assert!(NetworkParams::by_name("moonnet").is_none());
    }
}
