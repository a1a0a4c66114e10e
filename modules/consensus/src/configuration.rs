use std::time::Duration;

use anyhow::{anyhow, Result};
use config::Config;
use tessera_common::network::NetworkParams;

use crate::chained_header_tree::TieBreak;

#[derive(Clone, Debug, serde::Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ConsensusConfig {
    pub network: String,
    pub max_reorg_length: u64,
    pub download_batch_size: usize,
    pub max_blocks_in_flight: usize,
    pub partial_validation_workers: usize,
    pub flush_interval_secs: u64,
    pub ban_duration_secs: u64,
    pub tie_break: TieBreak,

    pub subscribe_headers_topic: String,
    pub subscribe_blocks_topic: String,
    pub subscribe_peers_topic: String,
    pub publish_requests_topic: String,
    pub publish_chain_topic: String,
    pub publish_bans_topic: String,
}

impl ConsensusConfig {
    pub fn try_load(config: &Config) -> Result<Self> {
        let full_config = Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config.default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config.clone())
            .build()?;
        Ok(full_config.try_deserialize()?)
    }

    pub fn network_params(&self) -> Result<NetworkParams> {
        NetworkParams::by_name(&self.network)
            .ok_or_else(|| anyhow!("Unknown network '{}'", self.network))
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }

    pub fn ban_duration(&self) -> Duration {
        Duration::from_secs(self.ban_duration_secs)
    }
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            network: "mainnet".to_string(),
            max_reorg_length: 100,
            download_batch_size: 16,
            max_blocks_in_flight: 256,
            partial_validation_workers: 4,
            flush_interval_secs: 5,
            ban_duration_secs: 86_400,
            tie_break: TieBreak::EarliestSeen,
            subscribe_headers_topic: "tessera.peer.headers".to_string(),
            subscribe_blocks_topic: "tessera.peer.blocks".to_string(),
            subscribe_peers_topic: "tessera.peer.status".to_string(),
            publish_requests_topic: "tessera.peer.requests".to_string(),
            publish_chain_topic: "tessera.chain.events".to_string(),
            publish_bans_topic: "tessera.peer.bans".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_embedded_file() {
        let loaded = ConsensusConfig::try_load(&Config::default()).unwrap();
        assert_eq!(loaded, ConsensusConfig::default());
    }

    #[test]
    fn tie_break_and_network_are_configurable() {
        let config = Config::builder()
            .set_override("tie-break", "lowest-hash")
            .unwrap()
            .set_override("network", "regtest")
            .unwrap()
            .build()
            .unwrap();
        let loaded = ConsensusConfig::try_load(&config).unwrap();
        assert_eq!(loaded.tie_break, TieBreak::LowestHash);
        assert_eq!(loaded.network_params().unwrap().name, "regtest");
    }

    #[test]
    fn unknown_network_is_an_error() {
        let config = ConsensusConfig {
            network: "nowhere".to_string(),
            ..ConsensusConfig::default()
        };
        assert!(config.network_params().is_err());
    }
}
