//! Tessera chain store
//! Fjall persistence behind the consensus manager's chain repository and
//! block store

mod stores;

use std::sync::Arc;

use anyhow::Result;
use config::Config;
use tessera_common::interfaces::{BlockStore, ChainRepository};

pub use stores::FjallStore;

#[derive(Clone, Debug, serde::Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct StoreConfig {
    pub database_path: String,
    pub clear_on_start: bool,
}

impl StoreConfig {
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
}

/// Opened store, handed out under both persistence interfaces
pub struct ChainStore {
    store: Arc<FjallStore>,
}

impl ChainStore {
    pub fn open(config: &StoreConfig) -> Result<Self> {
        Ok(Self {
            store: Arc::new(FjallStore::open(config)?),
        })
    }

    pub fn chain_repository(&self) -> Arc<dyn ChainRepository> {
        self.store.clone()
    }

    pub fn block_store(&self) -> Arc<dyn BlockStore> {
        self.store.clone()
    }

    pub fn inner(&self) -> &Arc<FjallStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_common::{interfaces::ChainUpdate, network::NetworkParams};
    use tessera_test_utils::ChainBuilder;

    #[test]
    fn defaults_match_embedded_file() {
        let loaded = StoreConfig::try_load(&Config::default()).unwrap();
        assert_eq!(loaded.database_path, "fjall-chain");
        assert!(!loaded.clear_on_start);
    }

    #[test]
    fn overrides_take_precedence() {
        let config = Config::builder()
            .set_override("database-path", "/tmp/elsewhere")
            .unwrap()
            .set_override("clear-on-start", true)
            .unwrap()
            .build()
            .unwrap();
        let loaded = StoreConfig::try_load(&config).unwrap();
        assert_eq!(loaded.database_path, "/tmp/elsewhere");
        assert!(loaded.clear_on_start);
    }

    #[tokio::test]
    async fn both_interfaces_share_one_database() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChainStore::open(&StoreConfig {
            database_path: dir.path().to_string_lossy().into_owned(),
            clear_on_start: false,
        })
        .unwrap();

        let mut chain = ChainBuilder::new(&NetworkParams::regtest());
        chain.mine_n(2);
        store
            .chain_repository()
            .save(ChainUpdate {
                first_height: 0,
                headers: chain.headers(0..=2),
                tip: chain.tip(),
            })
            .await
            .unwrap();
        store.block_store().add_pending(chain.hash_height(2), chain.block(2)).await.unwrap();
        store.block_store().flush().await.unwrap();

        assert_eq!(store.inner().tip().unwrap(), Some(chain.tip()));
        assert!(store.inner().get_block_by_height(2).unwrap().is_some());
    }
}
