use std::{
    collections::HashMap,
    fs,
    path::Path,
    sync::{Arc, Mutex, PoisonError},
};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use fjall::{Database, Keyspace, KeyspaceCreateOptions, OwnedWriteBatch, PersistMode};
use tessera_common::{
    interfaces::{BlockStore, ChainRepository, ChainUpdate},
    Block, BlockHash, BlockHeader, HashHeight,
};
use tracing::{debug, info};

use super::{height_from_key, height_key};
use crate::StoreConfig;

const HEADERS_KEYSPACE: &str = "headers-by-height";
const CHAIN_TIP_KEYSPACE: &str = "chain-tip";
const BLOCKS_KEYSPACE: &str = "blocks";
const BLOCK_HASHES_BY_HEIGHT_KEYSPACE: &str = "block-hashes-by-height";
const TIP_KEY: &[u8] = b"tip";

/// Accepted header chain and connected block bodies in one Fjall database
pub struct FjallStore {
    database: Database,
    headers: FjallHeaderStore,
    blocks: FjallBodyStore,
    /// Bodies connected since the last flush
    pending: Mutex<HashMap<BlockHash, (HashHeight, Arc<Block>)>>,
}

impl FjallStore {
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let path = Path::new(&config.database_path);
        info!("Storing chain with Fjall on disk ({})", config.database_path);

        if config.clear_on_start && path.exists() {
            fs::remove_dir_all(path)?;
        }

        let database = Database::builder(path).open()?;
        let headers = FjallHeaderStore::new(&database)?;
        let blocks = FjallBodyStore::new(&database)?;
        Ok(Self {
            database,
            headers,
            blocks,
            pending: Mutex::new(HashMap::new()),
        })
    }

    pub fn tip(&self) -> Result<Option<HashHeight>> {
        self.headers.tip()
    }

    pub fn header_at(&self, height: u64) -> Result<Option<BlockHeader>> {
        self.headers.get(height)
    }

    /// Body of the block last stored at `height`
    pub fn get_block_by_height(&self, height: u64) -> Result<Option<Block>> {
        self.blocks.get_by_height(height)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl ChainRepository for FjallStore {
    async fn load(&self, genesis: &BlockHeader) -> Result<Vec<BlockHeader>> {
        let Some(tip) = self.headers.tip()? else {
            return Ok(vec![genesis.clone()]);
        };

        let headers = self.headers.range(0, tip.height)?;
        if headers.len() as u64 != tip.height + 1 {
            bail!("stored chain has {} headers, tip {tip} needs {}", headers.len(), tip.height + 1);
        }
        if headers.last().map(BlockHeader::hash) != Some(tip.hash) {
            bail!("stored headers do not end at tip {tip}");
        }
        if headers.first().map(BlockHeader::hash) != Some(genesis.hash()) {
            bail!("stored chain starts at a different genesis");
        }
        info!("Loaded {} stored headers up to {tip}", headers.len());
        Ok(headers)
    }

    async fn save(&self, update: ChainUpdate) -> Result<()> {
        let mut batch = self.database.batch();
        let top = self.headers.top_height()?;
        self.headers.write(&mut batch, &update, top);
        batch.commit()?;
        self.database.persist(PersistMode::SyncAll)?;
        debug!(
            "Stored {} headers from height {}, tip {}",
            update.headers.len(),
            update.first_height,
            update.tip
        );
        Ok(())
    }
}

#[async_trait]
impl BlockStore for FjallStore {
    async fn initialize(&self) -> Result<()> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).clear();
        Ok(())
    }

    async fn add_pending(&self, block: HashHeight, body: Arc<Block>) -> Result<()> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(block.hash, (block, body));
        Ok(())
    }

    async fn get_block(&self, hash: &BlockHash) -> Result<Option<Block>> {
        let cached = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(hash)
            .map(|(_, body)| (**body).clone());
        match cached {
            Some(block) => Ok(Some(block)),
            None => self.blocks.get_by_hash(hash),
        }
    }

    async fn flush(&self) -> Result<()> {
        let pending: Vec<(HashHeight, Arc<Block>)> = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let mut batch = self.database.batch();
        for (block, body) in &pending {
            self.blocks.insert(&mut batch, *block, body);
        }
        batch.commit()?;
        self.database.persist(PersistMode::SyncAll)?;

        // Only drop what was written; more may have arrived meanwhile
        let mut queue = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        for (block, _) in &pending {
            queue.remove(&block.hash);
        }
        debug!("Flushed {} block bodies", pending.len());
        Ok(())
    }
}

struct FjallHeaderStore {
    headers: Keyspace,
    chain_tip: Keyspace,
}

impl FjallHeaderStore {
    fn new(database: &Database) -> Result<Self> {
        let headers = database.keyspace(HEADERS_KEYSPACE, KeyspaceCreateOptions::default)?;
        let chain_tip = database.keyspace(CHAIN_TIP_KEYSPACE, KeyspaceCreateOptions::default)?;
        Ok(Self { headers, chain_tip })
    }

    fn tip(&self) -> Result<Option<HashHeight>> {
        let Some(bytes) = self.chain_tip.get(TIP_KEY)? else {
            return Ok(None);
        };
        Ok(Some(minicbor::decode(&bytes)?))
    }

    fn get(&self, height: u64) -> Result<Option<BlockHeader>> {
        let Some(bytes) = self.headers.get(height_key(height))? else {
            return Ok(None);
        };
        Ok(Some(minicbor::decode(&bytes)?))
    }

    fn range(&self, from: u64, to: u64) -> Result<Vec<BlockHeader>> {
        let mut headers = Vec::new();
        for res in self.headers.range(height_key(from)..=height_key(to)) {
            let bytes = res.value()?;
            headers.push(minicbor::decode(&bytes)?);
        }
        Ok(headers)
    }

    /// Highest height with a stored header
    fn top_height(&self) -> Result<Option<u64>> {
        let Some(res) = self.headers.last_key_value() else {
            return Ok(None);
        };
        let key = res.key()?;
        Ok(Some(height_from_key(&key)?))
    }

    /// Replace everything from the update's first height onward
    fn write(&self, batch: &mut OwnedWriteBatch, update: &ChainUpdate, top: Option<u64>) {
        if let Some(top) = top {
            for height in (update.tip.height + 1)..=top {
                batch.remove(&self.headers, height_key(height));
            }
        }
        for (offset, header) in update.headers.iter().enumerate() {
            let bytes = minicbor::to_vec(header).expect("infallible");
            batch.insert(&self.headers, height_key(update.first_height + offset as u64), bytes);
        }
        let tip = minicbor::to_vec(update.tip).expect("infallible");
        batch.insert(&self.chain_tip, TIP_KEY, tip);
    }
}

struct FjallBodyStore {
    blocks: Keyspace,
    block_hashes_by_height: Keyspace,
}

impl FjallBodyStore {
    fn new(database: &Database) -> Result<Self> {
        let blocks = database.keyspace(BLOCKS_KEYSPACE, KeyspaceCreateOptions::default)?;
        let block_hashes_by_height =
            database.keyspace(BLOCK_HASHES_BY_HEIGHT_KEYSPACE, KeyspaceCreateOptions::default)?;
        Ok(Self {
            blocks,
            block_hashes_by_height,
        })
    }

    fn insert(&self, batch: &mut OwnedWriteBatch, block: HashHeight, body: &Block) {
        let encoded = minicbor::to_vec(body).expect("infallible");
        batch.insert(&self.blocks, block.hash.as_ref(), encoded);
        batch.insert(&self.block_hashes_by_height, height_key(block.height), block.hash.as_ref());
    }

    fn get_by_hash(&self, hash: &BlockHash) -> Result<Option<Block>> {
        let Some(bytes) = self.blocks.get(hash.as_ref())? else {
            return Ok(None);
        };
        Ok(Some(minicbor::decode(&bytes)?))
    }

    fn get_by_height(&self, height: u64) -> Result<Option<Block>> {
        let Some(hash) = self.block_hashes_by_height.get(height_key(height))? else {
            return Ok(None);
        };
        let hash = BlockHash::try_from(hash.as_ref()).map_err(|_| anyhow!("bad block hash at height {height}"))?;
        self.get_by_hash(&hash)
    }
}
