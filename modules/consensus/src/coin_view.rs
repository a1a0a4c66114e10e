//! In-memory unspent output set with per-block undo data

use std::{
    collections::{HashMap, VecDeque},
    sync::RwLock,
};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tessera_common::{interfaces::CoinView, Block, HashHeight, OutPoint, TxOut};
use tracing::debug;

#[derive(Debug)]
struct BlockUndo {
    block: HashHeight,
    previous: HashHeight,
    spent: Vec<(OutPoint, TxOut)>,
    created: Vec<OutPoint>,
}

#[derive(Debug)]
struct CoinViewState {
    tip: HashHeight,
    utxos: HashMap<OutPoint, TxOut>,
    undo: VecDeque<BlockUndo>,
}

impl CoinViewState {
    fn revert(&mut self, undo: BlockUndo) {
        for outpoint in &undo.created {
            self.utxos.remove(outpoint);
        }
        for (outpoint, output) in undo.spent {
            self.utxos.insert(outpoint, output);
        }
        self.tip = undo.previous;
    }
}

pub struct InMemoryCoinView {
    state: RwLock<CoinViewState>,
    /// Blocks that can be rewound
    undo_depth: usize,
}

impl InMemoryCoinView {
    pub fn new(tip: HashHeight, undo_depth: usize) -> Self {
        Self {
            state: RwLock::new(CoinViewState {
                tip,
                utxos: HashMap::new(),
                undo: VecDeque::new(),
            }),
            undo_depth: undo_depth.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.state.read().map(|s| s.utxos.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.state.read().map(|s| s.utxos.contains_key(outpoint)).unwrap_or(false)
    }
}

#[async_trait]
impl CoinView for InMemoryCoinView {
    async fn tip(&self) -> Result<HashHeight> {
        let state = self.state.read().map_err(|_| anyhow!("coin view lock poisoned"))?;
        Ok(state.tip)
    }

    async fn fetch_outputs(&self, outpoints: &[OutPoint]) -> Result<HashMap<OutPoint, TxOut>> {
        let state = self.state.read().map_err(|_| anyhow!("coin view lock poisoned"))?;
        Ok(outpoints
            .iter()
            .filter_map(|op| state.utxos.get(op).map(|out| (*op, out.clone())))
            .collect())
    }

    async fn apply(&self, block: HashHeight, body: &Block) -> Result<()> {
        let mut state = self.state.write().map_err(|_| anyhow!("coin view lock poisoned"))?;
        if body.header.previous_hash != state.tip.hash || block.height != state.tip.height + 1 {
            bail!("block {block} does not extend coin view tip {}", state.tip);
        }

        let mut undo = BlockUndo {
            block,
            previous: state.tip,
            spent: Vec::new(),
            created: Vec::new(),
        };
        for tx in &body.transactions {
            if !tx.is_coinbase() {
                for input in &tx.inputs {
                    match state.utxos.remove(&input.previous_output) {
                        Some(output) => undo.spent.push((input.previous_output, output)),
                        None => {
                            let missing = input.previous_output;
                            state.revert(undo);
                            bail!("block {block} spends missing output {missing}");
                        }
                    }
                }
            }
            let txid = tx.txid();
            for (vout, output) in tx.outputs.iter().enumerate() {
                let outpoint = OutPoint::new(txid, vout as u32);
                state.utxos.insert(outpoint, output.clone());
                undo.created.push(outpoint);
            }
        }

        debug!(
            "Coin view applied {block}: {} spent, {} created",
            undo.spent.len(),
            undo.created.len()
        );
        state.tip = block;
        state.undo.push_back(undo);
        while state.undo.len() > self.undo_depth {
            state.undo.pop_front();
        }
        Ok(())
    }

    async fn rewind(&self, block: HashHeight) -> Result<()> {
        let mut state = self.state.write().map_err(|_| anyhow!("coin view lock poisoned"))?;
        if state.tip != block {
            bail!("cannot rewind {block}: coin view tip is {}", state.tip);
        }
        let undo = state
            .undo
            .pop_back()
            .ok_or_else(|| anyhow!("no undo data left to rewind {block}"))?;
        if undo.block != block {
            bail!("undo data for {} does not match {block}", undo.block);
        }
        state.revert(undo);
        debug!("Coin view rewound to {}", state.tip);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_common::network::NetworkParams;
    use tessera_test_utils::{spend, ChainBuilder};

    fn setup() -> (ChainBuilder, InMemoryCoinView) {
        let chain = ChainBuilder::new(&NetworkParams::regtest());
        let view = InMemoryCoinView::new(chain.tip(), 10);
        (chain, view)
    }

    #[tokio::test]
    async fn apply_and_rewind_restore_the_set() {
        let (mut chain, view) = setup();
        chain.mine();
        view.apply(chain.hash_height(1), &chain.block(1)).await.unwrap();
        let cb = chain.coinbase_of(1);
        let coin = OutPoint::new(cb.txid(), 0);
        assert!(view.contains(&coin));

        let tx = spend(&cb, 0, &[10, 20]);
        chain.mine_with(vec![tx.clone()]);
        view.apply(chain.hash_height(2), &chain.block(2)).await.unwrap();
        assert!(!view.contains(&coin));
        assert!(view.contains(&OutPoint::new(tx.txid(), 1)));
        assert_eq!(view.tip().await.unwrap(), chain.hash_height(2));

        view.rewind(chain.hash_height(2)).await.unwrap();
        assert!(view.contains(&coin));
        assert!(!view.contains(&OutPoint::new(tx.txid(), 0)));
        assert_eq!(view.tip().await.unwrap(), chain.hash_height(1));
    }

    #[tokio::test]
    async fn fetch_returns_only_unspent() {
        let (mut chain, view) = setup();
        chain.mine();
        view.apply(chain.hash_height(1), &chain.block(1)).await.unwrap();
        let cb = chain.coinbase_of(1);
        let found = view
            .fetch_outputs(&[OutPoint::new(cb.txid(), 0), OutPoint::new(cb.txid(), 5)])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn out_of_order_operations_are_refused() {
        let (mut chain, view) = setup();
        chain.mine_n(2);
        assert!(view.apply(chain.hash_height(2), &chain.block(2)).await.is_err());
        assert!(view.rewind(chain.hash_height(1)).await.is_err());

        view.apply(chain.hash_height(1), &chain.block(1)).await.unwrap();
        assert!(view.rewind(chain.hash_height(2)).await.is_err());
    }

    #[tokio::test]
    async fn failed_apply_leaves_no_trace() {
        let (mut chain, view) = setup();
        chain.mine();
        view.apply(chain.hash_height(1), &chain.block(1)).await.unwrap();
        let cb = chain.coinbase_of(1);
        let before = view.len();

        let good = spend(&cb, 0, &[1]);
        let bad = spend(&chain.coinbase_of(1), 3, &[1]);
        chain.mine_with(vec![good, bad]);
        assert!(view.apply(chain.hash_height(2), &chain.block(2)).await.is_err());
        assert_eq!(view.len(), before);
        assert!(view.contains(&OutPoint::new(cb.txid(), 0)));
        assert_eq!(view.tip().await.unwrap(), chain.hash_height(1));
    }

    #[tokio::test]
    async fn undo_depth_is_bounded() {
        let chain_params = NetworkParams::regtest();
        let mut chain = ChainBuilder::new(&chain_params);
        let view = InMemoryCoinView::new(chain.tip(), 1);
        chain.mine_n(2);
        view.apply(chain.hash_height(1), &chain.block(1)).await.unwrap();
        view.apply(chain.hash_height(2), &chain.block(2)).await.unwrap();
        view.rewind(chain.hash_height(2)).await.unwrap();
        assert!(view.rewind(chain.hash_height(1)).await.is_err());
    }
}
