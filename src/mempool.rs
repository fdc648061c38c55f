use std::collections::HashMap;

use tracing::debug;

use crate::errors::{ChainError, ChainResult};
use crate::state::SidechainState;
use crate::types::{SidechainBlock, SidechainTransaction, TxId};

/// Pending transactions waiting for inclusion, keyed by transaction id.
pub struct MemoryPool {
    transactions: HashMap<TxId, SidechainTransaction>,
    limit: usize,
}

impl MemoryPool {
    pub fn new(limit: usize) -> Self {
        Self {
            transactions: HashMap::new(),
            limit,
        }
    }

    pub fn put(&mut self, tx: SidechainTransaction) -> ChainResult<()> {
        if self.transactions.len() >= self.limit {
            return Err(ChainError::Validation("mempool full".into()));
        }
        if self.transactions.contains_key(&tx.id()) {
            return Err(ChainError::Validation("transaction already queued".into()));
        }
        self.transactions.insert(tx.id(), tx);
        Ok(())
    }

    pub fn contains(&self, tx_id: &TxId) -> bool {
        self.transactions.contains_key(tx_id)
    }

    pub fn remove(&mut self, tx_id: &TxId) -> Option<SidechainTransaction> {
        self.transactions.remove(tx_id)
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Highest-fee transactions first.
    pub fn take(&self, limit: usize) -> Vec<SidechainTransaction> {
        let mut pending: Vec<SidechainTransaction> = self.transactions.values().cloned().collect();
        pending.sort_by(|a, b| b.fee().cmp(&a.fee()).then(a.id().cmp(&b.id())));
        pending.truncate(limit);
        pending
    }

    /// Reconciles the pool after a block application: transactions included
    /// in applied blocks leave the pool, transactions of rolled-back blocks
    /// are re-admitted, and anything that no longer opens unspent boxes is
    /// dropped.
    pub fn update_after_application(
        &mut self,
        removed_blocks: &[SidechainBlock],
        applied_blocks: &[SidechainBlock],
        state: &SidechainState,
    ) -> ChainResult<()> {
        for block in applied_blocks {
            for tx in &block.transactions {
                self.transactions.remove(&tx.id());
            }
        }
        for block in removed_blocks {
            for tx in &block.transactions {
                if self.transactions.len() >= self.limit {
                    break;
                }
                self.transactions.entry(tx.id()).or_insert_with(|| tx.clone());
            }
        }
        let mut dropped = Vec::new();
        for (tx_id, tx) in &self.transactions {
            for box_id in tx.box_ids_to_open() {
                if state.get_box(box_id)?.is_none() {
                    dropped.push(*tx_id);
                    break;
                }
            }
        }
        for tx_id in dropped {
            debug!(tx = %hex::encode(tx_id), "dropping transaction with spent inputs");
            self.transactions.remove(&tx_id);
        }
        Ok(())
    }
}
