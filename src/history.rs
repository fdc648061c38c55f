use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::crypto::{blake2b256_of_slices, random_version};
use crate::errors::{ChainError, ChainResult};
use crate::storage::VersionedStore;
use crate::types::{BlockId, SidechainBlock, SidechainBox};

const BLOCK_KEY_PREFIX: &[u8] = b"b/";
const INFO_KEY_PREFIX: &[u8] = b"i/";
const CHAIN_KEY_PREFIX: &[u8] = b"c/";
const BEST_BLOCK_KEY: &[u8] = b"best";
const EPOCH_KEY_PREFIX: &[u8] = b"e/";
const FEE_INFO_KEY_PREFIX: &[u8] = b"f/";
const EPOCH_NONCE_DOMAIN: &[u8] = b"sdc-epoch-nonce";

/// Delta between the current best chain and a newly offered block.
#[derive(Clone, Debug, Default)]
pub struct ProgressInfo {
    pub branch_point: Option<BlockId>,
    pub to_remove: Vec<SidechainBlock>,
    pub to_apply: Vec<SidechainBlock>,
    pub to_download: Vec<BlockId>,
}

impl ProgressInfo {
    pub fn chain_switching_needed(&self) -> bool {
        self.branch_point.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.branch_point.is_none()
            && self.to_remove.is_empty()
            && self.to_apply.is_empty()
            && self.to_download.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
enum ModifierValidity {
    Pending,
    Valid,
    Invalid,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct BlockInfo {
    height: u64,
    parent_id: BlockId,
    validity: ModifierValidity,
}

/// Consensus data of one epoch as recorded by history: the stake snapshot
/// root extracted from state plus the epoch nonce.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullConsensusEpochInfo {
    pub epoch: u32,
    pub stake_merkle_root: [u8; 32],
    pub forgers_stake_total: u64,
    pub nonce: [u8; 32],
}

/// Ordered block graph with a best-chain pointer. Writes use random storage
/// versions: history is append-only and never rolled back, the pointer flip
/// in `report_modifier_is_valid` is the atomic crossing point for recovery.
pub struct SidechainHistory {
    store: VersionedStore,
    consensus_store: VersionedStore,
}

impl SidechainHistory {
    pub fn restore(store: VersionedStore, consensus_store: VersionedStore) -> Self {
        Self {
            store,
            consensus_store,
        }
    }

    pub fn contains(&self, block_id: &BlockId) -> ChainResult<bool> {
        Ok(self.store.get(&block_key(block_id))?.is_some())
    }

    pub fn block_by_id(&self, block_id: &BlockId) -> ChainResult<Option<SidechainBlock>> {
        match self.store.get(&block_key(block_id))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn block_info(&self, block_id: &BlockId) -> ChainResult<Option<BlockInfo>> {
        match self.store.get(&info_key(block_id))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn best_block_id(&self) -> ChainResult<Option<BlockId>> {
        match self.store.get(BEST_BLOCK_KEY)? {
            Some(bytes) => {
                let mut id = [0u8; 32];
                if bytes.len() != id.len() {
                    return Err(ChainError::Consistency(
                        "invalid best block pointer encoding".into(),
                    ));
                }
                id.copy_from_slice(&bytes);
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }

    pub fn best_block(&self) -> ChainResult<Option<SidechainBlock>> {
        match self.best_block_id()? {
            Some(id) => self.block_by_id(&id),
            None => Ok(None),
        }
    }

    pub fn height_of(&self, block_id: &BlockId) -> ChainResult<Option<u64>> {
        Ok(self.block_info(block_id)?.map(|info| info.height))
    }

    pub fn best_height(&self) -> ChainResult<Option<u64>> {
        match self.best_block_id()? {
            Some(id) => self.height_of(&id),
            None => Ok(None),
        }
    }

    fn block_id_at_height(&self, height: u64) -> ChainResult<Option<BlockId>> {
        match self.store.get(&chain_key(height))? {
            Some(bytes) => {
                let mut id = [0u8; 32];
                if bytes.len() != id.len() {
                    return Err(ChainError::Consistency(
                        "invalid active chain index encoding".into(),
                    ));
                }
                id.copy_from_slice(&bytes);
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }

    pub fn is_in_active_chain(&self, block_id: &BlockId) -> ChainResult<bool> {
        let info = match self.block_info(block_id)? {
            Some(info) => info,
            None => return Ok(false),
        };
        let best_height = match self.best_height()? {
            Some(height) => height,
            None => return Ok(false),
        };
        if info.height > best_height {
            return Ok(false);
        }
        Ok(self.block_id_at_height(info.height)? == Some(*block_id))
    }

    /// Stores a new block and computes the progress against the best chain:
    /// an extension of the tip applies directly, a heavier fork triggers a
    /// chain switch from the common ancestor, an unknown parent produces a
    /// download request, everything else is kept for later.
    pub fn append(&mut self, block: &SidechainBlock) -> ChainResult<ProgressInfo> {
        let block_id = block.id();
        if self.contains(&block_id)? {
            return Ok(ProgressInfo::default());
        }
        let genesis = self.store.get(BEST_BLOCK_KEY)?.is_none() && self.store.is_empty()?;
        let height = if genesis {
            0
        } else {
            match self.block_info(&block.parent_id)? {
                Some(parent_info) => parent_info.height + 1,
                None => {
                    debug!(
                        block = %hex::encode(block_id),
                        parent = %hex::encode(block.parent_id),
                        "offered block with unknown parent"
                    );
                    return Ok(ProgressInfo {
                        to_download: vec![block.parent_id],
                        ..ProgressInfo::default()
                    });
                }
            }
        };
        let block_info = BlockInfo {
            height,
            parent_id: block.parent_id,
            validity: ModifierValidity::Pending,
        };
        self.store.update(
            random_version(),
            vec![
                (block_key(&block_id), bincode::serialize(block)?),
                (info_key(&block_id), bincode::serialize(&block_info)?),
            ],
            Vec::new(),
        )?;

        let best = self.best_block_id()?;
        match best {
            None => Ok(ProgressInfo {
                to_apply: vec![block.clone()],
                ..ProgressInfo::default()
            }),
            Some(best_id) if block.parent_id == best_id => Ok(ProgressInfo {
                to_apply: vec![block.clone()],
                ..ProgressInfo::default()
            }),
            Some(best_id) => {
                let best_height = self.height_of(&best_id)?.ok_or_else(|| {
                    ChainError::Consistency("best block has no stored info".into())
                })?;
                if height <= best_height {
                    debug!(
                        block = %hex::encode(block_id),
                        height,
                        best_height,
                        "stored fork block below the best chain"
                    );
                    return Ok(ProgressInfo::default());
                }
                match self.fork_chain_to_active(block)? {
                    Some((branch_point, fork_chain)) => {
                        let to_remove = self.active_suffix_after(&branch_point, best_height)?;
                        info!(
                            block = %hex::encode(block_id),
                            branch_point = %hex::encode(branch_point),
                            removing = to_remove.len(),
                            applying = fork_chain.len(),
                            "chain switch needed"
                        );
                        Ok(ProgressInfo {
                            branch_point: Some(branch_point),
                            to_remove,
                            to_apply: fork_chain,
                            to_download: Vec::new(),
                        })
                    }
                    None => Ok(ProgressInfo::default()),
                }
            }
        }
    }

    /// Walks the fork containing `block` back to the active chain. Returns
    /// the branch point and the fork blocks in application order, or None if
    /// the fork passes through an invalid block.
    fn fork_chain_to_active(
        &self,
        block: &SidechainBlock,
    ) -> ChainResult<Option<(BlockId, Vec<SidechainBlock>)>> {
        let mut chain = vec![block.clone()];
        let mut parent_id = block.parent_id;
        loop {
            if self.is_in_active_chain(&parent_id)? {
                chain.reverse();
                return Ok(Some((parent_id, chain)));
            }
            let parent_info = match self.block_info(&parent_id)? {
                Some(info) => info,
                None => return Ok(None),
            };
            if parent_info.validity == ModifierValidity::Invalid {
                return Ok(None);
            }
            let parent = self.block_by_id(&parent_id)?.ok_or_else(|| {
                ChainError::Consistency("fork block info without block body".into())
            })?;
            parent_id = parent.parent_id;
            chain.push(parent);
        }
    }

    fn active_suffix_after(
        &self,
        branch_point: &BlockId,
        best_height: u64,
    ) -> ChainResult<Vec<SidechainBlock>> {
        let branch_height = self.height_of(branch_point)?.ok_or_else(|| {
            ChainError::Consistency("branch point has no stored info".into())
        })?;
        let mut suffix = Vec::new();
        for height in (branch_height + 1)..=best_height {
            let block_id = self.block_id_at_height(height)?.ok_or_else(|| {
                ChainError::Consistency(format!("active chain index missing height {height}"))
            })?;
            let block = self.block_by_id(&block_id)?.ok_or_else(|| {
                ChainError::Consistency("active chain block body missing".into())
            })?;
            suffix.push(block);
        }
        Ok(suffix)
    }

    /// Marks a block semantically valid and flips the best-block pointer.
    /// This is the last write of a block application.
    pub fn report_modifier_is_valid(&mut self, block: &SidechainBlock) -> ChainResult<()> {
        let block_id = block.id();
        let mut block_info = self.block_info(&block_id)?.ok_or_else(|| {
            ChainError::Consistency("reported block was never appended".into())
        })?;
        block_info.validity = ModifierValidity::Valid;
        self.store.update(
            random_version(),
            vec![
                (info_key(&block_id), bincode::serialize(&block_info)?),
                (chain_key(block_info.height), block_id.to_vec()),
                (BEST_BLOCK_KEY.to_vec(), block_id.to_vec()),
            ],
            Vec::new(),
        )?;
        debug!(block = %hex::encode(block_id), height = block_info.height, "best block updated");
        Ok(())
    }

    /// Marks a failed block (and its stored descendants) invalid. When a
    /// chain switch was in flight the returned progress re-applies the
    /// previously active suffix; otherwise it is empty and the caller stops.
    pub fn report_modifier_is_invalid(
        &mut self,
        block: &SidechainBlock,
        progress: &ProgressInfo,
    ) -> ChainResult<ProgressInfo> {
        let block_id = block.id();
        warn!(block = %hex::encode(block_id), "marking block invalid");
        let mut children: HashMap<BlockId, Vec<BlockId>> = HashMap::new();
        let mut infos: HashMap<BlockId, BlockInfo> = HashMap::new();
        for (key, value) in self.store.get_all()? {
            if !key.starts_with(INFO_KEY_PREFIX) {
                continue;
            }
            let mut id = [0u8; 32];
            if key.len() != INFO_KEY_PREFIX.len() + id.len() {
                continue;
            }
            id.copy_from_slice(&key[INFO_KEY_PREFIX.len()..]);
            let stored: BlockInfo = bincode::deserialize(&value)?;
            children.entry(stored.parent_id).or_default().push(id);
            infos.insert(id, stored);
        }
        let mut puts = Vec::new();
        let mut queue = vec![block_id];
        while let Some(current) = queue.pop() {
            if let Some(mut current_info) = infos.remove(&current) {
                current_info.validity = ModifierValidity::Invalid;
                puts.push((info_key(&current), bincode::serialize(&current_info)?));
                if let Some(descendants) = children.get(&current) {
                    queue.extend(descendants.iter().copied());
                }
            }
        }
        self.store.update(random_version(), puts, Vec::new())?;

        if progress.chain_switching_needed() {
            Ok(ProgressInfo {
                branch_point: progress.branch_point,
                to_remove: Vec::new(),
                to_apply: progress.to_remove.clone(),
                to_download: Vec::new(),
            })
        } else {
            Ok(ProgressInfo::default())
        }
    }

    /// Walks parent links from `from` until the predicate holds, returning
    /// the path whose head is the first matching ancestor.
    pub fn chain_back<F>(
        &self,
        from: BlockId,
        predicate: F,
        limit: usize,
    ) -> ChainResult<Option<Vec<BlockId>>>
    where
        F: Fn(&Self, &BlockId) -> ChainResult<bool>,
    {
        let mut current = from;
        let mut path = vec![current];
        loop {
            if predicate(self, &current)? {
                path.reverse();
                return Ok(Some(path));
            }
            if path.len() >= limit {
                return Ok(None);
            }
            let info = match self.block_info(&current)? {
                Some(info) => info,
                None => return Ok(None),
            };
            if info.height == 0 {
                return Ok(None);
            }
            current = info.parent_id;
            if self.block_info(&current)?.is_none() {
                return Ok(None);
            }
            path.push(current);
        }
    }

    pub fn consensus_nonce_for_epoch(&self, epoch: u32, last_block_in_epoch: &BlockId) -> [u8; 32] {
        blake2b256_of_slices(&[EPOCH_NONCE_DOMAIN, &epoch.to_le_bytes(), last_block_in_epoch])
    }

    pub fn apply_full_consensus_epoch_info(
        &mut self,
        info: &FullConsensusEpochInfo,
    ) -> ChainResult<()> {
        self.consensus_store.update(
            random_version(),
            vec![(epoch_key(info.epoch), bincode::serialize(info)?)],
            Vec::new(),
        )
    }

    pub fn full_consensus_epoch_info(
        &self,
        epoch: u32,
    ) -> ChainResult<Option<FullConsensusEpochInfo>> {
        match self.consensus_store.get(&epoch_key(epoch))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn update_fee_payments_info(
        &mut self,
        block_id: &BlockId,
        payments: &[SidechainBox],
    ) -> ChainResult<()> {
        self.consensus_store.update(
            random_version(),
            vec![(fee_info_key(block_id), bincode::serialize(&payments)?)],
            Vec::new(),
        )
    }

    pub fn fee_payments_info(&self, block_id: &BlockId) -> ChainResult<Option<Vec<SidechainBox>>> {
        match self.consensus_store.get(&fee_info_key(block_id))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }
}

fn block_key(block_id: &BlockId) -> Vec<u8> {
    [BLOCK_KEY_PREFIX, block_id.as_slice()].concat()
}

fn info_key(block_id: &BlockId) -> Vec<u8> {
    [INFO_KEY_PREFIX, block_id.as_slice()].concat()
}

fn chain_key(height: u64) -> Vec<u8> {
    [CHAIN_KEY_PREFIX, height.to_be_bytes().as_slice()].concat()
}

fn epoch_key(epoch: u32) -> Vec<u8> {
    [EPOCH_KEY_PREFIX, epoch.to_be_bytes().as_slice()].concat()
}

fn fee_info_key(block_id: &BlockId) -> Vec<u8> {
    [FEE_INFO_KEY_PREFIX, block_id.as_slice()].concat()
}
