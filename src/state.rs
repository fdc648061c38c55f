use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ChainParams;
use crate::crypto::blake2b256_of_slices;
use crate::errors::{ChainError, ChainResult};
use crate::interfaces::ApplicationState;
use crate::merkle::{MerklePath, MerkleTree};
use crate::secret::PublicKey25519Proposition;
use crate::storage::VersionedStore;
use crate::types::{
    BoxId, CoinBox, ForgerBox, SidechainBlock, SidechainBox, SidechainRelatedOutput, Version,
    WithdrawalEpochCertificate,
};

const BOX_KEY_PREFIX: &[u8] = b"b/";
const FEE_KEY_PREFIX: &[u8] = b"f/";
const CERT_KEY_PREFIX: &[u8] = b"c/";
const META_WITHDRAWAL_EPOCH: &[u8] = b"m/withdrawal_epoch";
const META_CONSENSUS_EPOCH: &[u8] = b"m/consensus_epoch";
const META_HEIGHT: &[u8] = b"m/height";
const FEE_NONCE_DOMAIN: &[u8] = b"sdc-fee-payment";

/// Box deltas one block contributes to the UTXO set.
pub struct BoxChanges {
    pub to_append: Vec<SidechainBox>,
    pub to_remove: Vec<BoxId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalEpochInfo {
    pub epoch: u32,
    pub index: u32,
}

#[derive(Clone, Debug)]
pub struct ConsensusEpochInfo {
    pub epoch: u32,
    pub forging_stake_tree: MerkleTree,
    pub forgers_stake_total: u64,
}

#[derive(Serialize, Deserialize)]
struct FeeRecord {
    proposition: PublicKey25519Proposition,
    fee: u64,
}

/// Snapshot of the UTXO Merkle tree handed to the wallet by value when
/// withdrawal evidence has to be materialized.
#[derive(Clone)]
pub struct UtxoMerkleTreeView {
    tree: MerkleTree,
    positions: HashMap<BoxId, usize>,
}

impl UtxoMerkleTreeView {
    pub(crate) fn from_entries(mut entries: Vec<(BoxId, [u8; 32])>) -> Self {
        entries.sort_by_key(|(box_id, _)| *box_id);
        let mut positions = HashMap::with_capacity(entries.len());
        let mut leaves = Vec::with_capacity(entries.len());
        for (index, (box_id, leaf)) in entries.into_iter().enumerate() {
            positions.insert(box_id, index);
            leaves.push(leaf);
        }
        Self {
            tree: MerkleTree::from_leaves(leaves),
            positions,
        }
    }

    pub fn root(&self) -> [u8; 32] {
        self.tree.root()
    }

    pub fn merkle_path(&self, box_id: &BoxId) -> Option<MerklePath> {
        self.positions
            .get(box_id)
            .and_then(|index| self.tree.path_for(*index))
    }
}

/// Derives the box deltas of a block. The wallet consumes the same contract
/// when scanning, so both sides agree on appended ids.
pub fn extract_box_changes(block: &SidechainBlock) -> ChainResult<BoxChanges> {
    let mut to_append = Vec::new();
    let mut to_remove = Vec::new();
    for tx in &block.transactions {
        to_remove.extend(tx.box_ids_to_open().iter().copied());
        to_append.extend(tx.new_boxes().iter().cloned());
    }
    for reference in &block.mainchain_references {
        if let Some(aggregated) = &reference.aggregated_transaction {
            for output in &aggregated.sidechain_related_outputs {
                if let SidechainRelatedOutput::ForwardTransfer(transfer) = output {
                    to_append.push(SidechainBox::Coin(transfer.to_coin_box()));
                }
            }
        }
    }
    let mut appended_ids = HashSet::new();
    for appended in &to_append {
        if !appended_ids.insert(appended.id()) {
            return Err(ChainError::StateApply(format!(
                "box {} created twice in one block",
                hex::encode(appended.id())
            )));
        }
    }
    let mut removed_ids = HashSet::new();
    for removed in &to_remove {
        if !removed_ids.insert(*removed) {
            return Err(ChainError::StateApply(format!(
                "box {} opened twice in one block",
                hex::encode(removed)
            )));
        }
        if appended_ids.contains(removed) {
            return Err(ChainError::StateApply(format!(
                "box {} appears in both the append and remove sets",
                hex::encode(removed)
            )));
        }
    }
    Ok(BoxChanges {
        to_append,
        to_remove,
    })
}

pub struct SidechainState {
    store: VersionedStore,
    forger_box_store: VersionedStore,
    utxo_store: VersionedStore,
    params: ChainParams,
    application_state: Box<dyn ApplicationState>,
    utxo_view_cache: RwLock<Option<(Version, UtxoMerkleTreeView)>>,
}

impl SidechainState {
    pub fn restore(
        store: VersionedStore,
        forger_box_store: VersionedStore,
        utxo_store: VersionedStore,
        params: ChainParams,
        application_state: Box<dyn ApplicationState>,
    ) -> Self {
        Self {
            store,
            forger_box_store,
            utxo_store,
            params,
            application_state,
            utxo_view_cache: RwLock::new(None),
        }
    }

    pub fn version(&self) -> ChainResult<Option<Version>> {
        self.store.last_version_id()
    }

    pub fn get_box(&self, box_id: &BoxId) -> ChainResult<Option<SidechainBox>> {
        match self.store.get(&box_key(box_id))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn boxes(&self) -> ChainResult<Vec<SidechainBox>> {
        let mut boxes = Vec::new();
        for (key, value) in self.store.get_all()? {
            if key.starts_with(BOX_KEY_PREFIX) {
                boxes.push(bincode::deserialize(&value)?);
            }
        }
        Ok(boxes)
    }

    pub fn withdrawal_epoch_info(&self) -> ChainResult<WithdrawalEpochInfo> {
        match self.store.get(META_WITHDRAWAL_EPOCH)? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Ok(WithdrawalEpochInfo { epoch: 0, index: 0 }),
        }
    }

    pub fn is_withdrawal_epoch_last_index(&self) -> ChainResult<bool> {
        Ok(self.withdrawal_epoch_info()?.index == self.params.withdrawal_epoch_length)
    }

    pub fn height(&self) -> ChainResult<u64> {
        match self.store.get(META_HEIGHT)? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Ok(0),
        }
    }

    fn stored_consensus_epoch(&self) -> ChainResult<Option<u32>> {
        match self.store.get(META_CONSENSUS_EPOCH)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// True when the given block opens a new consensus epoch relative to the
    /// current tip.
    pub fn is_switching_consensus_epoch(&self, block: &SidechainBlock) -> ChainResult<bool> {
        match self.stored_consensus_epoch()? {
            Some(current) => Ok(self
                .params
                .consensus_epoch_for_timestamp(block.timestamp)
                != current),
            None => Ok(false),
        }
    }

    /// Stake snapshot of the consensus epoch the current tip belongs to,
    /// together with the tip id closing that epoch.
    pub fn current_consensus_epoch_info(&self) -> ChainResult<(Version, ConsensusEpochInfo)> {
        let version = self
            .version()?
            .ok_or_else(|| ChainError::Consistency("state storage is empty".into()))?;
        let epoch = self
            .stored_consensus_epoch()?
            .ok_or_else(|| ChainError::Consistency("state has no consensus epoch".into()))?;
        let mut forger_boxes: Vec<ForgerBox> = Vec::new();
        for (_key, value) in self.forger_box_store.get_all()? {
            forger_boxes.push(bincode::deserialize(&value)?);
        }
        forger_boxes.sort_by_key(|forger| SidechainBox::Forger(forger.clone()).id());
        let mut total: u64 = 0;
        let mut leaves = Vec::with_capacity(forger_boxes.len());
        for forger in &forger_boxes {
            total = total.saturating_add(forger.value);
            leaves.push(forger.forging_stake_info().hash());
        }
        Ok((
            version,
            ConsensusEpochInfo {
                epoch,
                forging_stake_tree: MerkleTree::from_leaves(leaves),
                forgers_stake_total: total,
            },
        ))
    }

    pub fn get_top_quality_certificate(
        &self,
        epoch: i32,
    ) -> ChainResult<Option<WithdrawalEpochCertificate>> {
        match self.store.get(&cert_key(epoch))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// One coin box per forger that produced a block in the epoch, carrying
    /// the summed fees of those blocks.
    pub fn get_fee_payments(&self, epoch: u32) -> ChainResult<Vec<SidechainBox>> {
        let records: Vec<FeeRecord> = match self.store.get(&fee_key(epoch))? {
            Some(bytes) => bincode::deserialize(&bytes)?,
            None => Vec::new(),
        };
        Ok(fee_payments_from_records(&records, epoch))
    }

    pub fn utxo_merkle_tree_view(&self) -> ChainResult<UtxoMerkleTreeView> {
        let version = self
            .version()?
            .ok_or_else(|| ChainError::Consistency("state storage is empty".into()))?;
        if let Some((cached_version, view)) = self.utxo_view_cache.read().as_ref() {
            if cached_version == &version {
                return Ok(view.clone());
            }
        }
        let mut entries: Vec<(BoxId, [u8; 32])> = Vec::new();
        for (key, value) in self.utxo_store.get_all()? {
            let mut box_id = [0u8; 32];
            if key.len() != box_id.len() {
                return Err(ChainError::Consistency(
                    "invalid utxo merkle tree key length".into(),
                ));
            }
            box_id.copy_from_slice(&key);
            let mut leaf = [0u8; 32];
            if value.len() != leaf.len() {
                return Err(ChainError::Consistency(
                    "invalid utxo merkle tree leaf length".into(),
                ));
            }
            leaf.copy_from_slice(&value);
            entries.push((box_id, leaf));
        }
        let view = UtxoMerkleTreeView::from_entries(entries);
        *self.utxo_view_cache.write() = Some((version, view.clone()));
        Ok(view)
    }

    /// Validates a block against the UTXO rules and applies its writeset
    /// across the three state stores; the base store is written last and acts
    /// as the commit point for the restart symmetry check.
    pub fn apply_modifier(&mut self, block: &SidechainBlock) -> ChainResult<()> {
        let version = block.id();
        match self.version()? {
            Some(tip) => {
                if block.parent_id != tip {
                    return Err(ChainError::StateApply(format!(
                        "block parent {} does not match state tip {}",
                        hex::encode(block.parent_id),
                        hex::encode(tip)
                    )));
                }
            }
            None => {}
        }
        self.application_state
            .validate_block(block)
            .map_err(|err| ChainError::StateApply(format!("application rejected block: {err}")))?;

        let changes = extract_box_changes(block)?;

        let mut opened: HashMap<BoxId, SidechainBox> = HashMap::new();
        for box_id in &changes.to_remove {
            let stored = self.get_box(box_id)?.ok_or_else(|| {
                ChainError::StateApply(format!("box {} is not unspent", hex::encode(box_id)))
            })?;
            opened.insert(*box_id, stored);
        }
        for tx in &block.transactions {
            let mut input_total: u64 = 0;
            for box_id in tx.box_ids_to_open() {
                let stored = opened.get(box_id).ok_or_else(|| {
                    ChainError::StateApply(format!("box {} is not unspent", hex::encode(box_id)))
                })?;
                input_total = input_total.checked_add(stored.value()).ok_or_else(|| {
                    ChainError::StateApply("transaction input value overflow".into())
                })?;
            }
            let mut output_total: u64 = tx.fee();
            for output in tx.new_boxes() {
                output_total = output_total.checked_add(output.value()).ok_or_else(|| {
                    ChainError::StateApply("transaction output value overflow".into())
                })?;
            }
            if input_total != output_total {
                return Err(ChainError::StateApply(format!(
                    "transaction {} does not conserve value",
                    hex::encode(tx.id())
                )));
            }
        }

        let removed_ids = changes.to_remove.clone();

        // withdrawal epoch advances by the number of mainchain references
        let previous_epoch_info = self.withdrawal_epoch_info()?;
        let references = block.mainchain_references.len() as u32;
        let epoch_info = if self.version()?.is_none() {
            WithdrawalEpochInfo {
                epoch: 0,
                index: references.min(self.params.withdrawal_epoch_length),
            }
        } else if previous_epoch_info.index >= self.params.withdrawal_epoch_length {
            WithdrawalEpochInfo {
                epoch: previous_epoch_info.epoch + 1,
                index: references.min(self.params.withdrawal_epoch_length),
            }
        } else {
            WithdrawalEpochInfo {
                epoch: previous_epoch_info.epoch,
                index: (previous_epoch_info.index + references)
                    .min(self.params.withdrawal_epoch_length),
            }
        };

        let mut fee_records: Vec<FeeRecord> = match self.store.get(&fee_key(epoch_info.epoch))? {
            Some(bytes) => bincode::deserialize(&bytes)?,
            None => Vec::new(),
        };
        let block_fees: u64 = block.transactions.iter().map(|tx| tx.fee()).sum();
        fee_records.push(FeeRecord {
            proposition: block.forger_proposition,
            fee: block_fees,
        });

        let mut appended = changes.to_append;
        let mut fee_payment_boxes = Vec::new();
        if epoch_info.index == self.params.withdrawal_epoch_length {
            // derive the payout boxes from the full epoch record set so the
            // wallet sees the same box ids through get_fee_payments
            fee_payment_boxes = fee_payments_from_records(&fee_records, epoch_info.epoch);
            appended.extend(fee_payment_boxes.iter().cloned());
        }

        // the hook precedes every store write; a failure leaves nothing behind
        self.application_state
            .on_apply_changes(&version, &appended, &removed_ids)
            .map_err(|err| ChainError::ApplicationHook(err.to_string()))?;

        let mut forger_puts = Vec::new();
        let mut forger_deletes = Vec::new();
        let mut utxo_puts = Vec::new();
        let mut utxo_deletes = Vec::new();
        let mut base_puts = Vec::new();
        let mut base_deletes = Vec::new();

        for sidechain_box in &appended {
            let box_id = sidechain_box.id();
            base_puts.push((box_key(&box_id), bincode::serialize(sidechain_box)?));
            if let SidechainBox::Forger(forger) = sidechain_box {
                forger_puts.push((box_id.to_vec(), bincode::serialize(forger)?));
            }
            if sidechain_box.is_coin() {
                utxo_puts.push((box_id.to_vec(), utxo_leaf_hash(sidechain_box).to_vec()));
            }
        }
        for box_id in &removed_ids {
            base_deletes.push(box_key(box_id));
            if self.forger_box_store.get(box_id)?.is_some() {
                forger_deletes.push(box_id.to_vec());
            }
            if self.utxo_store.get(box_id)?.is_some() {
                utxo_deletes.push(box_id.to_vec());
            }
        }

        base_puts.push((
            META_WITHDRAWAL_EPOCH.to_vec(),
            bincode::serialize(&epoch_info)?,
        ));
        base_puts.push((
            META_CONSENSUS_EPOCH.to_vec(),
            bincode::serialize(&self.params.consensus_epoch_for_timestamp(block.timestamp))?,
        ));
        base_puts.push((META_HEIGHT.to_vec(), bincode::serialize(&(self.height()? + 1))?));
        base_puts.push((
            fee_key(epoch_info.epoch),
            bincode::serialize(&fee_records)?,
        ));
        for reference in &block.mainchain_references {
            if let Some(certificate) = &reference.top_quality_certificate {
                base_puts.push((
                    cert_key(certificate.epoch_number),
                    bincode::serialize(certificate)?,
                ));
            }
        }

        self.forger_box_store
            .update(version, forger_puts, forger_deletes)?;
        self.utxo_store.update(version, utxo_puts, utxo_deletes)?;
        self.store.update(version, base_puts, base_deletes)?;
        debug!(
            block = %hex::encode(version),
            appended = appended.len(),
            removed = removed_ids.len(),
            fee_payments = fee_payment_boxes.len(),
            "applied block to state"
        );
        Ok(())
    }

    pub fn rollback(&mut self, to: Version) -> ChainResult<()> {
        info!(version = %hex::encode(to), "rolling back state");
        self.store.rollback(to)?;
        self.utxo_store.rollback(to)?;
        self.forger_box_store.rollback(to)?;
        *self.utxo_view_cache.write() = None;
        self.application_state
            .on_rollback(&to)
            .map_err(|err| ChainError::ApplicationHook(err.to_string()))?;
        Ok(())
    }

    /// Restores internal symmetry between the base store and its two
    /// sub-stores. The sub-stores are written before the base store, so after
    /// a crash they may lead by exactly one version and are rolled back.
    pub fn ensure_storage_consistency_after_restore(&mut self) -> ChainResult<()> {
        let version = self
            .store
            .last_version_id()?
            .ok_or_else(|| ChainError::Consistency("state storage is empty".into()))?;
        if !self.application_state.check_storages_version(&version) {
            return Err(ChainError::Consistency(
                "application state storage version mismatch".into(),
            ));
        }
        for sub_store in [&self.forger_box_store, &self.utxo_store] {
            if sub_store.last_version_id()? == Some(version) {
                continue;
            }
            let recent = sub_store.rollback_versions(2)?;
            if recent.len() == 2 && recent[1] == version {
                info!(
                    store = sub_store.name(),
                    version = %hex::encode(version),
                    "rolling back state sub-storage after restart"
                );
                sub_store.rollback(version)?;
            } else {
                return Err(ChainError::Consistency(format!(
                    "state sub-storage {} cannot be reconciled",
                    sub_store.name()
                )));
            }
        }
        *self.utxo_view_cache.write() = None;
        Ok(())
    }
}

fn fee_payments_from_records(records: &[FeeRecord], epoch: u32) -> Vec<SidechainBox> {
    let mut order: Vec<PublicKey25519Proposition> = Vec::new();
    let mut totals: HashMap<PublicKey25519Proposition, u64> = HashMap::new();
    for record in records {
        if !totals.contains_key(&record.proposition) {
            order.push(record.proposition);
        }
        let entry = totals.entry(record.proposition).or_insert(0);
        *entry = entry.saturating_add(record.fee);
    }
    let mut payments = Vec::new();
    for proposition in order {
        let total = totals[&proposition];
        if total == 0 {
            continue;
        }
        let nonce_bytes = blake2b256_of_slices(&[
            FEE_NONCE_DOMAIN,
            &epoch.to_be_bytes(),
            proposition.bytes(),
        ]);
        let mut nonce = [0u8; 8];
        nonce.copy_from_slice(&nonce_bytes[..8]);
        payments.push(SidechainBox::Coin(CoinBox {
            proposition,
            value: total,
            nonce: u64::from_be_bytes(nonce),
        }));
    }
    payments
}

fn box_key(box_id: &BoxId) -> Vec<u8> {
    [BOX_KEY_PREFIX, box_id.as_slice()].concat()
}

fn fee_key(epoch: u32) -> Vec<u8> {
    [FEE_KEY_PREFIX, epoch.to_be_bytes().as_slice()].concat()
}

fn cert_key(epoch: i32) -> Vec<u8> {
    [CERT_KEY_PREFIX, epoch.to_be_bytes().as_slice()].concat()
}

pub(crate) fn utxo_leaf_hash(sidechain_box: &SidechainBox) -> [u8; 32] {
    blake2b256_of_slices(&[
        &sidechain_box.id(),
        &sidechain_box.value().to_le_bytes(),
        &sidechain_box.custom_fields_hash(),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChainParams;
    use crate::interfaces::DefaultApplicationState;
    use crate::storage::NodeStorages;
    use crate::types::{
        AggregatedTransaction, ForwardTransferOutput, MainchainBlockReferenceData,
        SidechainTransaction,
    };
    use tempfile::TempDir;

    fn proposition(tag: u8) -> PublicKey25519Proposition {
        PublicKey25519Proposition([tag; 32])
    }

    fn params() -> ChainParams {
        ChainParams {
            withdrawal_epoch_length: 2,
            consensus_slots_per_epoch: 10,
            consensus_slot_duration_secs: 10,
            genesis_timestamp: 1_000,
        }
    }

    fn new_state(storages: &NodeStorages) -> SidechainState {
        SidechainState::restore(
            storages.state(),
            storages.state_forger_boxes(),
            storages.utxo_merkle_tree(),
            params(),
            Box::new(DefaultApplicationState),
        )
    }

    fn mainchain_reference(transfers: Vec<ForwardTransferOutput>) -> MainchainBlockReferenceData {
        MainchainBlockReferenceData {
            header_hash: [0x77; 32],
            aggregated_transaction: Some(AggregatedTransaction {
                sidechain_related_outputs: transfers
                    .into_iter()
                    .map(SidechainRelatedOutput::ForwardTransfer)
                    .collect(),
            }),
            top_quality_certificate: None,
        }
    }

    fn transfer(tag: u8, amount: u64, index: u32) -> ForwardTransferOutput {
        ForwardTransferOutput {
            amount,
            proposition: proposition(tag),
            mc_return_address: [tag; 20],
            tx_hash: [0x55; 32],
            output_index: index,
        }
    }

    fn genesis_block(amount: u64) -> SidechainBlock {
        SidechainBlock::new(
            [0u8; 32],
            1_000,
            proposition(0xF0),
            Vec::new(),
            vec![mainchain_reference(vec![transfer(1, amount, 0)])],
        )
    }

    #[test]
    fn genesis_mints_forward_transfers() {
        let dir = TempDir::new().unwrap();
        let storages = NodeStorages::open(dir.path(), 10).unwrap();
        let mut state = new_state(&storages);
        let genesis = genesis_block(500);
        state.apply_modifier(&genesis).unwrap();
        assert_eq!(state.version().unwrap(), Some(genesis.id()));
        let boxes = state.boxes().unwrap();
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].value(), 500);
        let info = state.withdrawal_epoch_info().unwrap();
        assert_eq!(info, WithdrawalEpochInfo { epoch: 0, index: 1 });
    }

    #[test]
    fn spending_missing_box_is_rejected() {
        let dir = TempDir::new().unwrap();
        let storages = NodeStorages::open(dir.path(), 10).unwrap();
        let mut state = new_state(&storages);
        let genesis = genesis_block(500);
        state.apply_modifier(&genesis).unwrap();
        let tx = SidechainTransaction::new(
            vec![[9u8; 32]],
            vec![SidechainBox::Coin(CoinBox {
                proposition: proposition(2),
                value: 1,
                nonce: 0,
            })],
            0,
        );
        let block = SidechainBlock::new(genesis.id(), 1_010, proposition(0xF0), vec![tx], vec![]);
        let err = state.apply_modifier(&block).unwrap_err();
        assert!(matches!(err, ChainError::StateApply(_)));
        // nothing persisted for the failed block
        assert_eq!(state.version().unwrap(), Some(genesis.id()));
    }

    #[test]
    fn value_conservation_is_enforced() {
        let dir = TempDir::new().unwrap();
        let storages = NodeStorages::open(dir.path(), 10).unwrap();
        let mut state = new_state(&storages);
        let genesis = genesis_block(500);
        state.apply_modifier(&genesis).unwrap();
        let minted = state.boxes().unwrap().remove(0);
        let tx = SidechainTransaction::new(
            vec![minted.id()],
            vec![SidechainBox::Coin(CoinBox {
                proposition: proposition(2),
                value: 490,
                nonce: 1,
            })],
            5,
        );
        let block = SidechainBlock::new(genesis.id(), 1_010, proposition(0xF0), vec![tx], vec![]);
        let err = state.apply_modifier(&block).unwrap_err();
        assert!(matches!(err, ChainError::StateApply(_)));
    }

    #[test]
    fn transactions_move_value_and_pay_fees() {
        let dir = TempDir::new().unwrap();
        let storages = NodeStorages::open(dir.path(), 10).unwrap();
        let mut state = new_state(&storages);
        let genesis = genesis_block(500);
        state.apply_modifier(&genesis).unwrap();
        let minted = state.boxes().unwrap().remove(0);
        let tx = SidechainTransaction::new(
            vec![minted.id()],
            vec![
                SidechainBox::Coin(CoinBox {
                    proposition: proposition(2),
                    value: 300,
                    nonce: 1,
                }),
                SidechainBox::Forger(ForgerBox {
                    proposition: proposition(2),
                    value: 190,
                    nonce: 2,
                    block_sign_proposition: proposition(3),
                    vrf_public_key: [4u8; 32],
                }),
            ],
            10,
        );
        let block = SidechainBlock::new(genesis.id(), 1_010, proposition(0xF0), vec![tx], vec![]);
        state.apply_modifier(&block).unwrap();
        assert_eq!(state.get_box(&minted.id()).unwrap(), None);
        assert_eq!(state.boxes().unwrap().len(), 2);
        // forger side store follows the box set
        let (_, info) = state.current_consensus_epoch_info().unwrap();
        assert_eq!(info.forgers_stake_total, 190);
        assert_eq!(info.forging_stake_tree.leaves().len(), 1);
    }

    #[test]
    fn withdrawal_epoch_last_index_emits_fee_payments() {
        let dir = TempDir::new().unwrap();
        let storages = NodeStorages::open(dir.path(), 10).unwrap();
        let mut state = new_state(&storages);
        let genesis = genesis_block(500);
        state.apply_modifier(&genesis).unwrap();
        let minted = state.boxes().unwrap().remove(0);
        let tx = SidechainTransaction::new(
            vec![minted.id()],
            vec![SidechainBox::Coin(CoinBox {
                proposition: proposition(2),
                value: 480,
                nonce: 1,
            })],
            20,
        );
        // second mainchain reference closes withdrawal epoch 0
        let block = SidechainBlock::new(
            genesis.id(),
            1_010,
            proposition(0xF0),
            vec![tx],
            vec![mainchain_reference(vec![])],
        );
        state.apply_modifier(&block).unwrap();
        assert!(state.is_withdrawal_epoch_last_index().unwrap());
        let payments = state.get_fee_payments(0).unwrap();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].value(), 20);
        assert_eq!(payments[0].proposition(), &proposition(0xF0));
        // the payout box is part of the utxo set
        assert!(state.get_box(&payments[0].id()).unwrap().is_some());
        let view = state.utxo_merkle_tree_view().unwrap();
        assert!(view.merkle_path(&payments[0].id()).is_some());
    }

    #[test]
    fn top_quality_certificate_is_recorded() {
        let dir = TempDir::new().unwrap();
        let storages = NodeStorages::open(dir.path(), 10).unwrap();
        let mut state = new_state(&storages);
        let genesis = genesis_block(500);
        state.apply_modifier(&genesis).unwrap();

        let certificate = WithdrawalEpochCertificate::assemble(
            1,
            [0x10; 32],
            0,
            50,
            vec![0x22; 32],
            vec![0xAA; 8],
            Vec::new(),
            Vec::new(),
            0,
            0,
            Vec::new(),
            Vec::new(),
            Vec::new(),
        )
        .unwrap();
        let block = SidechainBlock::new(
            genesis.id(),
            1_010,
            proposition(0xF0),
            Vec::new(),
            vec![MainchainBlockReferenceData {
                header_hash: [0x78; 32],
                aggregated_transaction: None,
                top_quality_certificate: Some(certificate.clone()),
            }],
        );
        state.apply_modifier(&block).unwrap();
        let stored = state.get_top_quality_certificate(0).unwrap().unwrap();
        assert_eq!(stored, certificate);
        assert_eq!(stored.bytes(), certificate.bytes());
        assert_eq!(state.get_top_quality_certificate(1).unwrap(), None);
    }

    #[test]
    fn rollback_restores_previous_tip() {
        let dir = TempDir::new().unwrap();
        let storages = NodeStorages::open(dir.path(), 10).unwrap();
        let mut state = new_state(&storages);
        let genesis = genesis_block(500);
        state.apply_modifier(&genesis).unwrap();
        let minted = state.boxes().unwrap().remove(0);
        let tx = SidechainTransaction::new(
            vec![minted.id()],
            vec![SidechainBox::Coin(CoinBox {
                proposition: proposition(2),
                value: 500,
                nonce: 1,
            })],
            0,
        );
        let block = SidechainBlock::new(genesis.id(), 1_010, proposition(0xF0), vec![tx], vec![]);
        state.apply_modifier(&block).unwrap();
        state.rollback(genesis.id()).unwrap();
        assert_eq!(state.version().unwrap(), Some(genesis.id()));
        assert!(state.get_box(&minted.id()).unwrap().is_some());
    }

    #[test]
    fn consensus_epoch_switch_is_detected() {
        let dir = TempDir::new().unwrap();
        let storages = NodeStorages::open(dir.path(), 10).unwrap();
        let mut state = new_state(&storages);
        let genesis = genesis_block(500);
        state.apply_modifier(&genesis).unwrap();
        let same_epoch = SidechainBlock::new(
            genesis.id(),
            1_050,
            proposition(0xF0),
            Vec::new(),
            Vec::new(),
        );
        assert!(!state.is_switching_consensus_epoch(&same_epoch).unwrap());
        let next_epoch = SidechainBlock::new(
            genesis.id(),
            1_100,
            proposition(0xF0),
            Vec::new(),
            Vec::new(),
        );
        assert!(state.is_switching_consensus_epoch(&next_epoch).unwrap());
    }

    #[test]
    fn leading_sub_storage_is_rolled_back_on_restore() {
        let dir = TempDir::new().unwrap();
        let storages = NodeStorages::open(dir.path(), 10).unwrap();
        let mut state = new_state(&storages);
        let genesis = genesis_block(500);
        state.apply_modifier(&genesis).unwrap();
        // simulate a crash between the sub-store writes and the base write
        let orphan_version = [0xEE; 32];
        storages
            .utxo_merkle_tree()
            .update(orphan_version, vec![(vec![1u8; 32], vec![2u8; 32])], vec![])
            .unwrap();
        state.ensure_storage_consistency_after_restore().unwrap();
        assert_eq!(
            storages.utxo_merkle_tree().last_version_id().unwrap(),
            Some(genesis.id())
        );
    }

    #[test]
    fn unreconcilable_sub_storage_is_fatal() {
        let dir = TempDir::new().unwrap();
        let storages = NodeStorages::open(dir.path(), 10).unwrap();
        let mut state = new_state(&storages);
        let genesis = genesis_block(500);
        state.apply_modifier(&genesis).unwrap();
        storages
            .utxo_merkle_tree()
            .update([0xEE; 32], vec![], vec![])
            .unwrap();
        storages
            .utxo_merkle_tree()
            .update([0xEF; 32], vec![], vec![])
            .unwrap();
        let err = state.ensure_storage_consistency_after_restore().unwrap_err();
        assert!(matches!(err, ChainError::Consistency(_)));
    }
}
