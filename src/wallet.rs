use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::crypto::blake2b256_of_slices;
use crate::errors::{ChainError, ChainResult};
use crate::interfaces::ApplicationWallet;
use crate::merkle::MerklePath;
use crate::secret::{PrivateKey25519, PublicKey25519Proposition};
use crate::secret_store::SecretStore;
use crate::state::{self, ConsensusEpochInfo, UtxoMerkleTreeView};
use crate::storage::VersionedStore;
use crate::types::{
    BoxId, CommitmentTree, ForgerBox, ForgingStakeMerklePathInfo, SidechainBlock, SidechainBox,
    SidechainRelatedOutput, TxId, Version, WalletBox,
};

const FORGER_BOX_KEY_PREFIX: &[u8] = b"b/";
const EPOCH_INFO_KEY_PREFIX: &[u8] = b"e/";
const EPOCH_INFO_VERSION_DOMAIN: &[u8] = b"sdc-consensus-epoch-info";

/// Ceased-sidechain-withdrawal evidence for one wallet-owned coin box.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoCswData {
    pub box_id: BoxId,
    pub proposition: PublicKey25519Proposition,
    pub value: u64,
    pub nonce: u64,
    pub custom_fields_hash: [u8; 32],
    pub utxo_merkle_path: MerklePath,
}

/// Ceased-sidechain-withdrawal evidence for one wallet-owned Forward
/// Transfer. The leaf index is the transfer's global position among every
/// Forward Transfer of the aggregated transaction, wallet-owned or not.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FtCswData {
    pub box_id: BoxId,
    pub amount: u64,
    pub proposition: PublicKey25519Proposition,
    pub mc_return_address: [u8; 20],
    pub tx_hash: [u8; 32],
    pub tx_index: u32,
    pub ft_leaf_index: u32,
    pub sc_commitment_merkle_path: MerklePath,
    pub btr_commitment: [u8; 32],
    pub cert_commitment: [u8; 32],
    pub sc_cr_commitment: [u8; 32],
    pub ft_merkle_path: MerklePath,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CswData {
    Utxo(UtxoCswData),
    ForwardTransfer(FtCswData),
}

/// The wallet side of the node view: four versioned stores that must agree
/// on a version, plus the versionless secret store.
pub struct SidechainWallet {
    box_store: VersionedStore,
    tx_store: VersionedStore,
    forger_store: VersionedStore,
    csw_store: VersionedStore,
    secrets: SecretStore,
    application_wallet: Box<dyn ApplicationWallet>,
}

impl SidechainWallet {
    pub fn restore(
        box_store: VersionedStore,
        tx_store: VersionedStore,
        forger_store: VersionedStore,
        csw_store: VersionedStore,
        secret_store: VersionedStore,
        application_wallet: Box<dyn ApplicationWallet>,
    ) -> ChainResult<Self> {
        let secrets = SecretStore::load(secret_store)?;
        Ok(Self {
            box_store,
            tx_store,
            forger_store,
            csw_store,
            secrets,
            application_wallet,
        })
    }

    pub fn version(&self) -> ChainResult<Option<Version>> {
        self.box_store.last_version_id()
    }

    pub fn add_secret(&mut self, secret: PrivateKey25519) -> ChainResult<()> {
        self.application_wallet
            .on_add_secret(&secret)
            .map_err(|err| ChainError::ApplicationHook(err.to_string()))?;
        self.secrets.add(secret)
    }

    pub fn remove_secret(&mut self, proposition: &PublicKey25519Proposition) -> ChainResult<()> {
        self.application_wallet
            .on_remove_secret(proposition)
            .map_err(|err| ChainError::ApplicationHook(err.to_string()))?;
        self.secrets.remove(proposition)
    }

    pub fn secret(&self, proposition: &PublicKey25519Proposition) -> Option<&PrivateKey25519> {
        self.secrets.get(proposition)
    }

    pub fn secrets(&self) -> Vec<&PrivateKey25519> {
        self.secrets.secrets()
    }

    pub fn public_keys(&self) -> HashSet<PublicKey25519Proposition> {
        self.secrets
            .secrets()
            .iter()
            .map(|secret| secret.public_image())
            .collect()
    }

    pub fn boxes(&self) -> ChainResult<Vec<WalletBox>> {
        let mut boxes = Vec::new();
        for (_key, value) in self.box_store.get_all()? {
            boxes.push(bincode::deserialize(&value)?);
        }
        Ok(boxes)
    }

    pub fn balance(&self) -> ChainResult<u64> {
        let mut total: u64 = 0;
        for wallet_box in self.boxes()? {
            if wallet_box.sidechain_box.is_coin() {
                total = total.saturating_add(wallet_box.sidechain_box.value());
            }
        }
        Ok(total)
    }

    pub fn csw_data(&self, withdrawal_epoch: u32) -> ChainResult<Vec<CswData>> {
        match self.csw_store.get(&csw_key(withdrawal_epoch))? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    pub fn forger_boxes(&self) -> ChainResult<Vec<ForgerBox>> {
        let mut boxes = Vec::new();
        for (key, value) in self.forger_store.get_all()? {
            if key.starts_with(FORGER_BOX_KEY_PREFIX) {
                boxes.push(bincode::deserialize(&value)?);
            }
        }
        Ok(boxes)
    }

    /// Applies the box deltas of one block across the four wallet stores, in
    /// the order wallet-box, wallet-tx, forger-box, CSW-data, all under the
    /// block id as version. The application hook runs before the first store
    /// write; a hook failure aborts the whole scan.
    pub fn scan_persistent(
        &mut self,
        block: &SidechainBlock,
        withdrawal_epoch: u32,
        fee_payments: &[SidechainBox],
        utxo_view: Option<&UtxoMerkleTreeView>,
    ) -> ChainResult<()> {
        let version = block.id();
        let changes = state::extract_box_changes(block)?;

        let mut tx_by_box: HashMap<BoxId, TxId> = HashMap::new();
        for tx in &block.transactions {
            for box_id in tx.box_ids_to_open() {
                tx_by_box.insert(*box_id, tx.id());
            }
            for output in tx.new_boxes() {
                tx_by_box.insert(output.id(), tx.id());
            }
        }

        let mut new_boxes = changes.to_append;
        new_boxes.extend(fee_payments.iter().cloned());

        let known = self.public_keys();

        let mut wallet_boxes = Vec::new();
        let mut new_delegated_forger_boxes: Vec<ForgerBox> = Vec::new();
        for sidechain_box in &new_boxes {
            if known.contains(sidechain_box.proposition()) {
                wallet_boxes.push(WalletBox {
                    sidechain_box: sidechain_box.clone(),
                    creating_tx_id: tx_by_box.get(&sidechain_box.id()).copied(),
                    block_timestamp: block.timestamp,
                });
            }
            if let SidechainBox::Forger(forger) = sidechain_box {
                if known.contains(&forger.block_sign_proposition) {
                    new_delegated_forger_boxes.push(forger.clone());
                }
            }
        }

        let box_ids_to_remove = changes.to_remove;

        self.application_wallet
            .on_change_boxes(&version, &wallet_boxes, &box_ids_to_remove)
            .map_err(|err| ChainError::ApplicationHook(err.to_string()))?;

        let mut referenced_tx_ids: HashSet<TxId> = HashSet::new();
        for wallet_box in &wallet_boxes {
            if let Some(tx_id) = wallet_box.creating_tx_id {
                referenced_tx_ids.insert(tx_id);
            }
        }
        for box_id in &box_ids_to_remove {
            if let Some(tx_id) = tx_by_box.get(box_id) {
                referenced_tx_ids.insert(*tx_id);
            }
        }

        let mut box_puts = Vec::new();
        for wallet_box in &wallet_boxes {
            box_puts.push((wallet_box.id().to_vec(), bincode::serialize(wallet_box)?));
        }
        let box_deletes: Vec<Vec<u8>> = box_ids_to_remove.iter().map(|id| id.to_vec()).collect();
        self.box_store.update(version, box_puts, box_deletes)?;

        let mut tx_puts = Vec::new();
        for tx in &block.transactions {
            if referenced_tx_ids.contains(&tx.id()) {
                tx_puts.push((tx.id().to_vec(), bincode::serialize(tx)?));
            }
        }
        self.tx_store.update(version, tx_puts, Vec::new())?;

        let mut forger_puts = Vec::new();
        for forger in &new_delegated_forger_boxes {
            let box_id = SidechainBox::Forger(forger.clone()).id();
            forger_puts.push((forger_box_key(&box_id), bincode::serialize(forger)?));
        }
        let forger_deletes: Vec<Vec<u8>> = box_ids_to_remove
            .iter()
            .map(|id| forger_box_key(id))
            .collect();
        self.forger_store.update(version, forger_puts, forger_deletes)?;

        let mut csw_entries = self.utxo_csw_data(utxo_view)?;
        csw_entries.extend(self.ft_csw_data(block, &known)?);
        let mut stored: Vec<CswData> = match self.csw_store.get(&csw_key(withdrawal_epoch))? {
            Some(bytes) => bincode::deserialize(&bytes)?,
            None => Vec::new(),
        };
        stored.extend(csw_entries);
        self.csw_store.update(
            version,
            vec![(csw_key(withdrawal_epoch), bincode::serialize(&stored)?)],
            Vec::new(),
        )?;

        debug!(
            block = %hex::encode(version),
            boxes = wallet_boxes.len(),
            removed = box_ids_to_remove.len(),
            "wallet scanned block"
        );
        Ok(())
    }

    fn utxo_csw_data(&self, utxo_view: Option<&UtxoMerkleTreeView>) -> ChainResult<Vec<CswData>> {
        let view = match utxo_view {
            Some(view) => view,
            None => return Ok(Vec::new()),
        };
        let mut entries = Vec::new();
        for wallet_box in self.boxes()? {
            let sidechain_box = &wallet_box.sidechain_box;
            if !sidechain_box.is_coin() {
                continue;
            }
            let box_id = sidechain_box.id();
            let utxo_merkle_path = view.merkle_path(&box_id).ok_or_else(|| {
                ChainError::Consistency(format!(
                    "coin box {} missing from the utxo merkle tree",
                    hex::encode(box_id)
                ))
            })?;
            entries.push(CswData::Utxo(UtxoCswData {
                box_id,
                proposition: *sidechain_box.proposition(),
                value: sidechain_box.value(),
                nonce: sidechain_box.nonce(),
                custom_fields_hash: sidechain_box.custom_fields_hash(),
                utxo_merkle_path,
            }));
        }
        Ok(entries)
    }

    fn ft_csw_data(
        &self,
        block: &SidechainBlock,
        known: &HashSet<PublicKey25519Proposition>,
    ) -> ChainResult<Vec<CswData>> {
        let mut entries = Vec::new();
        for reference in &block.mainchain_references {
            let aggregated = match &reference.aggregated_transaction {
                Some(aggregated) => aggregated,
                None => continue,
            };
            let commitment_tree = CommitmentTree::build(aggregated);
            let mut ft_leaf_index: u32 = 0;
            for output in &aggregated.sidechain_related_outputs {
                match output {
                    SidechainRelatedOutput::ForwardTransfer(transfer) => {
                        if known.contains(&transfer.proposition) {
                            let ft_merkle_path = commitment_tree
                                .ft_merkle_path(ft_leaf_index as usize)
                                .ok_or_else(|| {
                                    ChainError::Consistency(
                                        "forward transfer leaf missing from commitment tree".into(),
                                    )
                                })?;
                            entries.push(CswData::ForwardTransfer(FtCswData {
                                box_id: SidechainBox::Coin(transfer.to_coin_box()).id(),
                                amount: transfer.amount,
                                proposition: transfer.proposition,
                                mc_return_address: transfer.mc_return_address,
                                tx_hash: transfer.tx_hash,
                                tx_index: transfer.output_index,
                                ft_leaf_index,
                                sc_commitment_merkle_path: commitment_tree
                                    .sc_commitment_merkle_path(),
                                btr_commitment: commitment_tree.btr_commitment(),
                                cert_commitment: commitment_tree.cert_commitment(),
                                sc_cr_commitment: commitment_tree.sc_cr_commitment(),
                                ft_merkle_path,
                            }));
                        }
                        // global index, advances for non-wallet transfers too
                        ft_leaf_index += 1;
                    }
                    SidechainRelatedOutput::SidechainCreation(_) => {}
                }
            }
        }
        Ok(entries)
    }

    /// Rolls the four stores back in reverse update order. The secret store
    /// is never touched by a rollback.
    pub fn rollback(&mut self, to: Version) -> ChainResult<()> {
        info!(version = %hex::encode(to), "rolling back wallet");
        self.csw_store.rollback(to)?;
        self.forger_store.rollback(to)?;
        self.tx_store.rollback(to)?;
        self.box_store.rollback(to)?;
        self.application_wallet
            .on_rollback(&to)
            .map_err(|err| ChainError::ApplicationHook(err.to_string()))?;
        Ok(())
    }

    /// Records the Merkle path of every wallet forger box present in the
    /// epoch's forging-stake tree. This writes the forger store under a
    /// version derived from the epoch info, so the store leads the other
    /// wallet stores by one version until the epoch-opening block is scanned.
    pub fn apply_consensus_epoch_info(&mut self, info: &ConsensusEpochInfo) -> ChainResult<()> {
        let version = blake2b256_of_slices(&[
            EPOCH_INFO_VERSION_DOMAIN,
            &info.epoch.to_le_bytes(),
            &info.forging_stake_tree.root(),
        ]);
        let mut paths = Vec::new();
        for forger in self.forger_boxes()? {
            let stake_info = forger.forging_stake_info();
            // forger boxes without a leaf are silently omitted; the wallet
            // legitimately lacks visibility into the full forger set
            if let Some(index) = info.forging_stake_tree.leaf_index(&stake_info.hash()) {
                if let Some(merkle_path) = info.forging_stake_tree.path_for(index) {
                    paths.push(ForgingStakeMerklePathInfo {
                        stake_info,
                        merkle_path,
                    });
                }
            }
        }
        info!(epoch = info.epoch, stakes = paths.len(), "recording forging stake paths");
        self.forger_store.update(
            version,
            vec![(epoch_info_key(info.epoch), bincode::serialize(&paths)?)],
            Vec::new(),
        )
    }

    /// Stake paths for forging in `requested_epoch`, taken from the snapshot
    /// two epochs back. The genesis block is the sole block of epoch 1 and
    /// its data must stay available for epoch 2 forging.
    pub fn forging_stake_merkle_path_info(
        &self,
        requested_epoch: u32,
    ) -> ChainResult<Option<Vec<ForgingStakeMerklePathInfo>>> {
        let storage_epoch = if requested_epoch <= 2 {
            1
        } else {
            requested_epoch - 2
        };
        match self.forger_store.get(&epoch_info_key(storage_epoch))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Verifies that the wallet stores agree on a version after a restart.
    /// The forger store may lead by exactly one version across a consensus
    /// epoch boundary and is rolled back, except for the genesis case where
    /// the epoch write is the second of only two versions and must stay.
    pub fn ensure_storage_consistency_after_restore(&mut self) -> ChainResult<()> {
        let version = self.box_store.last_version_id()?.ok_or_else(|| {
            ChainError::Consistency("wallet box storage is empty".into())
        })?;
        if self.tx_store.last_version_id()? != Some(version)
            || self.csw_store.last_version_id()? != Some(version)
            || !self.application_wallet.check_storages_version(&version)
        {
            return Err(ChainError::Consistency(
                "wallet storages are not consistent".into(),
            ));
        }
        if self.forger_store.last_version_id()? == Some(version) {
            return Ok(());
        }
        let recent = self.forger_store.rollback_versions(2)?;
        if recent.len() == 2 && recent[1] == version {
            if self.forger_store.number_of_versions()? == 2 {
                return Ok(());
            }
            info!(
                version = %hex::encode(version),
                "rolling back wallet forger box storage after restart"
            );
            return self.forger_store.rollback(version);
        }
        Err(ChainError::Consistency(
            "wallet forger box storage is not consistent".into(),
        ))
    }
}

fn forger_box_key(box_id: &BoxId) -> Vec<u8> {
    [FORGER_BOX_KEY_PREFIX, box_id.as_slice()].concat()
}

fn epoch_info_key(epoch: u32) -> Vec<u8> {
    [EPOCH_INFO_KEY_PREFIX, epoch.to_be_bytes().as_slice()].concat()
}

fn csw_key(epoch: u32) -> Vec<u8> {
    epoch.to_be_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::DefaultApplicationWallet;
    use crate::merkle::MerkleTree;
    use crate::storage::NodeStorages;
    use crate::types::{
        AggregatedTransaction, CoinBox, ForwardTransferOutput, MainchainBlockReferenceData,
        SidechainCreationOutput, SidechainTransaction,
    };
    use tempfile::TempDir;

    fn secret(tag: u8) -> PrivateKey25519 {
        PrivateKey25519::from_seed([tag; 32]).unwrap()
    }

    fn new_wallet(storages: &NodeStorages) -> SidechainWallet {
        SidechainWallet::restore(
            storages.wallet_boxes(),
            storages.wallet_transactions(),
            storages.forger_box_info(),
            storages.csw_data(),
            storages.secrets(),
            Box::new(DefaultApplicationWallet),
        )
        .unwrap()
    }

    fn coin(proposition: PublicKey25519Proposition, value: u64, nonce: u64) -> SidechainBox {
        SidechainBox::Coin(CoinBox {
            proposition,
            value,
            nonce,
        })
    }

    fn forward_transfer(
        proposition: PublicKey25519Proposition,
        amount: u64,
        index: u32,
    ) -> ForwardTransferOutput {
        ForwardTransferOutput {
            amount,
            proposition,
            mc_return_address: [9u8; 20],
            tx_hash: [0x66; 32],
            output_index: index,
        }
    }

    fn reference_with(outputs: Vec<SidechainRelatedOutput>) -> MainchainBlockReferenceData {
        MainchainBlockReferenceData {
            header_hash: [0x22; 32],
            aggregated_transaction: Some(AggregatedTransaction {
                sidechain_related_outputs: outputs,
            }),
            top_quality_certificate: None,
        }
    }

    fn forger_for(wallet_key: PublicKey25519Proposition, value: u64, nonce: u64) -> ForgerBox {
        ForgerBox {
            proposition: wallet_key,
            value,
            nonce,
            block_sign_proposition: wallet_key,
            vrf_public_key: [3u8; 32],
        }
    }

    #[test]
    fn scan_keeps_only_wallet_boxes() {
        let dir = TempDir::new().unwrap();
        let storages = NodeStorages::open(dir.path(), 10).unwrap();
        let mut wallet = new_wallet(&storages);
        let mine = secret(1);
        wallet.add_secret(mine.clone()).unwrap();

        let my_box = coin(mine.public_image(), 40, 0);
        let other_box = coin(secret(2).public_image(), 60, 1);
        let tx = SidechainTransaction::new(
            vec![[0xAA; 32]],
            vec![my_box.clone(), other_box.clone()],
            0,
        );
        let block = SidechainBlock::new(
            [0u8; 32],
            1_500,
            secret(9).public_image(),
            vec![tx.clone()],
            Vec::new(),
        );
        wallet.scan_persistent(&block, 0, &[], None).unwrap();

        assert_eq!(wallet.version().unwrap(), Some(block.id()));
        let boxes = wallet.boxes().unwrap();
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].sidechain_box, my_box);
        assert_eq!(boxes[0].creating_tx_id, Some(tx.id()));
        assert_eq!(boxes[0].block_timestamp, 1_500);
        // the creating transaction is recorded
        assert!(storages
            .wallet_transactions()
            .get(&tx.id())
            .unwrap()
            .is_some());
    }

    #[test]
    fn fee_payment_boxes_have_no_creating_transaction() {
        let dir = TempDir::new().unwrap();
        let storages = NodeStorages::open(dir.path(), 10).unwrap();
        let mut wallet = new_wallet(&storages);
        let mine = secret(1);
        wallet.add_secret(mine.clone()).unwrap();

        let fee_box = coin(mine.public_image(), 12, 77);
        let block = SidechainBlock::new(
            [0u8; 32],
            2_000,
            secret(9).public_image(),
            Vec::new(),
            Vec::new(),
        );
        wallet
            .scan_persistent(&block, 3, std::slice::from_ref(&fee_box), None)
            .unwrap();
        let boxes = wallet.boxes().unwrap();
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].creating_tx_id, None);
        assert_eq!(boxes[0].block_timestamp, 2_000);
    }

    #[test]
    fn ft_leaf_index_counts_every_forward_transfer() {
        let dir = TempDir::new().unwrap();
        let storages = NodeStorages::open(dir.path(), 10).unwrap();
        let mut wallet = new_wallet(&storages);
        let mine_a = secret(1);
        let mine_c = secret(3);
        wallet.add_secret(mine_a.clone()).unwrap();
        wallet.add_secret(mine_c.clone()).unwrap();

        let outputs = vec![
            SidechainRelatedOutput::SidechainCreation(SidechainCreationOutput {
                sidechain_id: [8u8; 32],
                amount: 1,
                withdrawal_epoch_length: 10,
                custom_data: Vec::new(),
            }),
            SidechainRelatedOutput::ForwardTransfer(forward_transfer(
                mine_a.public_image(),
                10,
                1,
            )),
            SidechainRelatedOutput::ForwardTransfer(forward_transfer(
                secret(2).public_image(),
                20,
                2,
            )),
            SidechainRelatedOutput::ForwardTransfer(forward_transfer(
                mine_c.public_image(),
                30,
                3,
            )),
        ];
        let block = SidechainBlock::new(
            [0u8; 32],
            2_000,
            secret(9).public_image(),
            Vec::new(),
            vec![reference_with(outputs)],
        );
        wallet.scan_persistent(&block, 1, &[], None).unwrap();

        let entries = wallet.csw_data(1).unwrap();
        let leaf_indices: Vec<u32> = entries
            .iter()
            .filter_map(|entry| match entry {
                CswData::ForwardTransfer(ft) => Some(ft.ft_leaf_index),
                CswData::Utxo(_) => None,
            })
            .collect();
        assert_eq!(leaf_indices, vec![0, 2]);
    }

    #[test]
    fn utxo_csw_entries_cover_held_coin_boxes() {
        let dir = TempDir::new().unwrap();
        let storages = NodeStorages::open(dir.path(), 10).unwrap();
        let mut wallet = new_wallet(&storages);
        let mine = secret(1);
        wallet.add_secret(mine.clone()).unwrap();

        let my_box = coin(mine.public_image(), 40, 0);
        let tx = SidechainTransaction::new(vec![[0xAA; 32]], vec![my_box.clone()], 0);
        let block = SidechainBlock::new(
            [0u8; 32],
            1_500,
            secret(9).public_image(),
            vec![tx],
            Vec::new(),
        );
        let view = state::UtxoMerkleTreeView::from_entries(vec![(
            my_box.id(),
            state::utxo_leaf_hash(&my_box),
        )]);
        wallet.scan_persistent(&block, 0, &[], Some(&view)).unwrap();

        let entries = wallet.csw_data(0).unwrap();
        assert_eq!(entries.len(), 1);
        match &entries[0] {
            CswData::Utxo(utxo) => {
                assert_eq!(utxo.box_id, my_box.id());
                assert_eq!(utxo.value, 40);
                assert_eq!(
                    utxo.utxo_merkle_path.apply(state::utxo_leaf_hash(&my_box)),
                    view.root()
                );
            }
            CswData::ForwardTransfer(_) => panic!("expected utxo evidence"),
        }
    }

    #[test]
    fn secrets_survive_scans_and_rollbacks() {
        let dir = TempDir::new().unwrap();
        let storages = NodeStorages::open(dir.path(), 10).unwrap();
        let mut wallet = new_wallet(&storages);
        let mine = secret(1);
        wallet.add_secret(mine.clone()).unwrap();

        let genesis = SidechainBlock::new(
            [0u8; 32],
            1_000,
            secret(9).public_image(),
            Vec::new(),
            vec![reference_with(vec![SidechainRelatedOutput::ForwardTransfer(
                forward_transfer(mine.public_image(), 10, 0),
            )])],
        );
        wallet.scan_persistent(&genesis, 0, &[], None).unwrap();
        let next = SidechainBlock::new(
            genesis.id(),
            1_010,
            secret(9).public_image(),
            Vec::new(),
            Vec::new(),
        );
        wallet.scan_persistent(&next, 0, &[], None).unwrap();
        wallet.rollback(genesis.id()).unwrap();

        assert_eq!(wallet.version().unwrap(), Some(genesis.id()));
        assert!(wallet.secret(&mine.public_image()).is_some());
        assert_eq!(wallet.secrets().len(), 1);
    }

    #[test]
    fn consensus_epoch_info_leads_by_one_version() {
        let dir = TempDir::new().unwrap();
        let storages = NodeStorages::open(dir.path(), 10).unwrap();
        let mut wallet = new_wallet(&storages);
        let mine = secret(1);
        wallet.add_secret(mine.clone()).unwrap();

        let forger = forger_for(mine.public_image(), 50, 0);
        let tx = SidechainTransaction::new(
            vec![[0xAA; 32]],
            vec![SidechainBox::Forger(forger.clone())],
            0,
        );
        let genesis = SidechainBlock::new(
            [0u8; 32],
            1_000,
            secret(9).public_image(),
            vec![tx],
            Vec::new(),
        );
        wallet.scan_persistent(&genesis, 0, &[], None).unwrap();

        let info = ConsensusEpochInfo {
            epoch: 1,
            forging_stake_tree: MerkleTree::from_leaves(vec![
                forger.forging_stake_info().hash(),
                [0xCC; 32],
            ]),
            forgers_stake_total: 80,
        };
        wallet.apply_consensus_epoch_info(&info).unwrap();

        let box_versions = storages.wallet_boxes().number_of_versions().unwrap();
        let forger_versions = storages.forger_box_info().number_of_versions().unwrap();
        assert_eq!(forger_versions, box_versions + 1);
        assert_ne!(
            storages.forger_box_info().last_version_id().unwrap(),
            storages.wallet_boxes().last_version_id().unwrap()
        );

        let paths = wallet.forging_stake_merkle_path_info(2).unwrap().unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].stake_info, forger.forging_stake_info());
        assert_eq!(
            paths[0].merkle_path.apply(forger.forging_stake_info().hash()),
            info.forging_stake_tree.root()
        );
        // epoch 3 reads the snapshot taken at epoch 1
        assert!(wallet.forging_stake_merkle_path_info(3).unwrap().is_some());
        assert!(wallet.forging_stake_merkle_path_info(5).unwrap().is_none());
    }

    #[test]
    fn restore_accepts_matching_stores() {
        let dir = TempDir::new().unwrap();
        let storages = NodeStorages::open(dir.path(), 10).unwrap();
        let mut wallet = new_wallet(&storages);
        wallet.add_secret(secret(1)).unwrap();
        let block = SidechainBlock::new(
            [0u8; 32],
            1_000,
            secret(9).public_image(),
            Vec::new(),
            Vec::new(),
        );
        wallet.scan_persistent(&block, 0, &[], None).unwrap();
        wallet.ensure_storage_consistency_after_restore().unwrap();
    }

    #[test]
    fn restore_rejects_diverging_tx_store() {
        let dir = TempDir::new().unwrap();
        let storages = NodeStorages::open(dir.path(), 10).unwrap();
        let mut wallet = new_wallet(&storages);
        let block = SidechainBlock::new(
            [0u8; 32],
            1_000,
            secret(9).public_image(),
            Vec::new(),
            Vec::new(),
        );
        wallet.scan_persistent(&block, 0, &[], None).unwrap();
        storages
            .wallet_transactions()
            .update([0xEE; 32], Vec::new(), Vec::new())
            .unwrap();
        let err = wallet.ensure_storage_consistency_after_restore().unwrap_err();
        assert!(matches!(err, ChainError::Consistency(_)));
    }

    #[test]
    fn restore_keeps_genesis_epoch_write() {
        let dir = TempDir::new().unwrap();
        let storages = NodeStorages::open(dir.path(), 10).unwrap();
        let mut wallet = new_wallet(&storages);
        wallet.add_secret(secret(1)).unwrap();
        let genesis = SidechainBlock::new(
            [0u8; 32],
            1_000,
            secret(9).public_image(),
            Vec::new(),
            Vec::new(),
        );
        wallet.scan_persistent(&genesis, 0, &[], None).unwrap();
        let info = ConsensusEpochInfo {
            epoch: 1,
            forging_stake_tree: MerkleTree::from_leaves(vec![[0xAB; 32]]),
            forgers_stake_total: 10,
        };
        wallet.apply_consensus_epoch_info(&info).unwrap();

        // genesis scan + epoch write: both versions are retained
        wallet.ensure_storage_consistency_after_restore().unwrap();
        assert_eq!(storages.forger_box_info().number_of_versions().unwrap(), 2);
        assert!(wallet.forging_stake_merkle_path_info(2).unwrap().is_some());
    }

    #[test]
    fn restore_rolls_back_leading_forger_store() {
        let dir = TempDir::new().unwrap();
        let storages = NodeStorages::open(dir.path(), 10).unwrap();
        let mut wallet = new_wallet(&storages);
        wallet.add_secret(secret(1)).unwrap();
        let genesis = SidechainBlock::new(
            [0u8; 32],
            1_000,
            secret(9).public_image(),
            Vec::new(),
            Vec::new(),
        );
        wallet.scan_persistent(&genesis, 0, &[], None).unwrap();
        let second = SidechainBlock::new(
            genesis.id(),
            1_010,
            secret(9).public_image(),
            Vec::new(),
            Vec::new(),
        );
        wallet.scan_persistent(&second, 0, &[], None).unwrap();
        let info = ConsensusEpochInfo {
            epoch: 2,
            forging_stake_tree: MerkleTree::from_leaves(vec![[0xAB; 32]]),
            forgers_stake_total: 10,
        };
        wallet.apply_consensus_epoch_info(&info).unwrap();

        wallet.ensure_storage_consistency_after_restore().unwrap();
        assert_eq!(
            storages.forger_box_info().last_version_id().unwrap(),
            Some(second.id())
        );
        assert!(wallet.forging_stake_merkle_path_info(4).unwrap().is_none());
    }

    #[test]
    fn restore_rejects_forger_store_two_versions_ahead() {
        let dir = TempDir::new().unwrap();
        let storages = NodeStorages::open(dir.path(), 10).unwrap();
        let mut wallet = new_wallet(&storages);
        let genesis = SidechainBlock::new(
            [0u8; 32],
            1_000,
            secret(9).public_image(),
            Vec::new(),
            Vec::new(),
        );
        wallet.scan_persistent(&genesis, 0, &[], None).unwrap();
        storages
            .forger_box_info()
            .update([0xE1; 32], Vec::new(), Vec::new())
            .unwrap();
        storages
            .forger_box_info()
            .update([0xE2; 32], Vec::new(), Vec::new())
            .unwrap();
        let err = wallet.ensure_storage_consistency_after_restore().unwrap_err();
        assert!(matches!(err, ChainError::Consistency(_)));
    }
}
