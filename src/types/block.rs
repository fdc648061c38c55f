use serde::{Deserialize, Serialize};

use crate::crypto::{blake2b256, blake2b256_of_slices};
use crate::merkle::{MerklePath, MerkleTree};
use crate::secret::PublicKey25519Proposition;

use super::boxes::CoinBox;
use super::certificate::WithdrawalEpochCertificate;
use super::transaction::SidechainTransaction;
use super::BlockId;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidechainBlock {
    id: BlockId,
    pub parent_id: BlockId,
    pub timestamp: u64,
    pub forger_proposition: PublicKey25519Proposition,
    pub transactions: Vec<SidechainTransaction>,
    pub mainchain_references: Vec<MainchainBlockReferenceData>,
}

impl SidechainBlock {
    pub fn new(
        parent_id: BlockId,
        timestamp: u64,
        forger_proposition: PublicKey25519Proposition,
        transactions: Vec<SidechainTransaction>,
        mainchain_references: Vec<MainchainBlockReferenceData>,
    ) -> Self {
        let mut data = Vec::new();
        data.extend_from_slice(&parent_id);
        data.extend_from_slice(&timestamp.to_le_bytes());
        data.extend_from_slice(forger_proposition.bytes());
        for tx in &transactions {
            data.extend_from_slice(&tx.id());
        }
        for reference in &mainchain_references {
            data.extend_from_slice(&reference.header_hash);
        }
        let id = blake2b256(&data);
        Self {
            id,
            parent_id,
            timestamp,
            forger_proposition,
            transactions,
            mainchain_references,
        }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }
}

/// Data extracted from one mainchain block that references this sidechain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MainchainBlockReferenceData {
    pub header_hash: [u8; 32],
    pub aggregated_transaction: Option<AggregatedTransaction>,
    pub top_quality_certificate: Option<WithdrawalEpochCertificate>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedTransaction {
    pub sidechain_related_outputs: Vec<SidechainRelatedOutput>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SidechainRelatedOutput {
    ForwardTransfer(ForwardTransferOutput),
    SidechainCreation(SidechainCreationOutput),
}

/// Mainchain-originated deposit that materializes as a coin box.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardTransferOutput {
    pub amount: u64,
    pub proposition: PublicKey25519Proposition,
    pub mc_return_address: [u8; 20],
    pub tx_hash: [u8; 32],
    pub output_index: u32,
}

impl ForwardTransferOutput {
    pub fn to_coin_box(&self) -> CoinBox {
        let nonce_bytes = blake2b256_of_slices(&[&self.tx_hash, &self.output_index.to_be_bytes()]);
        let mut nonce = [0u8; 8];
        nonce.copy_from_slice(&nonce_bytes[..8]);
        CoinBox {
            proposition: self.proposition,
            value: self.amount,
            nonce: u64::from_be_bytes(nonce),
        }
    }

    fn leaf_hash(&self) -> [u8; 32] {
        blake2b256_of_slices(&[
            &self.tx_hash,
            &self.output_index.to_be_bytes(),
            self.proposition.bytes(),
            &self.amount.to_le_bytes(),
            &self.mc_return_address,
        ])
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidechainCreationOutput {
    pub sidechain_id: [u8; 32],
    pub amount: u64,
    pub withdrawal_epoch_length: u32,
    pub custom_data: Vec<u8>,
}

impl SidechainCreationOutput {
    fn leaf_hash(&self) -> [u8; 32] {
        blake2b256_of_slices(&[
            &self.sidechain_id,
            &self.amount.to_le_bytes(),
            &self.withdrawal_epoch_length.to_be_bytes(),
            &self.custom_data,
        ])
    }
}

/// Commitment structure of one mainchain reference, built on demand while
/// computing forward-transfer withdrawal evidence and dropped with the scan.
pub struct CommitmentTree {
    ft_tree: MerkleTree,
    btr_commitment: [u8; 32],
    cert_commitment: [u8; 32],
    sc_cr_commitment: [u8; 32],
    sc_tree: MerkleTree,
}

impl CommitmentTree {
    pub fn build(aggregated: &AggregatedTransaction) -> Self {
        let mut ft_leaves = Vec::new();
        let mut sc_cr_leaves = Vec::new();
        for output in &aggregated.sidechain_related_outputs {
            match output {
                SidechainRelatedOutput::ForwardTransfer(ft) => ft_leaves.push(ft.leaf_hash()),
                SidechainRelatedOutput::SidechainCreation(creation) => {
                    sc_cr_leaves.push(creation.leaf_hash())
                }
            }
        }
        let ft_tree = MerkleTree::from_leaves(ft_leaves);
        let btr_commitment = MerkleTree::from_leaves(Vec::new()).root();
        let cert_commitment = MerkleTree::from_leaves(Vec::new()).root();
        let sc_cr_commitment = MerkleTree::from_leaves(sc_cr_leaves).root();
        let sc_commitment = blake2b256_of_slices(&[
            &ft_tree.root(),
            &btr_commitment,
            &cert_commitment,
            &sc_cr_commitment,
        ]);
        let sc_tree = MerkleTree::from_leaves(vec![sc_commitment]);
        Self {
            ft_tree,
            btr_commitment,
            cert_commitment,
            sc_cr_commitment,
            sc_tree,
        }
    }

    pub fn ft_merkle_path(&self, leaf_index: usize) -> Option<MerklePath> {
        self.ft_tree.path_for(leaf_index)
    }

    pub fn sc_commitment_merkle_path(&self) -> MerklePath {
        match self.sc_tree.path_for(0) {
            Some(path) => path,
            None => MerklePath { steps: Vec::new() },
        }
    }

    pub fn btr_commitment(&self) -> [u8; 32] {
        self.btr_commitment
    }

    pub fn cert_commitment(&self) -> [u8; 32] {
        self.cert_commitment
    }

    pub fn sc_cr_commitment(&self) -> [u8; 32] {
        self.sc_cr_commitment
    }
}
