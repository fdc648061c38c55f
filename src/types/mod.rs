mod block;
mod boxes;
mod certificate;
mod transaction;

pub use block::{
    AggregatedTransaction, CommitmentTree, ForwardTransferOutput, MainchainBlockReferenceData,
    SidechainBlock, SidechainCreationOutput, SidechainRelatedOutput,
};
pub use boxes::{
    CoinBox, CustomBox, ForgerBox, ForgingStakeInfo, ForgingStakeMerklePathInfo, SidechainBox,
    WalletBox,
};
pub use certificate::{
    BackwardTransferOutput, BitVectorCertificateField, FieldElementCertificateField,
    MainchainTransactionInput, MainchainTransactionOutput, WithdrawalEpochCertificate,
};
pub use transaction::SidechainTransaction;

/// 32-byte identifier of a storage version. Block-driven updates use the
/// block id; other writes draw a random version.
pub type Version = [u8; 32];
pub type BlockId = Version;
pub type BoxId = [u8; 32];
pub type TxId = [u8; 32];
