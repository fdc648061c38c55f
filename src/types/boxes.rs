use serde::{Deserialize, Serialize};

use crate::crypto::blake2b256_of_slices;
use crate::merkle::MerklePath;
use crate::secret::PublicKey25519Proposition;

use super::{BoxId, TxId};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinBox {
    pub proposition: PublicKey25519Proposition,
    pub value: u64,
    pub nonce: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForgerBox {
    pub proposition: PublicKey25519Proposition,
    pub value: u64,
    pub nonce: u64,
    pub block_sign_proposition: PublicKey25519Proposition,
    pub vrf_public_key: [u8; 32],
}

impl ForgerBox {
    pub fn forging_stake_info(&self) -> ForgingStakeInfo {
        ForgingStakeInfo {
            block_sign_proposition: self.block_sign_proposition,
            vrf_public_key: self.vrf_public_key,
            stake_amount: self.value,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomBox {
    pub proposition: PublicKey25519Proposition,
    pub value: u64,
    pub nonce: u64,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SidechainBox {
    Coin(CoinBox),
    Forger(ForgerBox),
    Custom(CustomBox),
}

impl SidechainBox {
    pub fn id(&self) -> BoxId {
        match self {
            SidechainBox::Coin(coin) => blake2b256_of_slices(&[
                b"coin",
                coin.proposition.bytes(),
                &coin.value.to_le_bytes(),
                &coin.nonce.to_le_bytes(),
            ]),
            SidechainBox::Forger(forger) => blake2b256_of_slices(&[
                b"forger",
                forger.proposition.bytes(),
                &forger.value.to_le_bytes(),
                &forger.nonce.to_le_bytes(),
                forger.block_sign_proposition.bytes(),
                &forger.vrf_public_key,
            ]),
            SidechainBox::Custom(custom) => blake2b256_of_slices(&[
                b"custom",
                custom.proposition.bytes(),
                &custom.value.to_le_bytes(),
                &custom.nonce.to_le_bytes(),
                &custom.payload,
            ]),
        }
    }

    pub fn proposition(&self) -> &PublicKey25519Proposition {
        match self {
            SidechainBox::Coin(coin) => &coin.proposition,
            SidechainBox::Forger(forger) => &forger.proposition,
            SidechainBox::Custom(custom) => &custom.proposition,
        }
    }

    pub fn value(&self) -> u64 {
        match self {
            SidechainBox::Coin(coin) => coin.value,
            SidechainBox::Forger(forger) => forger.value,
            SidechainBox::Custom(custom) => custom.value,
        }
    }

    pub fn nonce(&self) -> u64 {
        match self {
            SidechainBox::Coin(coin) => coin.nonce,
            SidechainBox::Forger(forger) => forger.nonce,
            SidechainBox::Custom(custom) => custom.nonce,
        }
    }

    /// Coin and forger boxes both carry transferable value and take part in
    /// ceased-sidechain-withdrawal evidence.
    pub fn is_coin(&self) -> bool {
        matches!(self, SidechainBox::Coin(_) | SidechainBox::Forger(_))
    }

    pub fn custom_fields_hash(&self) -> [u8; 32] {
        match self {
            SidechainBox::Coin(_) => [0u8; 32],
            SidechainBox::Forger(forger) => blake2b256_of_slices(&[
                forger.block_sign_proposition.bytes(),
                &forger.vrf_public_key,
            ]),
            SidechainBox::Custom(custom) => blake2b256_of_slices(&[&custom.payload]),
        }
    }

    pub fn as_forger(&self) -> Option<&ForgerBox> {
        match self {
            SidechainBox::Forger(forger) => Some(forger),
            _ => None,
        }
    }
}

/// Stake summary a forger box contributes to the epoch forging-stake tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForgingStakeInfo {
    pub block_sign_proposition: PublicKey25519Proposition,
    pub vrf_public_key: [u8; 32],
    pub stake_amount: u64,
}

impl ForgingStakeInfo {
    pub fn hash(&self) -> [u8; 32] {
        blake2b256_of_slices(&[
            self.block_sign_proposition.bytes(),
            &self.vrf_public_key,
            &self.stake_amount.to_le_bytes(),
        ])
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForgingStakeMerklePathInfo {
    pub stake_info: ForgingStakeInfo,
    pub merkle_path: MerklePath,
}

/// A box tracked by the wallet, annotated with the transaction that created
/// it. Fee payment boxes have no creating transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletBox {
    pub sidechain_box: SidechainBox,
    pub creating_tx_id: Option<TxId>,
    pub block_timestamp: u64,
}

impl WalletBox {
    pub fn id(&self) -> BoxId {
        self.sidechain_box.id()
    }
}
