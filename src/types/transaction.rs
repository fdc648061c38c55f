use serde::{Deserialize, Serialize};

use crate::crypto::blake2b256;

use super::boxes::SidechainBox;
use super::{BoxId, TxId};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidechainTransaction {
    id: TxId,
    inputs: Vec<BoxId>,
    outputs: Vec<SidechainBox>,
    fee: u64,
}

impl SidechainTransaction {
    pub fn new(inputs: Vec<BoxId>, outputs: Vec<SidechainBox>, fee: u64) -> Self {
        let id = compute_id(&inputs, &outputs, fee);
        Self {
            id,
            inputs,
            outputs,
            fee,
        }
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    pub fn box_ids_to_open(&self) -> &[BoxId] {
        &self.inputs
    }

    pub fn new_boxes(&self) -> &[SidechainBox] {
        &self.outputs
    }

    pub fn fee(&self) -> u64 {
        self.fee
    }
}

fn compute_id(inputs: &[BoxId], outputs: &[SidechainBox], fee: u64) -> TxId {
    let mut data = Vec::new();
    for input in inputs {
        data.extend_from_slice(input);
    }
    for output in outputs {
        data.extend_from_slice(&output.id());
    }
    data.extend_from_slice(&fee.to_le_bytes());
    blake2b256(&data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::PublicKey25519Proposition;
    use crate::types::boxes::CoinBox;

    #[test]
    fn transaction_id_commits_to_inputs_and_outputs() {
        let output = SidechainBox::Coin(CoinBox {
            proposition: PublicKey25519Proposition([1u8; 32]),
            value: 4,
            nonce: 0,
        });
        let a = SidechainTransaction::new(vec![[2u8; 32]], vec![output.clone()], 1);
        let b = SidechainTransaction::new(vec![[3u8; 32]], vec![output], 1);
        assert_ne!(a.id(), b.id());
    }
}
