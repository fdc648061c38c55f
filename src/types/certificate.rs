use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::crypto::{double_sha256, FIELD_ELEMENT_LENGTH};
use crate::errors::{ChainError, ChainResult};

/// Mainchain-observed certificate closing a withdrawal epoch.
///
/// All multi-byte numeric fields are little-endian on the wire and every
/// variable-length sequence is prefixed with a Bitcoin-style CompactSize
/// varint. The raw byte slice the certificate was parsed from is retained so
/// that re-serialization is byte-exact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WithdrawalEpochCertificate {
    pub version: i32,
    pub sidechain_id: [u8; 32],
    pub epoch_number: i32,
    pub quality: i64,
    pub end_cumulative_sc_tx_commitment_tree_root: Vec<u8>,
    pub proof: Vec<u8>,
    pub field_element_certificate_fields: Vec<FieldElementCertificateField>,
    pub bit_vector_certificate_fields: Vec<BitVectorCertificateField>,
    pub ft_min_amount: i64,
    pub btr_fee: i64,
    pub transaction_inputs: Vec<MainchainTransactionInput>,
    pub transaction_outputs: Vec<MainchainTransactionOutput>,
    pub backward_transfer_outputs: Vec<BackwardTransferOutput>,
    certificate_bytes: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldElementCertificateField(pub Vec<u8>);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BitVectorCertificateField(pub Vec<u8>);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MainchainTransactionInput {
    pub prev_tx_hash: [u8; 32],
    pub output_index: i32,
    pub script_sig: Vec<u8>,
    pub sequence: i32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MainchainTransactionOutput {
    pub value: i64,
    pub script: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackwardTransferOutput {
    pub amount: i64,
    pub public_key_hash: [u8; 20],
}

impl WithdrawalEpochCertificate {
    #[allow(clippy::too_many_arguments)]
    pub fn assemble(
        version: i32,
        sidechain_id: [u8; 32],
        epoch_number: i32,
        quality: i64,
        end_cumulative_sc_tx_commitment_tree_root: Vec<u8>,
        proof: Vec<u8>,
        field_element_certificate_fields: Vec<FieldElementCertificateField>,
        bit_vector_certificate_fields: Vec<BitVectorCertificateField>,
        ft_min_amount: i64,
        btr_fee: i64,
        transaction_inputs: Vec<MainchainTransactionInput>,
        transaction_outputs: Vec<MainchainTransactionOutput>,
        backward_transfer_outputs: Vec<BackwardTransferOutput>,
    ) -> ChainResult<Self> {
        if end_cumulative_sc_tx_commitment_tree_root.len() != FIELD_ELEMENT_LENGTH {
            return Err(ChainError::Validation(
                "input data corrupted: invalid commitment tree root length".into(),
            ));
        }
        let mut bytes = Vec::new();
        write_i32_le(&mut bytes, version);
        bytes.extend_from_slice(&sidechain_id);
        write_i32_le(&mut bytes, epoch_number);
        write_i64_le(&mut bytes, quality);
        write_var_bytes(&mut bytes, &end_cumulative_sc_tx_commitment_tree_root);
        write_var_bytes(&mut bytes, &proof);
        write_compact_size(&mut bytes, field_element_certificate_fields.len() as u64);
        for field in &field_element_certificate_fields {
            write_var_bytes(&mut bytes, &field.0);
        }
        write_compact_size(&mut bytes, bit_vector_certificate_fields.len() as u64);
        for field in &bit_vector_certificate_fields {
            write_var_bytes(&mut bytes, &field.0);
        }
        write_i64_le(&mut bytes, ft_min_amount);
        write_i64_le(&mut bytes, btr_fee);
        write_compact_size(&mut bytes, transaction_inputs.len() as u64);
        for input in &transaction_inputs {
            bytes.extend_from_slice(&input.prev_tx_hash);
            write_i32_le(&mut bytes, input.output_index);
            write_var_bytes(&mut bytes, &input.script_sig);
            write_i32_le(&mut bytes, input.sequence);
        }
        write_compact_size(&mut bytes, transaction_outputs.len() as u64);
        for output in &transaction_outputs {
            write_i64_le(&mut bytes, output.value);
            write_var_bytes(&mut bytes, &output.script);
        }
        write_compact_size(&mut bytes, backward_transfer_outputs.len() as u64);
        for output in &backward_transfer_outputs {
            write_i64_le(&mut bytes, output.amount);
            bytes.extend_from_slice(&output.public_key_hash);
        }
        Ok(Self {
            version,
            sidechain_id,
            epoch_number,
            quality,
            end_cumulative_sc_tx_commitment_tree_root,
            proof,
            field_element_certificate_fields,
            bit_vector_certificate_fields,
            ft_min_amount,
            btr_fee,
            transaction_inputs,
            transaction_outputs,
            backward_transfer_outputs,
            certificate_bytes: bytes,
        })
    }

    pub fn parse(data: &[u8], offset: usize) -> ChainResult<Self> {
        let mut reader = CertificateReader::new(data, offset)?;
        let version = reader.read_i32_le()?;
        let sidechain_id = reader.read_array::<32>()?;
        let epoch_number = reader.read_i32_le()?;
        let quality = reader.read_i64_le()?;
        let end_cumulative_sc_tx_commitment_tree_root = reader.read_var_bytes()?;
        if end_cumulative_sc_tx_commitment_tree_root.len() != FIELD_ELEMENT_LENGTH {
            return Err(ChainError::Validation(
                "input data corrupted: invalid commitment tree root length".into(),
            ));
        }
        let proof = reader.read_var_bytes()?;
        let field_element_count = reader.read_compact_size()?;
        let mut field_element_certificate_fields = Vec::new();
        for _ in 0..field_element_count {
            field_element_certificate_fields
                .push(FieldElementCertificateField(reader.read_var_bytes()?));
        }
        let bit_vector_count = reader.read_compact_size()?;
        let mut bit_vector_certificate_fields = Vec::new();
        for _ in 0..bit_vector_count {
            bit_vector_certificate_fields
                .push(BitVectorCertificateField(reader.read_var_bytes()?));
        }
        let ft_min_amount = reader.read_i64_le()?;
        let btr_fee = reader.read_i64_le()?;
        let input_count = reader.read_compact_size()?;
        let mut transaction_inputs = Vec::new();
        for _ in 0..input_count {
            let prev_tx_hash = reader.read_array::<32>()?;
            let output_index = reader.read_i32_le()?;
            let script_sig = reader.read_var_bytes()?;
            let sequence = reader.read_i32_le()?;
            transaction_inputs.push(MainchainTransactionInput {
                prev_tx_hash,
                output_index,
                script_sig,
                sequence,
            });
        }
        let output_count = reader.read_compact_size()?;
        let mut transaction_outputs = Vec::new();
        for _ in 0..output_count {
            let value = reader.read_i64_le()?;
            let script = reader.read_var_bytes()?;
            transaction_outputs.push(MainchainTransactionOutput { value, script });
        }
        let backward_transfer_count = reader.read_compact_size()?;
        let mut backward_transfer_outputs = Vec::new();
        for _ in 0..backward_transfer_count {
            let amount = reader.read_i64_le()?;
            let public_key_hash = reader.read_array::<20>()?;
            backward_transfer_outputs.push(BackwardTransferOutput {
                amount,
                public_key_hash,
            });
        }
        let certificate_bytes = data[offset..reader.position()].to_vec();
        Ok(Self {
            version,
            sidechain_id,
            epoch_number,
            quality,
            end_cumulative_sc_tx_commitment_tree_root,
            proof,
            field_element_certificate_fields,
            bit_vector_certificate_fields,
            ft_min_amount,
            btr_fee,
            transaction_inputs,
            transaction_outputs,
            backward_transfer_outputs,
            certificate_bytes,
        })
    }

    /// Raw wire form this certificate was parsed from; re-serialization
    /// writes these bytes verbatim.
    pub fn bytes(&self) -> &[u8] {
        &self.certificate_bytes
    }

    pub fn hash(&self) -> [u8; 32] {
        let mut hash = double_sha256(&self.certificate_bytes);
        hash.reverse();
        hash
    }
}

impl Serialize for WithdrawalEpochCertificate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.certificate_bytes)
    }
}

impl<'de> Deserialize<'de> for WithdrawalEpochCertificate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        WithdrawalEpochCertificate::parse(&bytes, 0).map_err(D::Error::custom)
    }
}

struct CertificateReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> CertificateReader<'a> {
    fn new(data: &'a [u8], offset: usize) -> ChainResult<Self> {
        if offset > data.len() {
            return Err(corrupted("offset beyond input"));
        }
        Ok(Self {
            data,
            position: offset,
        })
    }

    fn position(&self) -> usize {
        self.position
    }

    fn read_slice(&mut self, length: usize) -> ChainResult<&'a [u8]> {
        let end = self
            .position
            .checked_add(length)
            .ok_or_else(|| corrupted("length overflow"))?;
        if end > self.data.len() {
            return Err(corrupted("unexpected end of input"));
        }
        let slice = &self.data[self.position..end];
        self.position = end;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> ChainResult<[u8; N]> {
        let slice = self.read_slice(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn read_i32_le(&mut self) -> ChainResult<i32> {
        Ok(i32::from_le_bytes(self.read_array::<4>()?))
    }

    fn read_i64_le(&mut self) -> ChainResult<i64> {
        Ok(i64::from_le_bytes(self.read_array::<8>()?))
    }

    fn read_compact_size(&mut self) -> ChainResult<u64> {
        let marker = self.read_array::<1>()?[0];
        match marker {
            0xFD => Ok(u16::from_le_bytes(self.read_array::<2>()?) as u64),
            0xFE => Ok(u32::from_le_bytes(self.read_array::<4>()?) as u64),
            0xFF => Ok(u64::from_le_bytes(self.read_array::<8>()?)),
            value => Ok(value as u64),
        }
    }

    fn read_var_bytes(&mut self) -> ChainResult<Vec<u8>> {
        let length = self.read_compact_size()?;
        let length = usize::try_from(length).map_err(|_| corrupted("length overflow"))?;
        Ok(self.read_slice(length)?.to_vec())
    }
}

fn corrupted(detail: &str) -> ChainError {
    ChainError::Validation(format!("input data corrupted: {detail}"))
}

fn write_i32_le(buffer: &mut Vec<u8>, value: i32) {
    buffer.extend_from_slice(&value.to_le_bytes());
}

fn write_i64_le(buffer: &mut Vec<u8>, value: i64) {
    buffer.extend_from_slice(&value.to_le_bytes());
}

pub fn write_compact_size(buffer: &mut Vec<u8>, value: u64) {
    if value < 0xFD {
        buffer.push(value as u8);
    } else if value <= 0xFFFF {
        buffer.push(0xFD);
        buffer.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value <= 0xFFFF_FFFF {
        buffer.push(0xFE);
        buffer.extend_from_slice(&(value as u32).to_le_bytes());
    } else {
        buffer.push(0xFF);
        buffer.extend_from_slice(&value.to_le_bytes());
    }
}

fn write_var_bytes(buffer: &mut Vec<u8>, data: &[u8]) {
    write_compact_size(buffer, data.len() as u64);
    buffer.extend_from_slice(data);
}
