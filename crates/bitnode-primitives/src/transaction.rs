use crate::codec::{self, Decodable, DecodeError, Encodable, Reader, Writer};
use crate::hash::Hash256;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reference to a specific transaction output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: Hash256,
    pub index: u32,
}

impl OutPoint {
    /// Output index of the null outpoint referenced by coinbase inputs.
    pub const NULL_INDEX: u32 = u32::MAX;

    pub const fn new(txid: Hash256, index: u32) -> Self {
        Self { txid, index }
    }

    pub const fn null() -> Self {
        Self {
            txid: Hash256::ZERO,
            index: Self::NULL_INDEX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.index == Self::NULL_INDEX && self.txid.is_null()
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

impl Encodable for OutPoint {
    fn encode(&self, writer: &mut Writer) {
        writer.write_hash(&self.txid).write_u32(self.index);
    }
}

impl Decodable for OutPoint {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            txid: reader.read_hash()?,
            index: reader.read_u32()?,
        })
    }
}

/// Transaction input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIn {
    pub previous_output: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
    /// Witness stack, empty for legacy inputs.
    pub witness: Vec<Vec<u8>>,
}

impl TxIn {
    pub const SEQUENCE_FINAL: u32 = u32::MAX;

    pub fn new(previous_output: OutPoint, script_sig: Vec<u8>) -> Self {
        Self {
            previous_output,
            script_sig,
            sequence: Self::SEQUENCE_FINAL,
            witness: Vec::new(),
        }
    }

    pub fn has_witness(&self) -> bool {
        !self.witness.is_empty()
    }
}

// Witness stacks are not part of the input encoding, they trail the outputs.
impl Encodable for TxIn {
    fn encode(&self, writer: &mut Writer) {
        writer
            .write(&self.previous_output)
            .write_var_bytes(&self.script_sig)
            .write_u32(self.sequence);
    }
}

impl Decodable for TxIn {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            previous_output: reader.read()?,
            script_sig: reader.read_var_bytes()?,
            sequence: reader.read_u32()?,
            witness: Vec::new(),
        })
    }
}

/// Transaction output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxOut {
    /// Amount in satoshis, `-1` when unset.
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

impl TxOut {
    pub const NULL_VALUE: i64 = -1;

    pub fn new(value: i64, script_pubkey: Vec<u8>) -> Self {
        Self {
            value,
            script_pubkey,
        }
    }

    pub fn null() -> Self {
        Self {
            value: Self::NULL_VALUE,
            script_pubkey: Vec::new(),
        }
    }

    pub fn is_null(&self) -> bool {
        self.value == Self::NULL_VALUE
    }
}

impl Default for TxOut {
    fn default() -> Self {
        Self::null()
    }
}

impl Encodable for TxOut {
    fn encode(&self, writer: &mut Writer) {
        writer.write_i64(self.value).write_var_bytes(&self.script_pubkey);
    }
}

impl Decodable for TxOut {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            value: reader.read_i64()?,
            script_pubkey: reader.read_var_bytes()?,
        })
    }
}

/// Transaction fields without the derived identifiers.
///
/// This is the builder form of [`Transaction`], call [`MutableTransaction::freeze`]
/// once assembled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutableTransaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Default for MutableTransaction {
    fn default() -> Self {
        Self {
            version: 1,
            inputs: Vec::new(),
            outputs: Vec::new(),
            lock_time: 0,
        }
    }
}

impl MutableTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_input(&mut self, input: TxIn) -> &mut Self {
        self.inputs.push(input);
        self
    }

    pub fn add_output(&mut self, output: TxOut) -> &mut Self {
        self.outputs.push(output);
        self
    }

    pub fn has_witness(&self) -> bool {
        self.inputs.iter().any(TxIn::has_witness)
    }

    /// Computes the identifiers and returns the immutable transaction.
    pub fn freeze(self) -> Transaction {
        let hash = Hash256::double_sha256(&self.to_bytes(false));
        let witness_hash = if self.has_witness() {
            Hash256::double_sha256(&self.to_bytes(true))
        } else {
            hash
        };
        Transaction {
            inner: self,
            hash,
            witness_hash,
        }
    }

    fn to_bytes(&self, allow_witness: bool) -> Vec<u8> {
        let mut writer = Writer::with_capacity(256);
        self.encode_with(&mut writer, allow_witness);
        writer.into_inner()
    }

    fn encode_with(&self, writer: &mut Writer, allow_witness: bool) {
        let with_witness = allow_witness && self.has_witness();

        writer.write_i32(self.version);
        if with_witness {
            // Empty input vector marker followed by the flags.
            writer.write_u8(0).write_u8(1);
        }
        writer.write_vec(&self.inputs).write_vec(&self.outputs);
        if with_witness {
            for input in &self.inputs {
                writer.write_vec_with(&input.witness, |w, item| {
                    w.write_var_bytes(item);
                });
            }
        }
        writer.write_u32(self.lock_time);
    }

    fn decode_with(reader: &mut Reader<'_>, allow_witness: bool) -> Result<Self, DecodeError> {
        let version = reader.read_i32()?;
        let mut flags = 0u8;
        let mut inputs: Vec<TxIn> = reader.read_vec()?;
        let mut outputs = Vec::new();

        if inputs.is_empty() && allow_witness {
            flags = reader.read_u8()?;
            if flags != 0 {
                inputs = reader.read_vec()?;
                outputs = reader.read_vec()?;
            }
        } else {
            outputs = reader.read_vec()?;
        }

        if flags & 1 != 0 && allow_witness {
            flags ^= 1;
            for input in inputs.iter_mut() {
                input.witness = reader.read_vec_with(Reader::read_var_bytes)?;
            }
            if !inputs.iter().any(TxIn::has_witness) {
                return Err(DecodeError::SuperfluousWitnessRecord);
            }
        }

        if flags != 0 {
            return Err(DecodeError::UnknownOptionalData(flags));
        }

        Ok(Self {
            version,
            inputs,
            outputs,
            lock_time: reader.read_u32()?,
        })
    }
}

impl From<Transaction> for MutableTransaction {
    fn from(tx: Transaction) -> Self {
        tx.inner
    }
}

/// Immutable transaction with its identifiers computed on construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    inner: MutableTransaction,
    hash: Hash256,
    witness_hash: Hash256,
}

impl Transaction {
    pub fn version(&self) -> i32 {
        self.inner.version
    }

    pub fn inputs(&self) -> &[TxIn] {
        &self.inner.inputs
    }

    pub fn outputs(&self) -> &[TxOut] {
        &self.inner.outputs
    }

    pub fn lock_time(&self) -> u32 {
        self.inner.lock_time
    }

    /// Transaction id, computed without witness data.
    pub fn hash(&self) -> Hash256 {
        self.hash
    }

    /// Witness transaction id, equal to [`Self::hash`] when no input carries a witness.
    pub fn witness_hash(&self) -> Hash256 {
        self.witness_hash
    }

    pub fn has_witness(&self) -> bool {
        self.inner.has_witness()
    }

    pub fn is_coinbase(&self) -> bool {
        self.inner.inputs.len() == 1 && self.inner.inputs[0].previous_output.is_null()
    }

    /// Serialization excluding witness data.
    pub fn encode_without_witness(&self, writer: &mut Writer) {
        self.inner.encode_with(writer, false);
    }

    /// Decodes a transaction serialized without witness data.
    pub fn decode_without_witness(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        MutableTransaction::decode_with(reader, false).map(MutableTransaction::freeze)
    }

    /// Size of the serialization including witness data.
    pub fn total_size(&self) -> usize {
        codec::serialize(self).len()
    }

    /// Size of the serialization excluding witness data.
    pub fn base_size(&self) -> usize {
        self.inner.to_bytes(false).len()
    }
}

impl Encodable for Transaction {
    fn encode(&self, writer: &mut Writer) {
        self.inner.encode_with(writer, true);
    }
}

impl Decodable for Transaction {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        MutableTransaction::decode_with(reader, true).map(MutableTransaction::freeze)
    }
}
