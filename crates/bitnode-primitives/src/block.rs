use crate::codec::{self, Decodable, DecodeError, Encodable, Reader, Writer};
use crate::hash::Hash256;
use crate::transaction::Transaction;
use std::fmt;
use std::sync::OnceLock;

/// Size of a serialized block header.
pub const HEADER_SIZE: usize = 80;

/// Block header.
///
/// The hash is computed on first access and cached. Every setter resets the cache, so the
/// next read recomputes it.
#[derive(Clone)]
pub struct BlockHeader {
    version: i32,
    prev_blockhash: Hash256,
    merkle_root: Hash256,
    time: u32,
    bits: u32,
    nonce: u32,
    cached_hash: OnceLock<Hash256>,
}

impl BlockHeader {
    pub fn new(
        version: i32,
        prev_blockhash: Hash256,
        merkle_root: Hash256,
        time: u32,
        bits: u32,
        nonce: u32,
    ) -> Self {
        Self {
            version,
            prev_blockhash,
            merkle_root,
            time,
            bits,
            nonce,
            cached_hash: OnceLock::new(),
        }
    }

    pub fn hash(&self) -> Hash256 {
        *self
            .cached_hash
            .get_or_init(|| Hash256::double_sha256(&codec::serialize(self)))
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn prev_blockhash(&self) -> Hash256 {
        self.prev_blockhash
    }

    pub fn merkle_root(&self) -> Hash256 {
        self.merkle_root
    }

    pub fn time(&self) -> u32 {
        self.time
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn nonce(&self) -> u32 {
        self.nonce
    }

    pub fn set_version(&mut self, version: i32) {
        self.version = version;
        self.invalidate();
    }

    pub fn set_prev_blockhash(&mut self, prev_blockhash: Hash256) {
        self.prev_blockhash = prev_blockhash;
        self.invalidate();
    }

    pub fn set_merkle_root(&mut self, merkle_root: Hash256) {
        self.merkle_root = merkle_root;
        self.invalidate();
    }

    pub fn set_time(&mut self, time: u32) {
        self.time = time;
        self.invalidate();
    }

    pub fn set_bits(&mut self, bits: u32) {
        self.bits = bits;
        self.invalidate();
    }

    pub fn set_nonce(&mut self, nonce: u32) {
        self.nonce = nonce;
        self.invalidate();
    }

    fn invalidate(&mut self) {
        self.cached_hash.take();
    }
}

impl PartialEq for BlockHeader {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
            && self.prev_blockhash == other.prev_blockhash
            && self.merkle_root == other.merkle_root
            && self.time == other.time
            && self.bits == other.bits
            && self.nonce == other.nonce
    }
}

impl Eq for BlockHeader {}

impl fmt::Debug for BlockHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockHeader")
            .field("hash", &self.hash())
            .field("version", &self.version)
            .field("prev_blockhash", &self.prev_blockhash)
            .field("merkle_root", &self.merkle_root)
            .field("time", &self.time)
            .field("bits", &format_args!("{:#010x}", self.bits))
            .field("nonce", &self.nonce)
            .finish()
    }
}

impl Encodable for BlockHeader {
    fn encode(&self, writer: &mut Writer) {
        writer
            .write_i32(self.version)
            .write_hash(&self.prev_blockhash)
            .write_hash(&self.merkle_root)
            .write_u32(self.time)
            .write_u32(self.bits)
            .write_u32(self.nonce);
    }
}

impl Decodable for BlockHeader {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self::new(
            reader.read_i32()?,
            reader.read_hash()?,
            reader.read_hash()?,
            reader.read_u32()?,
            reader.read_u32()?,
            reader.read_u32()?,
        ))
    }
}

/// Block header followed by its transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    header: BlockHeader,
    transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self {
            header,
            transactions,
        }
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn into_parts(self) -> (BlockHeader, Vec<Transaction>) {
        (self.header, self.transactions)
    }

    /// Merkle root over the transaction ids.
    pub fn compute_merkle_root(&self) -> Hash256 {
        merkle_root(self.transactions.iter().map(Transaction::hash))
    }

    /// Returns `true` if the header commits to the contained transactions.
    pub fn check_merkle_root(&self) -> bool {
        !self.transactions.is_empty() && self.compute_merkle_root() == self.header.merkle_root
    }

    /// Serialized size including witness data.
    pub fn total_size(&self) -> usize {
        codec::serialize(self).len()
    }
}

impl Encodable for Block {
    fn encode(&self, writer: &mut Writer) {
        writer.write(&self.header).write_vec(&self.transactions);
    }
}

impl Decodable for Block {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            header: reader.read()?,
            transactions: reader.read_vec()?,
        })
    }
}

/// Computes the merkle root of `hashes`, duplicating the last entry of odd-sized levels.
///
/// Returns the null hash for an empty list.
pub fn merkle_root(hashes: impl IntoIterator<Item = Hash256>) -> Hash256 {
    let mut level: Vec<Hash256> = hashes.into_iter().collect();

    if level.is_empty() {
        return Hash256::ZERO;
    }

    let mut concat = [0u8; 64];
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let left = pair[0];
                let right = pair.get(1).copied().unwrap_or(left);
                concat[..32].copy_from_slice(left.as_bytes());
                concat[32..].copy_from_slice(right.as_bytes());
                Hash256::double_sha256(&concat)
            })
            .collect();
    }

    level[0]
}
