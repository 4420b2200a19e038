//! Key layout of the default column family.
//!
//! Every logical table is a single-byte prefix. Heights are big-endian so that the
//! natural key order follows the chain.

use bitnode_primitives::{BlockNumber, Hash256, OutPoint, Writer};

/// Block body by hash.
pub const BLOCK: u8 = b'b';
/// Height by block hash.
pub const HEIGHT: u8 = b'h';
/// Block hash by height.
pub const HASH: u8 = b'H';
/// Chain tip snapshot by height.
pub const TIP: u8 = b'T';
/// Current chain tip.
pub const CURRENT_TIP: [u8; 1] = [b'c'];
/// Unspent outputs, `txid || index`, valued by the containing block hash.
pub const UNSPENT: u8 = b'u';
/// Transaction location by txid.
pub const TX: u8 = b't';
/// Address occurrences, `len || address || txid`.
pub const ADDRESS: u8 = b'a';

/// Column family of the undo records, keyed by block hash.
pub const UNDO_CF: &str = "undo";

fn prefixed<const N: usize>(prefix: u8, body: &[u8]) -> [u8; N] {
    let mut key = [0u8; N];
    key[0] = prefix;
    key[1..].copy_from_slice(body);
    key
}

pub fn block_key(hash: &Hash256) -> [u8; 33] {
    prefixed(BLOCK, hash.as_bytes())
}

pub fn height_key(hash: &Hash256) -> [u8; 33] {
    prefixed(HEIGHT, hash.as_bytes())
}

pub fn hash_key(height: BlockNumber) -> [u8; 5] {
    prefixed(HASH, &height.to_be_bytes())
}

pub fn tip_key(height: BlockNumber) -> [u8; 5] {
    prefixed(TIP, &height.to_be_bytes())
}

pub fn coin_prefix(txid: &Hash256) -> [u8; 33] {
    prefixed(UNSPENT, txid.as_bytes())
}

pub fn coin_key(outpoint: &OutPoint) -> [u8; 37] {
    let mut key = [0u8; 37];
    key[..33].copy_from_slice(&coin_prefix(&outpoint.txid));
    key[33..].copy_from_slice(&outpoint.index.to_be_bytes());
    key
}

/// Output index of a coin key.
pub fn coin_index(key: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = key.get(33..37)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

pub fn tx_key(txid: &Hash256) -> [u8; 33] {
    prefixed(TX, txid.as_bytes())
}

/// `ADDRESS || var-int length || address`, the length keeps the keys prefix-free.
pub fn address_prefix(address: &str) -> Vec<u8> {
    let mut key = Writer::with_capacity(address.len() + 42);
    key.write_u8(ADDRESS).write_var_bytes(address.as_bytes());
    key.into_inner()
}

pub fn address_key(address: &str, txid: &Hash256) -> Vec<u8> {
    let mut key = address_prefix(address);
    key.extend_from_slice(txid.as_bytes());
    key
}

/// Txid at the end of an address key.
pub fn address_key_txid(key: &[u8]) -> Option<Hash256> {
    let start = key.len().checked_sub(32)?;
    Hash256::from_slice(&key[start..]).ok()
}

/// `block hash || tx index`, value of the tx and address index tables.
pub fn tx_location_value(block_hash: &Hash256, tx_index: u32) -> [u8; 36] {
    let mut value = [0u8; 36];
    value[..32].copy_from_slice(block_hash.as_bytes());
    value[32..].copy_from_slice(&tx_index.to_be_bytes());
    value
}

pub fn decode_tx_location(value: &[u8]) -> Option<(Hash256, u32)> {
    if value.len() != 36 {
        return None;
    }
    let block_hash = Hash256::from_slice(&value[..32]).ok()?;
    let tx_index = u32::from_be_bytes(value[32..].try_into().ok()?);
    Some((block_hash, tx_index))
}

pub fn decode_height(value: &[u8]) -> Option<BlockNumber> {
    value.try_into().ok().map(u32::from_be_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coin_keys_share_the_txid_prefix() {
        let txid = Hash256::double_sha256(b"tx");
        let key = coin_key(&OutPoint::new(txid, 258));
        assert!(key.starts_with(&coin_prefix(&txid)));
        assert_eq!(coin_index(&key), Some(258));
    }

    #[test]
    fn hash_keys_sort_by_height() {
        assert!(hash_key(255) < hash_key(256));
        assert!(tip_key(1) < tip_key(65536));
    }

    #[test]
    fn address_keys_do_not_collide_across_lengths() {
        let txid = Hash256::double_sha256(b"tx");
        let short = address_key("1abc", &txid);
        assert!(!short.starts_with(&address_prefix("1ab")));
        assert_eq!(address_key_txid(&short), Some(txid));
    }

    #[test]
    fn long_addresses_keep_their_full_length() {
        let txid = Hash256::double_sha256(b"tx");
        let long = "a".repeat(300);
        let truncated_len = "a".repeat(300 % 256);

        let key = address_key(&long, &txid);
        assert!(key.starts_with(&address_prefix(&long)));
        assert!(!key.starts_with(&address_prefix(&truncated_len)));
        assert_eq!(address_prefix(&long).len(), 1 + 3 + 300);
        assert_eq!(address_key_txid(&key), Some(txid));
    }

    #[test]
    fn tx_location_roundtrip() {
        let hash = Hash256::double_sha256(b"block");
        assert_eq!(
            decode_tx_location(&tx_location_value(&hash, 7)),
            Some((hash, 7))
        );
        assert_eq!(decode_tx_location(&[0u8; 3]), None);
    }
}
