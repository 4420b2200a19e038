//! Classification of locking scripts and the addresses they pay to.

use crate::network::Network;
use bitcoin::{Address, PublicKey, Script};

const OP_0: u8 = 0x00;
const OP_1: u8 = 0x51;
const OP_16: u8 = 0x60;
const OP_RETURN: u8 = 0x6a;
const OP_DUP: u8 = 0x76;
const OP_EQUAL: u8 = 0x87;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_HASH160: u8 = 0xa9;
const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKMULTISIG: u8 = 0xae;

/// Standard shape of a locking script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptKind {
    /// `<pubkey> OP_CHECKSIG`
    PubKey(Vec<u8>),
    /// `OP_DUP OP_HASH160 <20 bytes> OP_EQUALVERIFY OP_CHECKSIG`
    PubKeyHash([u8; 20]),
    /// `OP_HASH160 <20 bytes> OP_EQUAL`
    ScriptHash([u8; 20]),
    /// `OP_m <pubkey>... OP_n OP_CHECKMULTISIG`
    Multisig { required: u8, pubkeys: Vec<Vec<u8>> },
    /// Segwit output of any version.
    WitnessProgram { version: u8, program: Vec<u8> },
    /// `OP_RETURN ...`, provably unspendable.
    NullData,
    Unknown,
}

impl ScriptKind {
    pub fn classify(script: &[u8]) -> Self {
        match script {
            [OP_RETURN, ..] => Self::NullData,
            [OP_DUP, OP_HASH160, 20, hash @ .., OP_EQUALVERIFY, OP_CHECKSIG] if hash.len() == 20 => {
                Self::PubKeyHash(to_array(hash))
            }
            [OP_HASH160, 20, hash @ .., OP_EQUAL] if hash.len() == 20 => {
                Self::ScriptHash(to_array(hash))
            }
            [len @ (33 | 65), key @ .., OP_CHECKSIG] if key.len() == *len as usize => {
                Self::PubKey(key.to_vec())
            }
            [version @ (OP_0 | OP_1..=OP_16), len @ 2..=40, program @ ..]
                if program.len() == *len as usize =>
            {
                Self::WitnessProgram {
                    version: decode_small_int(*version),
                    program: program.to_vec(),
                }
            }
            [m @ OP_1..=OP_16, .., n @ OP_1..=OP_16, OP_CHECKMULTISIG] => {
                parse_multisig(&script[1..script.len() - 2], *m, *n).unwrap_or(Self::Unknown)
            }
            _ => Self::Unknown,
        }
    }

    /// Whether outputs of this kind can never be spent.
    pub fn is_unspendable(&self) -> bool {
        matches!(self, Self::NullData)
    }
}

fn to_array(hash: &[u8]) -> [u8; 20] {
    let mut array = [0u8; 20];
    array.copy_from_slice(hash);
    array
}

fn decode_small_int(opcode: u8) -> u8 {
    if opcode == OP_0 { 0 } else { opcode - OP_1 + 1 }
}

fn parse_multisig(mut keys: &[u8], m: u8, n: u8) -> Option<ScriptKind> {
    let required = decode_small_int(m);
    let total = decode_small_int(n);
    let mut pubkeys = Vec::with_capacity(total as usize);

    while let [len @ (33 | 65), rest @ ..] = keys {
        let len = *len as usize;
        if rest.len() < len {
            return None;
        }
        pubkeys.push(rest[..len].to_vec());
        keys = &rest[len..];
    }

    (keys.is_empty() && pubkeys.len() == total as usize && required <= total).then_some(
        ScriptKind::Multisig { required, pubkeys },
    )
}

/// Returns the addresses a locking script pays to.
///
/// Bare public keys, including the ones in multisig scripts, are reported as their
/// pay-to-pubkey-hash address. Unspendable and non-standard scripts have none.
pub fn extract_addresses(script: &[u8], network: Network) -> Vec<String> {
    let network = network.to_bitcoin();

    match ScriptKind::classify(script) {
        ScriptKind::PubKey(key) => pubkey_address(&key, network).into_iter().collect(),
        ScriptKind::Multisig { pubkeys, .. } => pubkeys
            .iter()
            .filter_map(|key| pubkey_address(key, network))
            .collect(),
        ScriptKind::PubKeyHash(_) | ScriptKind::ScriptHash(_) | ScriptKind::WitnessProgram { .. } => {
            Address::from_script(Script::from_bytes(script), network)
                .map(|address| vec![address.to_string()])
                .unwrap_or_default()
        }
        ScriptKind::NullData | ScriptKind::Unknown => Vec::new(),
    }
}

fn pubkey_address(key: &[u8], network: bitcoin::Network) -> Option<String> {
    let public_key = PublicKey::from_slice(key).ok()?;
    Some(Address::p2pkh(public_key.pubkey_hash(), network).to_string())
}
