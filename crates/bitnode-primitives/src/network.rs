use crate::block::{Block, BlockHeader, merkle_root};
use crate::hash::Hash256;
use crate::transaction::{MutableTransaction, OutPoint, TxIn, TxOut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// "The Times 03/Jan/2009 Chancellor on brink of second bailout for banks"
const GENESIS_SCRIPT_SIG: &str = "04ffff001d0104455468652054696d65732030332f4a616e2f32303039204368616e63656c6c6f72206f6e206272696e6b206f66207365636f6e64206261696c6f757420666f722062616e6b73";

const GENESIS_OUTPUT_SCRIPT: &str = "4104678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5fac";

const COIN: i64 = 100_000_000;

/// Bitcoin network the node follows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
}

impl Network {
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Mainnet => 8333,
            Self::Testnet => 18333,
        }
    }

    /// Network tag used by the API.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
        }
    }

    /// DNS seeds, with port.
    pub fn dns_seeds(&self) -> &'static [&'static str] {
        match self {
            Self::Mainnet => &[
                "seed.bitcoin.sipa.be:8333",                        // Pieter Wuille
                "dnsseed.bluematt.me:8333",                         // Matt Corallo
                "dnsseed.bitcoin.dashjr-list-of-p2p-nodes.us:8333", // Luke Dashjr
                "seed.bitcoinstats.com:8333",                       // Christian Decker
                "seed.bitcoin.jonasschnelli.ch:8333",               // Jonas Schnelli
                "seed.btc.petertodd.net:8333",                      // Peter Todd
                "seed.bitcoin.sprovoost.nl:8333",                   // Sjors Provoost
                "dnsseed.emzy.de:8333",                             // Stephan Oeste
                "seed.bitcoin.wiz.biz:8333",                        // Jason Maurice
                "seed.mainnet.achownodes.xyz:8333",                 // Ava Chow
            ],
            Self::Testnet => &[
                "testnet-seed.bitcoin.jonasschnelli.ch:18333",
                "seed.tbtc.petertodd.net:18333",
                "seed.testnet.bitcoin.sprovoost.nl:18333",
                "testnet-seed.bluematt.me:18333",
                "testnet-seed.achownodes.xyz:18333",
            ],
        }
    }

    pub fn to_bitcoin(self) -> bitcoin::Network {
        match self {
            Self::Mainnet => bitcoin::Network::Bitcoin,
            Self::Testnet => bitcoin::Network::Testnet,
        }
    }

    /// Builds the first block of the chain.
    pub fn genesis_block(&self) -> Block {
        let (time, nonce) = match self {
            Self::Mainnet => (1231006505, 2083236893),
            Self::Testnet => (1296688602, 414098458),
        };

        let mut coinbase = MutableTransaction::new();
        coinbase
            .add_input(TxIn::new(OutPoint::null(), decode_const(GENESIS_SCRIPT_SIG)))
            .add_output(TxOut::new(50 * COIN, decode_const(GENESIS_OUTPUT_SCRIPT)));
        let coinbase = coinbase.freeze();

        let header = BlockHeader::new(
            1,
            Hash256::ZERO,
            merkle_root([coinbase.hash()]),
            time,
            0x1d00ffff,
            nonce,
        );

        Block::new(header, vec![coinbase])
    }

    pub fn genesis_hash(&self) -> Hash256 {
        self.genesis_block().hash()
    }
}

fn decode_const(s: &str) -> Vec<u8> {
    hex::decode(s).unwrap_or_default()
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" | "bitcoin" | "main" => Ok(Self::Mainnet),
            "testnet" | "test" => Ok(Self::Testnet),
            other => Err(format!("Unknown network: {other}")),
        }
    }
}
