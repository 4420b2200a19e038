//! Fixtures shared by the bitnode test suites.

use bitnode_primitives::codec::deserialize;
use bitnode_primitives::{
    Block, BlockHeader, Hash256, MutableTransaction, OutPoint, Transaction, TxIn, TxOut, merkle_root,
};

/// Block subsidy of the early chain.
pub const SUBSIDY: i64 = 50 * 100_000_000;

fn decode_raw_block(hex_str: &str) -> Block {
    let data = hex::decode(hex_str).expect("Failed to convert hex str");
    deserialize(&data).expect("Failed to convert hex data to Block")
}

/// Mainnet blocks 0 to 3.
pub fn block_data() -> Vec<Block> {
    // genesis block
    let block0 = decode_raw_block("0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a29ab5f49ffff001d1dac2b7c0101000000010000000000000000000000000000000000000000000000000000000000000000ffffffff4d04ffff001d0104455468652054696d65732030332f4a616e2f32303039204368616e63656c6c6f72206f6e206272696e6b206f66207365636f6e64206261696c6f757420666f722062616e6b73ffffffff0100f2052a01000000434104678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5fac00000000");
    // 00000000839a8e6886ab5951d76f411475428afc90947ee320161bbf18eb6048
    // height 1
    let block1 = decode_raw_block("010000006fe28c0ab6f1b372c1a6a246ae63f74f931e8365e15a089c68d6190000000000982051fd1e4ba744bbbe680e1fee14677ba1a3c3540bf7b1cdb606e857233e0e61bc6649ffff001d01e362990101000000010000000000000000000000000000000000000000000000000000000000000000ffffffff0704ffff001d0104ffffffff0100f2052a0100000043410496b538e853519c726a2c91e61ec11600ae1390813a627c66fb8be7947be63c52da7589379515d4e0a604f8141781e62294721166bf621e73a82cbf2342c858eeac00000000");
    // 000000006a625f06636b8bb6ac7b960a8d03705d1ace08b1a19da3fdcc99ddbd
    // height 2
    let block2 = decode_raw_block("010000004860eb18bf1b1620e37e9490fc8a427514416fd75159ab86688e9a8300000000d5fdcc541e25de1c7a5addedf24858b8bb665c9f36ef744ee42c316022c90f9bb0bc6649ffff001d08d2bd610101000000010000000000000000000000000000000000000000000000000000000000000000ffffffff0704ffff001d010bffffffff0100f2052a010000004341047211a824f55b505228e4c3d5194c1fcfaa15a456abdf37f9b9d97a4040afc073dee6c89064984f03385237d92167c13e236446b417ab79a0fcae412ae3316b77ac00000000");
    // 0000000082b5015589a3fdf2d4baff403e6f0be035a5d9742c1cae6295464449
    // height 3
    let block3 = decode_raw_block("01000000bddd99ccfda39da1b108ce1a5d70038d0a967bacb68b6b63065f626a0000000044f672226090d85db9a9f2fbfe5f0f9609b387af7be5b7fbb7a1767c831c9e995dbe6649ffff001d05e0ed6d0101000000010000000000000000000000000000000000000000000000000000000000000000ffffffff0704ffff001d010effffffff0100f2052a0100000043410494b9d3e76c5b1629ecf97fff95d7a4bbdac87cc26099ada28066c6ff1eb9191223cd897194a08d0c2726c5747f1db49e8cf90e75dc3e3550ae9b30086f3cd5aaac00000000");
    vec![block0, block1, block2, block3]
}

/// Pay-to-pubkey-hash script with a hash made of `seed` bytes.
pub fn p2pkh_script(seed: u8) -> Vec<u8> {
    let mut script = vec![0x76, 0xa9, 0x14];
    script.extend_from_slice(&[seed; 20]);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

/// Coinbase paying [`SUBSIDY`] to `script_pubkey`.
///
/// `tag` ends up in the script sig so that coinbases of different blocks have distinct ids.
pub fn coinbase(tag: u32, script_pubkey: Vec<u8>) -> Transaction {
    let mut script_sig = vec![0x04];
    script_sig.extend_from_slice(&tag.to_le_bytes());
    let mut tx = MutableTransaction::new();
    tx.add_input(TxIn::new(OutPoint::null(), script_sig))
        .add_output(TxOut::new(SUBSIDY, script_pubkey));
    tx.freeze()
}

/// Transaction spending `inputs` into `outputs`.
pub fn spend(inputs: &[OutPoint], outputs: Vec<TxOut>) -> Transaction {
    let mut tx = MutableTransaction::new();
    for outpoint in inputs {
        tx.add_input(TxIn::new(*outpoint, vec![0x51]));
    }
    tx.outputs = outputs;
    tx.freeze()
}

/// Builds a block on top of `prev_blockhash` with a valid merkle root.
///
/// `nonce` only serves to tell apart competing blocks with the same content.
pub fn build_block(prev_blockhash: Hash256, transactions: Vec<Transaction>, nonce: u32) -> Block {
    let header = BlockHeader::new(
        1,
        prev_blockhash,
        merkle_root(transactions.iter().map(Transaction::hash)),
        1_600_000_000 + nonce,
        0x207fffff,
        nonce,
    );
    Block::new(header, transactions)
}

/// Chain of `len` blocks holding only a coinbase each, starting from `parent`.
pub fn build_chain(parent: Hash256, len: u32, tag_offset: u32) -> Vec<Block> {
    let mut blocks = Vec::with_capacity(len as usize);
    let mut prev = parent;
    for i in 0..len {
        let tag = tag_offset + i;
        let block = build_block(prev, vec![coinbase(tag, p2pkh_script(tag as u8))], tag);
        prev = block.hash();
        blocks.push(block);
    }
    blocks
}
