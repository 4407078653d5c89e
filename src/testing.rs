//! Builders for regtest chains used by unit and integration tests.
//!
//! Headers are mined at the regtest target (`0x207fffff`), where about one
//! nonce in two passes, so building a few hundred of them is instant.

use crate::blockchain::pow::{bits_to_target, check_proof_of_work, REGTEST_BITS};
use crate::blockchain::{double_sha256, Block, BlockHeader, Hash256};
use crate::config::{Config, REGTEST_GENESIS_HEX};
use crate::crypto::KeyPair;
use crate::transaction::{OutPoint, Transaction, TxIn, TxOut};
use primitive_types::U256;

pub fn genesis_header() -> BlockHeader {
    BlockHeader::from_hex(REGTEST_GENESIS_HEX).expect("regtest genesis header is well formed")
}

fn regtest_limit() -> U256 {
    bits_to_target(REGTEST_BITS).expect("regtest bits encode a valid target")
}

/// Mine a header on top of `previous_hash`.
pub fn mine_header(previous_hash: Hash256, merkle_root: Hash256, timestamp: u32) -> BlockHeader {
    let limit = regtest_limit();
    let mut header = BlockHeader {
        version: 1,
        previous_hash,
        merkle_root,
        timestamp,
        bits: REGTEST_BITS,
        nonce: 0,
    };
    while check_proof_of_work(&header, limit).is_err() {
        header.nonce += 1;
    }
    header
}

/// Child of `parent` with no body. Siblings with different `salt`s differ.
pub fn mine_child(parent: &BlockHeader, timestamp: u32, salt: u32) -> BlockHeader {
    let merkle_root = double_sha256(&salt.to_le_bytes());
    mine_header(parent.hash(), merkle_root, timestamp)
}

/// `count` headers extending `parent`, one minute apart.
pub fn header_chain(parent: &BlockHeader, count: usize, salt: u32) -> Vec<BlockHeader> {
    let mut out: Vec<BlockHeader> = Vec::with_capacity(count);
    let mut tip = *parent;
    for _ in 0..count {
        tip = mine_child(&tip, tip.timestamp + 60, salt);
        out.push(tip);
    }
    out
}

/// Block with `transactions` on top of `parent`, one minute later.
pub fn build_block(parent: &BlockHeader, transactions: Vec<Transaction>) -> Block {
    let merkle_root = Block::calculate_merkle_root(&transactions);
    let header = mine_header(parent.hash(), merkle_root, parent.timestamp + 60);
    Block::new(header, transactions)
}

pub fn coinbase_block(parent: &BlockHeader, height: u32, value: u64, locking_script: Vec<u8>) -> Block {
    build_block(parent, vec![Transaction::coinbase(height, value, locking_script)])
}

/// Blocks at heights 1..=count above `genesis`, each holding a single coinbase.
pub fn coinbase_chain(genesis: &BlockHeader, count: u32) -> Vec<Block> {
    let mut blocks: Vec<Block> = Vec::with_capacity(count as usize);
    let mut tip = *genesis;
    for height in 1..=count {
        let block = coinbase_block(&tip, height, 50, vec![0x51]);
        tip = block.header;
        blocks.push(block);
    }
    blocks
}

/// Transaction spending `inputs` (all locked to `keypair`), each signed
/// over its own signature hash.
pub fn signed_spend(keypair: &KeyPair, inputs: &[(OutPoint, u64)], outputs: Vec<TxOut>) -> Transaction {
    let mut tx = Transaction {
        version: 1,
        inputs: inputs
            .iter()
            .map(|(outpoint, _)| TxIn {
                previous_output: *outpoint,
                unlocking_script: vec![],
                sequence: u32::MAX,
            })
            .collect(),
        outputs,
        lock_time: 0,
    };
    let locking_script = keypair.locking_script();
    for (i, (_, value)) in inputs.iter().enumerate() {
        let digest = tx.signature_hash(i, &locking_script, *value);
        tx.inputs[i].unlocking_script = keypair.sign_digest(&digest).to_vec();
    }
    tx
}

/// Defaults with small windows and `data_dir` pointed at a test directory.
pub fn regtest_config(data_dir: &str) -> Config {
    let mut config = Config::default();
    config.storage.data_dir = data_dir.to_string();
    config.network.pow_limit_bits = REGTEST_BITS;
    config.pipeline.commit_interval = 2;
    config.pipeline.reorg_history_depth = 10;
    config.pipeline.validation_threads = 2;
    config.fetch.tick_interval = std::time::Duration::from_millis(50);
    config.fetch.probe_interval = std::time::Duration::from_millis(50);
    config
}
