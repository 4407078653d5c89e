use crate::error::ChainError;
use crate::transaction::Transaction;
use sha2::{Digest, Sha256};

pub type Hash256 = [u8; 32];

pub const ZERO_HASH: Hash256 = [0u8; 32];

/// SHA-256 applied twice, the hash used for headers, transactions and merkle nodes.
pub fn double_sha256(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    Sha256::digest(first).into()
}

/// Parse a 64 character hex string into a hash.
pub fn hash_from_hex(hex_str: &str) -> Result<Hash256, ChainError> {
    let bytes = hex::decode(hex_str)
        .map_err(|e| ChainError::Config(format!("Invalid hex hash: {}", e)))?;
    bytes
        .try_into()
        .map_err(|_| ChainError::Config(format!("Hash must be 32 bytes: {}", hex_str)))
}

/// Short form used in log lines.
pub fn short_hash(hash: &Hash256) -> String {
    hex::encode(&hash[..8])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    pub previous_hash: Hash256,
    pub merkle_root: Hash256,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub const SIZE: usize = 80;

    /// Little-endian consensus encoding; the hash commits to exactly these bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(&self.previous_hash);
        out[36..68].copy_from_slice(&self.merkle_root);
        out[68..72].copy_from_slice(&self.timestamp.to_le_bytes());
        out[72..76].copy_from_slice(&self.bits.to_le_bytes());
        out[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChainError> {
        if bytes.len() != Self::SIZE {
            return Err(ChainError::Integrity(format!(
                "Serialized header must be {} bytes, got {}",
                Self::SIZE,
                bytes.len()
            )));
        }
        let word = |at: usize| [bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]];
        let mut previous_hash = ZERO_HASH;
        previous_hash.copy_from_slice(&bytes[4..36]);
        let mut merkle_root = ZERO_HASH;
        merkle_root.copy_from_slice(&bytes[36..68]);

        Ok(BlockHeader {
            version: i32::from_le_bytes(word(0)),
            previous_hash,
            merkle_root,
            timestamp: u32::from_le_bytes(word(68)),
            bits: u32::from_le_bytes(word(72)),
            nonce: u32::from_le_bytes(word(76)),
        })
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, ChainError> {
        let bytes = hex::decode(hex_str)
            .map_err(|e| ChainError::Config(format!("Invalid header hex: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    pub fn hash(&self) -> Hash256 {
        double_sha256(&self.to_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Block {
            header,
            transactions,
        }
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// Pairwise merkle tree over transaction hashes; an odd level duplicates its last node.
    pub fn calculate_merkle_root(transactions: &[Transaction]) -> Hash256 {
        merkle_root(transactions).0
    }

    /// True when the transaction list is one of the alternate bodies that
    /// share a merkle root with a shorter list, i.e. some level holds two
    /// equal adjacent hashes.
    pub fn is_merkle_mutated(&self) -> bool {
        merkle_root(&self.transactions).1
    }

    pub fn has_valid_merkle_root(&self) -> bool {
        if self.transactions.is_empty() {
            return false;
        }
        let (root, mutated) = merkle_root(&self.transactions);
        !mutated && root == self.header.merkle_root
    }
}

/// Root plus whether a level paired a hash with an equal sibling.
fn merkle_root(transactions: &[Transaction]) -> (Hash256, bool) {
    let mut level: Vec<Hash256> = transactions.iter().map(|tx| tx.hash()).collect();
    if level.is_empty() {
        return (ZERO_HASH, false);
    }

    let mut mutated = false;
    while level.len() > 1 {
        mutated |= level.chunks_exact(2).any(|pair| pair[0] == pair[1]);
        if level.len() % 2 == 1 {
            if let Some(last) = level.last().copied() {
                level.push(last);
            }
        }
        level = level
            .chunks(2)
            .map(|pair| {
                let mut concat = [0u8; 64];
                concat[..32].copy_from_slice(&pair[0]);
                concat[32..].copy_from_slice(&pair[1]);
                double_sha256(&concat)
            })
            .collect();
    }
    (level[0], mutated)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGTEST_GENESIS: &str = "0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4adae5494dffff7f2002000000";

    #[test]
    fn test_regtest_genesis_hash() {
        let header = BlockHeader::from_hex(REGTEST_GENESIS).unwrap();
        let mut hash = header.hash();
        hash.reverse();
        assert_eq!(
            hex::encode(hash),
            "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206"
        );
        assert_eq!(header.bits, 0x207fffff);
        assert_eq!(hex::encode(header.to_bytes()), REGTEST_GENESIS);
    }

    #[test]
    fn test_header_bytes_length_checked() {
        let result = BlockHeader::from_bytes(&[0u8; 79]);
        assert!(matches!(result, Err(ChainError::Integrity(_))));
    }

    #[test]
    fn test_merkle_root_single_and_odd() {
        let a = Transaction::coinbase(1, 50, vec![1]);
        let b = Transaction::coinbase(2, 50, vec![2]);
        let c = Transaction::coinbase(3, 50, vec![3]);

        assert_eq!(Block::calculate_merkle_root(&[a.clone()]), a.hash());

        let odd = Block::calculate_merkle_root(&[a.clone(), b.clone(), c.clone()]);
        let padded = Block::calculate_merkle_root(&[a, b, c.clone(), c]);
        assert_eq!(odd, padded);
    }

    #[test]
    fn test_repeated_trailing_transactions_are_mutated() {
        let header = BlockHeader::from_hex(REGTEST_GENESIS).unwrap();
        let txs: Vec<Transaction> = (1..=3).map(|i| Transaction::coinbase(i, 50, vec![i as u8])).collect();

        let mut genuine = Block::new(header, txs.clone());
        genuine.header.merkle_root = Block::calculate_merkle_root(&txs);
        assert!(genuine.has_valid_merkle_root());
        assert!(!genuine.is_merkle_mutated());

        // Same root, one extra copy of the last transaction.
        let mut padded = genuine.clone();
        padded.transactions.push(txs[2].clone());
        assert_eq!(Block::calculate_merkle_root(&padded.transactions), genuine.header.merkle_root);
        assert!(padded.is_merkle_mutated());
        assert!(!padded.has_valid_merkle_root());

        // Duplication one level up: [a, b, c, d, c, d] against [a, b, c, d, c, d, c, d].
        let body: Vec<Transaction> = (1..=6).map(|i| Transaction::coinbase(i, 50, vec![i as u8])).collect();
        let mut doubled = body.clone();
        doubled.extend_from_slice(&body[4..]);
        let block = Block::new(header, doubled);
        assert_eq!(Block::calculate_merkle_root(&block.transactions), Block::calculate_merkle_root(&body));
        assert!(block.is_merkle_mutated());
    }

    #[test]
    fn test_empty_block_has_no_valid_merkle_root() {
        let header = BlockHeader::from_hex(REGTEST_GENESIS).unwrap();
        let block = Block::new(header, vec![]);
        assert!(!block.has_valid_merkle_root());
    }
}
