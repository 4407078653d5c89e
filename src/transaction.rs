//! Transaction types and their consensus encoding

use crate::blockchain::{double_sha256, Hash256, ZERO_HASH};

/// Reference to one output of a previous transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct OutPoint {
    pub tx_hash: Hash256,
    pub index: u32,
}

impl OutPoint {
    /// The outpoint a coinbase input refers to.
    pub const NULL: OutPoint = OutPoint {
        tx_hash: ZERO_HASH,
        index: u32::MAX,
    };

    pub fn new(tx_hash: Hash256, index: u32) -> Self {
        Self { tx_hash, index }
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}

impl std::fmt::Display for OutPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}:{}", hex::encode(self.tx_hash), self.index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TxIn {
    pub previous_output: OutPoint,
    pub unlocking_script: Vec<u8>,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TxOut {
    pub value: u64,
    pub locking_script: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    /// Coinbase paying `value` to `locking_script`. The height goes into the
    /// unlocking script so coinbases at different heights never share a hash.
    pub fn coinbase(height: u32, value: u64, locking_script: Vec<u8>) -> Self {
        Transaction {
            version: 1,
            inputs: vec![TxIn {
                previous_output: OutPoint::NULL,
                unlocking_script: height.to_le_bytes().to_vec(),
                sequence: u32::MAX,
            }],
            outputs: vec![TxOut {
                value,
                locking_script,
            }],
            lock_time: 0,
        }
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].previous_output.is_null()
    }

    pub fn hash(&self) -> Hash256 {
        let mut buf = Vec::with_capacity(64 + 48 * (self.inputs.len() + self.outputs.len()));
        self.encode_into(&mut buf, false);
        double_sha256(&buf)
    }

    /// Digest an input's signature commits to: the transaction with every
    /// unlocking script blanked, followed by the input position and the
    /// output being spent.
    pub fn signature_hash(&self, input_index: usize, locking_script: &[u8], value: u64) -> Hash256 {
        let mut buf = Vec::with_capacity(64 + 48 * (self.inputs.len() + self.outputs.len()));
        self.encode_into(&mut buf, true);
        buf.extend_from_slice(&(input_index as u32).to_le_bytes());
        write_var_bytes(&mut buf, locking_script);
        buf.extend_from_slice(&value.to_le_bytes());
        double_sha256(&buf)
    }

    pub fn total_output_value(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, out| acc.checked_add(out.value))
    }

    fn encode_into(&self, buf: &mut Vec<u8>, blank_unlocking_scripts: bool) {
        buf.extend_from_slice(&self.version.to_le_bytes());
        write_compact_size(buf, self.inputs.len() as u64);
        for input in &self.inputs {
            buf.extend_from_slice(&input.previous_output.tx_hash);
            buf.extend_from_slice(&input.previous_output.index.to_le_bytes());
            if blank_unlocking_scripts {
                write_compact_size(buf, 0);
            } else {
                write_var_bytes(buf, &input.unlocking_script);
            }
            buf.extend_from_slice(&input.sequence.to_le_bytes());
        }
        write_compact_size(buf, self.outputs.len() as u64);
        for output in &self.outputs {
            buf.extend_from_slice(&output.value.to_le_bytes());
            write_var_bytes(buf, &output.locking_script);
        }
        buf.extend_from_slice(&self.lock_time.to_le_bytes());
    }
}

fn write_compact_size(buf: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => buf.push(n as u8),
        0xfd..=0xffff => {
            buf.push(0xfd);
            buf.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            buf.push(0xfe);
            buf.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            buf.push(0xff);
            buf.extend_from_slice(&n.to_le_bytes());
        }
    }
}

fn write_var_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_compact_size(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}
