//! Unspent output accounting
//!
//! Output records, the per-block create/spend operations derived from a
//! block, and the two folds over them: [`UtxoView`], an in-memory set that
//! operations are applied to, and [`AggregateUpdate`], the net effect of a
//! run of updates as written to storage.

pub mod pipeline;
pub mod store;
pub mod validation;

use crate::blockchain::{short_hash, Hash256};
use crate::error::{ChainError, Result};
use crate::transaction::OutPoint;
use std::collections::{HashMap, HashSet};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct UtxoOutput {
    pub outpoint: OutPoint,
    pub value: u64,
    pub script: Vec<u8>,
    /// Height of the block that created the output.
    pub height: u32,
}

/// One change to the output set. A spend carries the full output it
/// destroys so that it can be undone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UtxoOperation {
    Create(UtxoOutput),
    Spend(UtxoOutput),
}

impl UtxoOperation {
    pub fn output(&self) -> &UtxoOutput {
        match self {
            UtxoOperation::Create(o) | UtxoOperation::Spend(o) => o,
        }
    }

    pub fn outpoint(&self) -> &OutPoint {
        &self.output().outpoint
    }

    pub fn reversed(&self) -> UtxoOperation {
        match self {
            UtxoOperation::Create(o) => UtxoOperation::Spend(o.clone()),
            UtxoOperation::Spend(o) => UtxoOperation::Create(o.clone()),
        }
    }
}

/// The operations of one block, in transaction order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtxoUpdate {
    pub height: u32,
    pub hash: Hash256,
    pub parent_hash: Hash256,
    pub operations: Vec<UtxoOperation>,
}

impl UtxoUpdate {
    /// Operations that undo this update, last first.
    pub fn reversed(&self) -> UtxoUpdate {
        UtxoUpdate {
            height: self.height,
            hash: self.hash,
            parent_hash: self.parent_hash,
            operations: self.operations.iter().rev().map(UtxoOperation::reversed).collect(),
        }
    }

    /// True if any operation creates or spends an output of one of `tx_hashes`.
    pub fn touches(&self, tx_hashes: &HashSet<Hash256>) -> bool {
        self.operations
            .iter()
            .any(|op| tx_hashes.contains(&op.outpoint().tx_hash))
    }

    pub fn head(&self) -> UtxoHead {
        UtxoHead {
            hash: self.hash,
            height: self.height,
        }
    }
}

/// Last block durably reflected in the output set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct UtxoHead {
    #[serde(with = "hex_hash")]
    pub hash: Hash256,
    pub height: u32,
}

impl fmt::Display for UtxoHead {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} at {}", short_hash(&self.hash), self.height)
    }
}

mod hex_hash {
    use serde::Serializer;

    pub fn serialize<S: Serializer>(hash: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(hash))
    }
}

/// In-memory output set. Operations that do not fit the current contents
/// are integrity errors: creating an existing output or spending a missing
/// one means the caller lost track of the chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UtxoView {
    outputs: HashMap<OutPoint, UtxoOutput>,
    per_tx: HashMap<Hash256, usize>,
}

impl UtxoView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_outputs(outputs: impl IntoIterator<Item = UtxoOutput>) -> Result<Self> {
        let mut view = Self::new();
        for output in outputs {
            view.create(output)?;
        }
        Ok(view)
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<&UtxoOutput> {
        self.outputs.get(outpoint)
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// True while any output of `tx_hash` is unspent.
    pub fn has_unspent_from(&self, tx_hash: &Hash256) -> bool {
        self.per_tx.get(tx_hash).is_some_and(|&n| n > 0)
    }

    pub fn create(&mut self, output: UtxoOutput) -> Result<()> {
        if self.outputs.contains_key(&output.outpoint) {
            return Err(ChainError::Integrity(format!(
                "Output {} created twice",
                output.outpoint
            )));
        }
        *self.per_tx.entry(output.outpoint.tx_hash).or_insert(0) += 1;
        self.outputs.insert(output.outpoint, output);
        Ok(())
    }

    pub fn spend(&mut self, outpoint: &OutPoint) -> Result<UtxoOutput> {
        let output = self.outputs.remove(outpoint).ok_or_else(|| {
            ChainError::Integrity(format!("Output {} spent but not unspent", outpoint))
        })?;
        if let Some(n) = self.per_tx.get_mut(&outpoint.tx_hash) {
            *n -= 1;
            if *n == 0 {
                self.per_tx.remove(&outpoint.tx_hash);
            }
        }
        Ok(output)
    }

    pub fn apply(&mut self, operation: &UtxoOperation) -> Result<()> {
        match operation {
            UtxoOperation::Create(output) => self.create(output.clone()),
            UtxoOperation::Spend(output) => self.spend(&output.outpoint).map(|_| ()),
        }
    }

    pub fn apply_update(&mut self, update: &UtxoUpdate) -> Result<()> {
        update.operations.iter().try_for_each(|op| self.apply(op))
    }

    pub fn iter(&self) -> impl Iterator<Item = &UtxoOutput> {
        self.outputs.values()
    }
}

/// A durable output destroyed at `spend_height`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpentOutput {
    pub output: UtxoOutput,
    pub spend_height: u32,
}

/// Net effect of a chain-ordered run of updates. An output created and
/// spent inside the run cancels out of both maps and is kept only as
/// rollback history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateUpdate {
    pub created: HashMap<OutPoint, UtxoOutput>,
    pub spent: HashMap<OutPoint, SpentOutput>,
    pub cancelled: Vec<SpentOutput>,
}

impl AggregateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_updates<'a>(updates: impl IntoIterator<Item = &'a UtxoUpdate>) -> Result<Self> {
        let mut aggregate = Self::new();
        for update in updates {
            aggregate.add_update(update)?;
        }
        Ok(aggregate)
    }

    pub fn add_update(&mut self, update: &UtxoUpdate) -> Result<()> {
        for operation in &update.operations {
            match operation {
                UtxoOperation::Create(output) => {
                    if self.created.contains_key(&output.outpoint) {
                        return Err(ChainError::Integrity(format!(
                            "Output {} created twice in one batch",
                            output.outpoint
                        )));
                    }
                    self.created.insert(output.outpoint, output.clone());
                }
                UtxoOperation::Spend(output) => {
                    if let Some(created) = self.created.remove(&output.outpoint) {
                        self.cancelled.push(SpentOutput {
                            output: created,
                            spend_height: update.height,
                        });
                    } else if self.spent.contains_key(&output.outpoint) {
                        return Err(ChainError::Integrity(format!(
                            "Output {} spent twice in one batch",
                            output.outpoint
                        )));
                    } else {
                        self.spent.insert(
                            output.outpoint,
                            SpentOutput {
                                output: output.clone(),
                                spend_height: update.height,
                            },
                        );
                    }
                }
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.spent.is_empty() && self.cancelled.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(tx: u8, index: u32, height: u32) -> UtxoOutput {
        UtxoOutput {
            outpoint: OutPoint::new([tx; 32], index),
            value: 10 * (index as u64 + 1),
            script: vec![tx],
            height,
        }
    }

    fn update(height: u32, operations: Vec<UtxoOperation>) -> UtxoUpdate {
        UtxoUpdate {
            height,
            hash: [height as u8; 32],
            parent_hash: [height as u8 - 1; 32],
            operations,
        }
    }

    #[test]
    fn test_apply_then_reverse_roundtrips() {
        let base = UtxoView::from_outputs(vec![output(1, 0, 1), output(1, 1, 1), output(2, 0, 1)]).unwrap();
        let block = update(
            2,
            vec![
                UtxoOperation::Spend(output(1, 0, 1)),
                UtxoOperation::Create(output(3, 0, 2)),
                UtxoOperation::Create(output(3, 1, 2)),
                UtxoOperation::Spend(output(3, 0, 2)),
                UtxoOperation::Spend(output(2, 0, 1)),
            ],
        );

        let mut view = base.clone();
        view.apply_update(&block).unwrap();
        assert_eq!(view.len(), 2);
        assert!(!view.has_unspent_from(&[2; 32]));
        assert!(view.has_unspent_from(&[3; 32]));

        view.apply_update(&block.reversed()).unwrap();
        assert_eq!(view, base);
    }

    #[test]
    fn test_view_rejects_inconsistent_operations() {
        let mut view = UtxoView::from_outputs(vec![output(1, 0, 1)]).unwrap();
        assert!(matches!(view.create(output(1, 0, 1)), Err(ChainError::Integrity(_))));
        assert!(matches!(view.spend(&OutPoint::new([9; 32], 0)), Err(ChainError::Integrity(_))));
    }

    #[test]
    fn test_aggregate_cancels_create_then_spend() {
        let first = update(4, vec![UtxoOperation::Create(output(5, 0, 4)), UtxoOperation::Spend(output(1, 0, 1))]);
        let second = update(5, vec![UtxoOperation::Spend(output(5, 0, 4)), UtxoOperation::Create(output(6, 0, 5))]);

        let aggregate = AggregateUpdate::from_updates([&first, &second]).unwrap();
        assert!(!aggregate.created.contains_key(&OutPoint::new([5; 32], 0)));
        assert!(!aggregate.spent.contains_key(&OutPoint::new([5; 32], 0)));
        assert_eq!(
            aggregate.cancelled,
            vec![SpentOutput {
                output: output(5, 0, 4),
                spend_height: 5
            }]
        );
        assert_eq!(aggregate.spent[&OutPoint::new([1; 32], 0)].spend_height, 4);
        assert!(aggregate.created.contains_key(&OutPoint::new([6; 32], 0)));
    }

    #[test]
    fn test_aggregate_allows_recreate_after_durable_spend() {
        let first = update(2, vec![UtxoOperation::Spend(output(1, 0, 1))]);
        let second = update(3, vec![UtxoOperation::Create(output(1, 0, 3))]);
        let aggregate = AggregateUpdate::from_updates([&first, &second]).unwrap();
        assert_eq!(aggregate.spent.len(), 1);
        assert_eq!(aggregate.created[&OutPoint::new([1; 32], 0)].height, 3);

        let again = update(4, vec![UtxoOperation::Spend(output(1, 0, 1))]);
        let double = AggregateUpdate::from_updates([&first, &again]);
        assert!(matches!(double, Err(ChainError::Integrity(_))));
    }
}
