//! Durable unspent output set with bounded rollback
//!
//! Besides the unspent outputs, the store keeps every output spent within
//! the retained window (`spent_history`) and the hash of each block it has
//! absorbed (`utxo_headers`), so that it can be rolled back to any retained
//! block.

use super::{AggregateUpdate, SpentOutput, UtxoHead, UtxoOutput, UtxoUpdate};
use crate::blockchain::Hash256;
use crate::error::{ChainError, Result};
use crate::transaction::OutPoint;
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction};
use std::path::Path;
use tracing::{debug, info};

pub trait UtxoStore: Send + Sync {
    /// Last block reflected in the set, `None` for an empty store.
    fn head(&self) -> Result<Option<UtxoHead>>;
    /// Block absorbed at `height`, if still on record.
    fn header_at(&self, height: u32) -> Result<Option<UtxoHead>>;
    fn get_unspent_outputs(&self, tx_hashes: &[Hash256]) -> Result<Vec<UtxoOutput>>;
    /// Apply chain-ordered updates in one transaction.
    fn update(&self, updates: &[UtxoUpdate]) -> Result<UtxoHead>;
    /// Undo every update above the block `hash`.
    fn revert_to(&self, hash: &Hash256) -> Result<UtxoHead>;
    /// Drop rollback history at and below the block `hash`.
    fn truncate(&self, hash: &Hash256) -> Result<()>;
    fn len(&self) -> Result<u64>;
    /// Lowest height the store can still revert to.
    fn pruned_height(&self) -> Result<Option<u32>>;
}

pub struct SqliteUtxoStore {
    conn: Mutex<Connection>,
}

impl SqliteUtxoStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| ChainError::Storage(format!("Failed to open utxo database: {}", e)))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ChainError::Storage(format!("Failed to open utxo database: {}", e)))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS utxos (
                tx_hash BLOB NOT NULL,
                output_index INTEGER NOT NULL,
                height INTEGER NOT NULL,
                value INTEGER NOT NULL,
                script BLOB NOT NULL,
                PRIMARY KEY (tx_hash, output_index)
            );
            CREATE INDEX IF NOT EXISTS utxos_height ON utxos(height);
            CREATE TABLE IF NOT EXISTS spent_history (
                spend_height INTEGER NOT NULL,
                tx_hash BLOB NOT NULL,
                output_index INTEGER NOT NULL,
                created_height INTEGER NOT NULL,
                value INTEGER NOT NULL,
                script BLOB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS spent_history_height ON spent_history(spend_height);
            CREATE TABLE IF NOT EXISTS utxo_headers (
                height INTEGER PRIMARY KEY,
                hash BLOB NOT NULL UNIQUE,
                parent_hash BLOB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS utxo_meta (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );",
        )
        .map_err(|e| ChainError::Storage(format!("Failed to create utxo tables: {}", e)))?;

        Ok(SqliteUtxoStore {
            conn: Mutex::new(conn),
        })
    }

    /// Rows of rollback history currently retained.
    pub fn history_len(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM spent_history", [], |row| row.get(0))
            .map_err(|e| ChainError::Storage(format!("Failed to count history: {}", e)))?;
        Ok(count as u64)
    }
}

fn read_head(conn: &Connection) -> Result<Option<UtxoHead>> {
    conn.query_row(
        "SELECT height, hash FROM utxo_headers ORDER BY height DESC LIMIT 1",
        [],
        |row| Ok((row.get::<_, u32>(0)?, row.get::<_, Vec<u8>>(1)?)),
    )
    .optional()
    .map_err(|e| ChainError::Storage(format!("Failed to read utxo head: {}", e)))?
    .map(|(height, hash)| Ok(UtxoHead { hash: to_hash(&hash)?, height }))
    .transpose()
}

fn height_of(conn: &Connection, hash: &Hash256) -> Result<Option<u32>> {
    conn.query_row(
        "SELECT height FROM utxo_headers WHERE hash = ?1",
        params![hash.to_vec()],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| ChainError::Storage(format!("Failed to look up utxo header: {}", e)))
}

fn read_pruned_height(conn: &Connection) -> Result<Option<u32>> {
    conn.query_row(
        "SELECT value FROM utxo_meta WHERE key = 'pruned_height'",
        [],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| ChainError::Storage(format!("Failed to read pruned height: {}", e)))
}

fn to_hash(bytes: &[u8]) -> Result<Hash256> {
    bytes
        .try_into()
        .map_err(|_| ChainError::Integrity(format!("Stored hash has {} bytes", bytes.len())))
}

fn check_chaining(head: Option<UtxoHead>, update: &UtxoUpdate) -> Result<()> {
    let chains = match head {
        None => update.height == 0,
        Some(head) => update.height == head.height + 1 && update.parent_hash == head.hash,
    };
    if chains {
        Ok(())
    } else {
        Err(ChainError::Integrity(format!(
            "Update at height {} does not extend utxo head {}",
            update.height,
            head.map(|h| h.to_string()).unwrap_or_else(|| "(empty)".to_string())
        )))
    }
}

fn insert_history(tx: &Transaction, spent: &SpentOutput) -> Result<()> {
    let output = &spent.output;
    tx.prepare_cached(
        "INSERT INTO spent_history (spend_height, tx_hash, output_index, created_height, value, script)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )
    .and_then(|mut stmt| {
        stmt.execute(params![
            spent.spend_height,
            output.outpoint.tx_hash.to_vec(),
            output.outpoint.index,
            output.height,
            output.value as i64,
            output.script,
        ])
    })
    .map_err(|e| ChainError::Storage(format!("Failed to record spent output: {}", e)))?;
    Ok(())
}

impl UtxoStore for SqliteUtxoStore {
    fn head(&self) -> Result<Option<UtxoHead>> {
        read_head(&self.conn.lock())
    }

    fn header_at(&self, height: u32) -> Result<Option<UtxoHead>> {
        let conn = self.conn.lock();
        let hash: Option<Vec<u8>> = conn
            .query_row(
                "SELECT hash FROM utxo_headers WHERE height = ?1",
                params![height],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| ChainError::Storage(format!("Failed to read utxo header: {}", e)))?;
        hash.map(|h| Ok(UtxoHead { hash: to_hash(&h)?, height }))
            .transpose()
    }

    fn get_unspent_outputs(&self, tx_hashes: &[Hash256]) -> Result<Vec<UtxoOutput>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT output_index, height, value, script FROM utxos WHERE tx_hash = ?1 ORDER BY output_index",
            )
            .map_err(|e| ChainError::Storage(format!("Failed to prepare query: {}", e)))?;

        let mut outputs = Vec::new();
        for tx_hash in tx_hashes {
            let rows = stmt
                .query_map(params![tx_hash.to_vec()], |row| {
                    Ok(UtxoOutput {
                        outpoint: OutPoint::new(*tx_hash, row.get(0)?),
                        height: row.get(1)?,
                        value: row.get::<_, i64>(2)? as u64,
                        script: row.get(3)?,
                    })
                })
                .map_err(|e| ChainError::Storage(format!("Failed to query outputs: {}", e)))?;
            for row in rows {
                outputs.push(row.map_err(|e| ChainError::Storage(format!("Failed to read row: {}", e)))?);
            }
        }
        Ok(outputs)
    }

    fn update(&self, updates: &[UtxoUpdate]) -> Result<UtxoHead> {
        let mut conn = self.conn.lock();
        let mut head = read_head(&conn)?;
        for update in updates {
            check_chaining(head, update)?;
            head = Some(update.head());
        }
        let Some(new_head) = head else {
            return Err(ChainError::Integrity("Empty update batch on an empty store".to_string()));
        };

        let aggregate = AggregateUpdate::from_updates(updates)?;

        let tx = conn
            .transaction()
            .map_err(|e| ChainError::Storage(format!("Failed to start transaction: {}", e)))?;

        for spent in aggregate.spent.values() {
            let outpoint = &spent.output.outpoint;
            let deleted = tx
                .prepare_cached("DELETE FROM utxos WHERE tx_hash = ?1 AND output_index = ?2")
                .and_then(|mut stmt| stmt.execute(params![outpoint.tx_hash.to_vec(), outpoint.index]))
                .map_err(|e| ChainError::Storage(format!("Failed to delete output: {}", e)))?;
            if deleted != 1 {
                return Err(ChainError::Integrity(format!(
                    "Spend of output {} which is not in the store",
                    outpoint
                )));
            }
            insert_history(&tx, spent)?;
        }

        for cancelled in &aggregate.cancelled {
            insert_history(&tx, cancelled)?;
        }

        for output in aggregate.created.values() {
            let inserted = tx
                .prepare_cached(
                    "INSERT INTO utxos (tx_hash, output_index, height, value, script) VALUES (?1, ?2, ?3, ?4, ?5)",
                )
                .and_then(|mut stmt| {
                    stmt.execute(params![
                        output.outpoint.tx_hash.to_vec(),
                        output.outpoint.index,
                        output.height,
                        output.value as i64,
                        output.script,
                    ])
                });
            match inserted {
                Ok(_) => {}
                Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                    return Err(ChainError::Integrity(format!(
                        "Output {} already exists",
                        output.outpoint
                    )));
                }
                Err(e) => return Err(ChainError::Storage(format!("Failed to insert output: {}", e))),
            }
        }

        for update in updates {
            tx.prepare_cached("INSERT INTO utxo_headers (height, hash, parent_hash) VALUES (?1, ?2, ?3)")
                .and_then(|mut stmt| {
                    stmt.execute(params![update.height, update.hash.to_vec(), update.parent_hash.to_vec()])
                })
                .map_err(|e| ChainError::Storage(format!("Failed to record utxo header: {}", e)))?;
        }

        tx.commit()
            .map_err(|e| ChainError::Storage(format!("Failed to commit utxo update: {}", e)))?;

        debug!(
            "Committed {} updates: +{} -{} outputs, head {}",
            updates.len(),
            aggregate.created.len(),
            aggregate.spent.len(),
            new_head
        );
        Ok(new_head)
    }

    fn revert_to(&self, hash: &Hash256) -> Result<UtxoHead> {
        let mut conn = self.conn.lock();
        let target = height_of(&conn, hash)?.ok_or_else(|| {
            ChainError::Integrity(format!("Cannot revert to unknown block {}", hex::encode(hash)))
        })?;
        if let Some(pruned) = read_pruned_height(&conn)? {
            if target < pruned {
                return Err(ChainError::HistoryPruned { height: target });
            }
        }

        let tx = conn
            .transaction()
            .map_err(|e| ChainError::Storage(format!("Failed to start transaction: {}", e)))?;

        let removed = tx
            .execute("DELETE FROM utxos WHERE height > ?1", params![target])
            .map_err(|e| ChainError::Storage(format!("Failed to remove outputs: {}", e)))?;
        let restored = tx
            .execute(
                "INSERT INTO utxos (tx_hash, output_index, height, value, script)
                 SELECT tx_hash, output_index, created_height, value, script FROM spent_history
                 WHERE spend_height > ?1 AND created_height <= ?1",
                params![target],
            )
            .map_err(|e| ChainError::Storage(format!("Failed to restore outputs: {}", e)))?;
        tx.execute("DELETE FROM spent_history WHERE spend_height > ?1", params![target])
            .map_err(|e| ChainError::Storage(format!("Failed to drop history: {}", e)))?;
        tx.execute("DELETE FROM utxo_headers WHERE height > ?1", params![target])
            .map_err(|e| ChainError::Storage(format!("Failed to drop utxo headers: {}", e)))?;

        tx.commit()
            .map_err(|e| ChainError::Storage(format!("Failed to commit revert: {}", e)))?;

        let head = UtxoHead { hash: *hash, height: target };
        info!("Reverted utxo set to {}: {} removed, {} restored", head, removed, restored);
        Ok(head)
    }

    fn truncate(&self, hash: &Hash256) -> Result<()> {
        let mut conn = self.conn.lock();
        let height = height_of(&conn, hash)?.ok_or_else(|| {
            ChainError::Integrity(format!("Cannot truncate at unknown block {}", hex::encode(hash)))
        })?;
        let pruned = read_pruned_height(&conn)?;
        if pruned.is_some_and(|p| p >= height) {
            return Ok(());
        }

        let tx = conn
            .transaction()
            .map_err(|e| ChainError::Storage(format!("Failed to start transaction: {}", e)))?;
        let dropped = tx
            .execute("DELETE FROM spent_history WHERE spend_height <= ?1", params![height])
            .map_err(|e| ChainError::Storage(format!("Failed to prune history: {}", e)))?;
        tx.execute(
            "INSERT OR REPLACE INTO utxo_meta (key, value) VALUES ('pruned_height', ?1)",
            params![height],
        )
        .map_err(|e| ChainError::Storage(format!("Failed to save pruned height: {}", e)))?;
        tx.commit()
            .map_err(|e| ChainError::Storage(format!("Failed to commit truncate: {}", e)))?;

        debug!("Pruned {} history rows at or below height {}", dropped, height);
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM utxos", [], |row| row.get(0))
            .map_err(|e| ChainError::Storage(format!("Failed to count outputs: {}", e)))?;
        Ok(count as u64)
    }

    fn pruned_height(&self) -> Result<Option<u32>> {
        read_pruned_height(&self.conn.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utxo::UtxoOperation;

    fn output(tx: u8, index: u32, height: u32) -> UtxoOutput {
        UtxoOutput {
            outpoint: OutPoint::new([tx; 32], index),
            value: 1_000 + index as u64,
            script: vec![tx, 0xac],
            height,
        }
    }

    fn block_hash(height: u32) -> Hash256 {
        let mut hash = [0xb0; 32];
        hash[..4].copy_from_slice(&height.to_le_bytes());
        hash
    }

    fn update(height: u32, operations: Vec<UtxoOperation>) -> UtxoUpdate {
        UtxoUpdate {
            height,
            hash: block_hash(height),
            parent_hash: if height == 0 { [0; 32] } else { block_hash(height - 1) },
            operations,
        }
    }

    fn genesis_store() -> SqliteUtxoStore {
        let store = SqliteUtxoStore::open_in_memory().unwrap();
        store
            .update(&[update(0, vec![UtxoOperation::Create(output(1, 0, 0)), UtxoOperation::Create(output(1, 1, 0))])])
            .unwrap();
        store
    }

    #[test]
    fn test_chaining_enforced() {
        let store = SqliteUtxoStore::open_in_memory().unwrap();
        assert_eq!(store.head().unwrap(), None);
        assert!(matches!(store.update(&[update(1, vec![])]), Err(ChainError::Integrity(_))));

        store.update(&[update(0, vec![])]).unwrap();
        assert!(matches!(store.update(&[update(0, vec![])]), Err(ChainError::Integrity(_))));
        assert!(matches!(store.update(&[update(2, vec![])]), Err(ChainError::Integrity(_))));

        let mut wrong_parent = update(1, vec![]);
        wrong_parent.parent_hash = [7; 32];
        assert!(matches!(store.update(&[wrong_parent]), Err(ChainError::Integrity(_))));

        let head = store.update(&[update(1, vec![]), update(2, vec![])]).unwrap();
        assert_eq!(head.height, 2);
        assert_eq!(store.header_at(1).unwrap().map(|h| h.hash), Some(block_hash(1)));
    }

    #[test]
    fn test_spend_missing_and_double_create_rejected_atomically() {
        let store = genesis_store();

        let missing = update(1, vec![UtxoOperation::Create(output(2, 0, 1)), UtxoOperation::Spend(output(9, 0, 0))]);
        assert!(matches!(store.update(&[missing]), Err(ChainError::Integrity(_))));

        let duplicate = update(1, vec![UtxoOperation::Create(output(1, 0, 1))]);
        assert!(matches!(store.update(&[duplicate]), Err(ChainError::Integrity(_))));

        assert_eq!(store.len().unwrap(), 2);
        assert_eq!(store.head().unwrap().map(|h| h.height), Some(0));
        assert_eq!(store.get_unspent_outputs(&[[2; 32]]).unwrap(), vec![]);
    }

    #[test]
    fn test_create_and_spend_in_one_batch_never_stored() {
        let store = genesis_store();
        store
            .update(&[
                update(1, vec![UtxoOperation::Create(output(2, 0, 1))]),
                update(2, vec![UtxoOperation::Spend(output(2, 0, 1)), UtxoOperation::Create(output(3, 0, 2))]),
            ])
            .unwrap();

        assert!(store.get_unspent_outputs(&[[2; 32]]).unwrap().is_empty());
        assert_eq!(store.get_unspent_outputs(&[[3; 32]]).unwrap(), vec![output(3, 0, 2)]);
        // The cancelled pair is still kept for rollback.
        assert_eq!(store.history_len().unwrap(), 1);
    }

    #[test]
    fn test_revert_restores_spent_and_removes_created() {
        let store = genesis_store();
        store.update(&[update(1, vec![]), update(2, vec![])]).unwrap();
        store
            .update(&[
                update(3, vec![UtxoOperation::Spend(output(1, 0, 0)), UtxoOperation::Create(output(4, 0, 3))]),
                update(4, vec![UtxoOperation::Spend(output(4, 0, 3)), UtxoOperation::Create(output(5, 0, 4))]),
            ])
            .unwrap();
        store
            .update(&[update(5, vec![UtxoOperation::Spend(output(1, 1, 0)), UtxoOperation::Create(output(6, 0, 5))])])
            .unwrap();
        assert_eq!(store.len().unwrap(), 2);

        let head = store.revert_to(&block_hash(2)).unwrap();
        assert_eq!(head.height, 2);
        assert_eq!(store.head().unwrap(), Some(head));

        let mut restored = store.get_unspent_outputs(&[[1; 32], [4; 32], [5; 32], [6; 32]]).unwrap();
        restored.sort_by_key(|o| o.outpoint);
        assert_eq!(restored, vec![output(1, 0, 0), output(1, 1, 0)]);
        assert_eq!(store.history_len().unwrap(), 0);

        // The store extends again from the reverted head.
        store.update(&[update(3, vec![])]).unwrap();
    }

    #[test]
    fn test_revert_unknown_and_pruned() {
        let store = genesis_store();
        store.update(&[update(1, vec![UtxoOperation::Spend(output(1, 0, 0))])]).unwrap();
        store.update(&[update(2, vec![UtxoOperation::Spend(output(1, 1, 0))])]).unwrap();

        assert!(matches!(store.revert_to(&[0xee; 32]), Err(ChainError::Integrity(_))));

        store.truncate(&block_hash(1)).unwrap();
        assert_eq!(store.pruned_height().unwrap(), Some(1));
        assert_eq!(store.history_len().unwrap(), 1);
        assert_eq!(
            store.revert_to(&block_hash(0)),
            Err(ChainError::HistoryPruned { height: 0 })
        );

        // Reverting to the pruning point itself is still possible.
        store.revert_to(&block_hash(1)).unwrap();
        assert_eq!(store.get_unspent_outputs(&[[1; 32]]).unwrap(), vec![output(1, 1, 0)]);
    }

    #[test]
    fn test_truncate_never_moves_backwards() {
        let store = genesis_store();
        store.update(&[update(1, vec![]), update(2, vec![])]).unwrap();
        store.truncate(&block_hash(2)).unwrap();
        store.truncate(&block_hash(1)).unwrap();
        assert_eq!(store.pruned_height().unwrap(), Some(2));
        assert!(matches!(store.truncate(&[0xee; 32]), Err(ChainError::Integrity(_))));
    }
}
