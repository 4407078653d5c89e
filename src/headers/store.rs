//! Durable header log
//!
//! Headers are appended with their derived height, cumulative work and a
//! validity flag, and replayed in height order at startup to rebuild the
//! in-memory tree.

use crate::blockchain::pow::{work_from_bytes, work_to_bytes};
use crate::blockchain::{BlockHeader, Hash256};
use crate::error::{ChainError, Result};
use parking_lot::Mutex;
use primitive_types::U256;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;

/// A header together with everything derived from its position in the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderRecord {
    pub header: BlockHeader,
    pub hash: Hash256,
    pub height: u32,
    /// Cumulative work from genesis up to and including this header.
    pub work: U256,
    pub valid: bool,
}

impl HeaderRecord {
    pub fn parent_hash(&self) -> Hash256 {
        self.header.previous_hash
    }
}

pub trait HeaderStore: Send + Sync {
    /// Every stored record, parents before children.
    fn load(&self) -> Result<Vec<HeaderRecord>>;
    /// Persist new records atomically: either all land or none do.
    fn append(&self, records: &[HeaderRecord]) -> Result<()>;
    /// Clear the validity flag of every listed header.
    fn mark_invalid(&self, hashes: &[Hash256]) -> Result<()>;
}

pub struct SqliteHeaderStore {
    conn: Mutex<Connection>,
}

impl SqliteHeaderStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| ChainError::Storage(format!("Failed to open header database: {}", e)))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ChainError::Storage(format!("Failed to open header database: {}", e)))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS headers (
                hash BLOB PRIMARY KEY,
                height INTEGER NOT NULL,
                header BLOB NOT NULL,
                work BLOB NOT NULL,
                valid INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS headers_height ON headers(height);",
        )
        .map_err(|e| ChainError::Storage(format!("Failed to create headers table: {}", e)))?;

        Ok(SqliteHeaderStore {
            conn: Mutex::new(conn),
        })
    }
}

impl HeaderStore for SqliteHeaderStore {
    fn load(&self) -> Result<Vec<HeaderRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT hash, height, header, work, valid FROM headers ORDER BY height, rowid")
            .map_err(|e| ChainError::Storage(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map([], |row| {
                let hash: Vec<u8> = row.get(0)?;
                let height: u32 = row.get(1)?;
                let header: Vec<u8> = row.get(2)?;
                let work: Vec<u8> = row.get(3)?;
                let valid: bool = row.get(4)?;
                Ok((hash, height, header, work, valid))
            })
            .map_err(|e| ChainError::Storage(format!("Failed to query headers: {}", e)))?;

        let mut records = Vec::new();
        for row in rows {
            let (hash_bytes, height, header_bytes, work_bytes, valid) =
                row.map_err(|e| ChainError::Storage(format!("Failed to read row: {}", e)))?;

            let header = BlockHeader::from_bytes(&header_bytes)?;
            let hash = header.hash();
            if hash_bytes.as_slice() != hash.as_slice() {
                return Err(ChainError::Integrity(format!(
                    "Stored header at height {} does not hash to its key",
                    height
                )));
            }

            records.push(HeaderRecord {
                header,
                hash,
                height,
                work: work_from_bytes(&work_bytes)?,
                valid,
            });
        }
        Ok(records)
    }

    fn append(&self, records: &[HeaderRecord]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| ChainError::Storage(format!("Failed to start transaction: {}", e)))?;

        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO headers (hash, height, header, work, valid) VALUES (?1, ?2, ?3, ?4, ?5)",
                )
                .map_err(|e| ChainError::Storage(format!("Failed to prepare insert: {}", e)))?;
            for record in records {
                stmt.execute(params![
                    record.hash.to_vec(),
                    record.height,
                    record.header.to_bytes().to_vec(),
                    work_to_bytes(&record.work).to_vec(),
                    record.valid,
                ])
                .map_err(|e| ChainError::Storage(format!("Failed to append header: {}", e)))?;
            }
        }

        tx.commit()
            .map_err(|e| ChainError::Storage(format!("Failed to commit headers: {}", e)))
    }

    fn mark_invalid(&self, hashes: &[Hash256]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| ChainError::Storage(format!("Failed to start transaction: {}", e)))?;

        {
            let mut stmt = tx
                .prepare_cached("UPDATE headers SET valid = 0 WHERE hash = ?1")
                .map_err(|e| ChainError::Storage(format!("Failed to prepare update: {}", e)))?;
            for hash in hashes {
                let changed = stmt
                    .execute(params![hash.to_vec()])
                    .map_err(|e| ChainError::Storage(format!("Failed to invalidate header: {}", e)))?;
                if changed != 1 {
                    return Err(ChainError::Integrity(format!(
                        "Cannot invalidate unknown header {}",
                        hex::encode(hash)
                    )));
                }
            }
        }

        tx.commit()
            .map_err(|e| ChainError::Storage(format!("Failed to commit invalidation: {}", e)))
    }
}

/// Volatile store for tests and throwaway runs.
#[derive(Default)]
pub struct InMemoryHeaderStore {
    records: Mutex<Vec<HeaderRecord>>,
    positions: Mutex<HashMap<Hash256, usize>>,
}

impl InMemoryHeaderStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HeaderStore for InMemoryHeaderStore {
    fn load(&self) -> Result<Vec<HeaderRecord>> {
        let mut records = self.records.lock().clone();
        // Stable, so equal heights keep insertion order like the SQLite rowid.
        records.sort_by_key(|r| r.height);
        Ok(records)
    }

    fn append(&self, new_records: &[HeaderRecord]) -> Result<()> {
        let mut records = self.records.lock();
        let mut positions = self.positions.lock();
        if let Some(dup) = new_records.iter().find(|r| positions.contains_key(&r.hash)) {
            return Err(ChainError::Storage(format!(
                "Header {} already stored",
                hex::encode(dup.hash)
            )));
        }
        for record in new_records {
            positions.insert(record.hash, records.len());
            records.push(record.clone());
        }
        Ok(())
    }

    fn mark_invalid(&self, hashes: &[Hash256]) -> Result<()> {
        let mut records = self.records.lock();
        let positions = self.positions.lock();
        let mut indices = Vec::with_capacity(hashes.len());
        for hash in hashes {
            match positions.get(hash) {
                Some(&i) => indices.push(i),
                None => {
                    return Err(ChainError::Integrity(format!(
                        "Cannot invalidate unknown header {}",
                        hex::encode(hash)
                    )))
                }
            }
        }
        for i in indices {
            records[i].valid = false;
        }
        Ok(())
    }
}
