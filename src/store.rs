//! Storage gateway contract and the bundled in-memory implementation

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use crate::clean::{Row, Value};
use crate::error::{Error, Result};

/// Persistence seam the pipeline commits through and the read path
/// queries. Upserts are keyed by natural key and atomic per table:
/// a failed batch leaves the table exactly as it was.
pub trait Store: Send + Sync {
    fn upsert_batch(&self, table: &str, rows: Vec<Row>, natural_key: &[&str]) -> Result<u64>;

    /// Rows matching every (column, value) equality in `filter`,
    /// in deterministic natural-key order
    fn read(&self, table: &str, filter: &[(String, Value)]) -> Result<Vec<Row>>;
}

/// Keyed table map. Suits tests and single-process deployments;
/// database-backed gateways implement [Store] outside the core.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, BTreeMap<String, Row>>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables
            .read()
            .expect("store lock poisoned")
            .get(table)
            .map(|t| t.len())
            .unwrap_or(0)
    }
}

impl Store for MemoryStore {
    fn upsert_batch(&self, table: &str, rows: Vec<Row>, natural_key: &[&str]) -> Result<u64> {
        // stage and key-validate everything before touching the table
        let mut staged = Vec::with_capacity(rows.len());
        for row in rows {
            let mut parts = Vec::with_capacity(natural_key.len());
            for col in natural_key {
                let part = row
                    .iter()
                    .find(|(c, _)| c.as_str() == *col)
                    .and_then(|(_, v)| v.as_key_part());
                match part {
                    Some(p) if !p.is_empty() => parts.push(p),
                    _ => {
                        return Err(Error::StorageCommit(format!(
                            "{table}: row is missing natural key column '{col}'"
                        )))
                    }
                }
            }
            staged.push((parts.join("|"), row));
        }
        let committed = staged.len() as u64;
        let mut tables = self.tables.write().expect("store lock poisoned");
        let entries = tables.entry(table.to_string()).or_default();
        for (key, row) in staged {
            entries.insert(key, row);
        }
        Ok(committed)
    }

    fn read(&self, table: &str, filter: &[(String, Value)]) -> Result<Vec<Row>> {
        let tables = self.tables.read().expect("store lock poisoned");
        let Some(entries) = tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(entries
            .values()
            .filter(|row| {
                filter
                    .iter()
                    .all(|(col, want)| row.iter().any(|(c, v)| c == col && v == want))
            })
            .cloned()
            .collect())
    }
}
