use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    io::Write,
    path::PathBuf,
    sync::{Mutex, RwLock},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::error::{CropcastResult, IoError, StoreError};

// ================================================================================================
// Layers & Tables
// ================================================================================================

/// The four store layers. Bronze holds source-shaped rows, silver normalized
/// rows, gold analytical outputs, reference static lookups.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    EnumString,
    EnumIter,
    Display,
    IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    Bronze,
    Silver,
    Gold,
    Reference,
}

/// A fully-qualified table reference, e.g. `silver.trade_flows`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub layer: Layer,
    pub name: String,
}

impl TableRef {
    pub fn new(layer: Layer, name: &str) -> Self {
        Self {
            layer,
            name: name.to_string(),
        }
    }

    pub fn bronze(name: &str) -> Self {
        Self::new(Layer::Bronze, name)
    }

    pub fn silver(name: &str) -> Self {
        Self::new(Layer::Silver, name)
    }

    pub fn gold(name: &str) -> Self {
        Self::new(Layer::Gold, name)
    }

    pub fn reference(name: &str) -> Self {
        Self::new(Layer::Reference, name)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.layer, self.name)
    }
}

/// One stored row: a flat JSON object.
pub type Row = serde_json::Map<String, Value>;

/// Result of an upsert batch.
#[derive(Debug, Clone, Default)]
pub struct UpsertOutcome {
    pub inserted: usize,
    pub updated: usize,
    /// Composite-key ids of every written row, in input order.
    pub affected_ids: Vec<String>,
}

impl UpsertOutcome {
    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Build the composite key for a row from its unique columns.
///
/// A column that is present but null contributes an empty segment; a column
/// that is absent entirely is a schema violation.
pub fn row_key(table: &TableRef, unique_cols: &[&str], row: &Row) -> CropcastResult<String> {
    let mut parts = Vec::with_capacity(unique_cols.len());
    for col in unique_cols {
        let value = row.get(*col).ok_or_else(|| StoreError::MissingKeyColumn {
            table: table.to_string(),
            column: col.to_string(),
        })?;
        parts.push(match value {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
    }
    Ok(parts.join("|"))
}

// ================================================================================================
// Store Contract
// ================================================================================================

/// Transactional-upsert store surface.
///
/// The relational engine itself is an external collaborator; both bundled
/// implementations resolve key conflicts by whole-row replacement, matching
/// `ON CONFLICT … DO UPDATE` semantics. All operations are blocking.
pub trait Store: Send + Sync {
    /// Upsert `rows` into `table`, deduplicating on `unique_cols`.
    fn upsert(
        &self,
        table: &TableRef,
        unique_cols: &[&str],
        rows: &[Row],
    ) -> CropcastResult<UpsertOutcome>;

    /// All rows of a table, in key order. Empty if the table does not exist.
    fn scan(&self, table: &TableRef) -> CropcastResult<Vec<Row>>;

    fn count(&self, table: &TableRef) -> CropcastResult<usize> {
        Ok(self.scan(table)?.len())
    }

    /// Tables present in a layer.
    fn tables(&self, layer: Layer) -> CropcastResult<Vec<TableRef>>;
}

/// Serialize typed records into store rows.
pub fn to_rows<T: Serialize>(records: &[T]) -> CropcastResult<Vec<Row>> {
    records
        .iter()
        .map(|r| match serde_json::to_value(r).map_err(IoError::Json)? {
            Value::Object(map) => Ok(map),
            _ => Err(StoreError::NotAnObject {
                table: "<serialize>".to_string(),
            }
            .into()),
        })
        .collect()
}

/// Deserialize store rows back into typed records, skipping rows that no
/// longer match the schema.
pub fn from_rows<T: serde::de::DeserializeOwned>(rows: Vec<Row>) -> Vec<T> {
    rows.into_iter()
        .filter_map(|row| serde_json::from_value(Value::Object(row)).ok())
        .collect()
}

// ================================================================================================
// Memory Store
// ================================================================================================

/// In-memory store for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, BTreeMap<String, Row>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn upsert(
        &self,
        table: &TableRef,
        unique_cols: &[&str],
        rows: &[Row],
    ) -> CropcastResult<UpsertOutcome> {
        let mut outcome = UpsertOutcome::default();
        let mut tables = self
            .tables
            .write()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let entries = tables.entry(table.to_string()).or_default();

        for row in rows {
            let key = row_key(table, unique_cols, row)?;
            if entries.insert(key.clone(), row.clone()).is_some() {
                outcome.updated += 1;
            } else {
                outcome.inserted += 1;
            }
            outcome.affected_ids.push(key);
        }
        Ok(outcome)
    }

    fn scan(&self, table: &TableRef) -> CropcastResult<Vec<Row>> {
        let tables = self
            .tables
            .read()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(tables
            .get(&table.to_string())
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default())
    }

    fn tables(&self, layer: Layer) -> CropcastResult<Vec<TableRef>> {
        let tables = self
            .tables
            .read()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let prefix = format!("{layer}.");
        Ok(tables
            .keys()
            .filter_map(|qualified| {
                qualified
                    .strip_prefix(&prefix)
                    .map(|name| TableRef::new(layer, name))
            })
            .collect())
    }
}

// ================================================================================================
// Local Store
// ================================================================================================

/// File-backed store: one JSON-lines file per table under `{root}/{layer}/`.
///
/// Each line is `{"__key": "...", ...row}`. Rewrites are whole-file and
/// serialized behind a process-local mutex; concurrent collectors write
/// disjoint tables in practice.
pub struct LocalStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

const KEY_FIELD: &str = "__key";

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn table_path(&self, table: &TableRef) -> PathBuf {
        self.root
            .join(table.layer.to_string())
            .join(format!("{}.jsonl", table.name))
    }

    fn load(&self, table: &TableRef) -> CropcastResult<BTreeMap<String, Row>> {
        let path = self.table_path(table);
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let text = std::fs::read_to_string(&path).map_err(IoError::Io)?;
        let mut entries = BTreeMap::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let Ok(Value::Object(mut row)) = serde_json::from_str::<Value>(line) else {
                continue;
            };
            let Some(Value::String(key)) = row.remove(KEY_FIELD) else {
                continue;
            };
            entries.insert(key, row);
        }
        Ok(entries)
    }

    fn persist(&self, table: &TableRef, entries: &BTreeMap<String, Row>) -> CropcastResult<()> {
        let path = self.table_path(table);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(IoError::Io)?;
        }
        let file = std::fs::File::create(&path).map_err(|e| IoError::WriterCreation(e.to_string()))?;
        let mut writer = std::io::BufWriter::new(file);
        for (key, row) in entries {
            let mut line = row.clone();
            line.insert(KEY_FIELD.to_string(), Value::String(key.clone()));
            let text = serde_json::to_string(&Value::Object(line)).map_err(IoError::Json)?;
            writeln!(writer, "{text}").map_err(IoError::Io)?;
        }
        writer.flush().map_err(IoError::Io)?;
        Ok(())
    }
}

impl Store for LocalStore {
    fn upsert(
        &self,
        table: &TableRef,
        unique_cols: &[&str],
        rows: &[Row],
    ) -> CropcastResult<UpsertOutcome> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let mut entries = self.load(table)?;
        let mut outcome = UpsertOutcome::default();

        for row in rows {
            let key = row_key(table, unique_cols, row)?;
            if entries.insert(key.clone(), row.clone()).is_some() {
                outcome.updated += 1;
            } else {
                outcome.inserted += 1;
            }
            outcome.affected_ids.push(key);
        }

        self.persist(table, &entries)?;
        Ok(outcome)
    }

    fn scan(&self, table: &TableRef) -> CropcastResult<Vec<Row>> {
        Ok(self.load(table)?.into_values().collect())
    }

    fn tables(&self, layer: Layer) -> CropcastResult<Vec<TableRef>> {
        let dir = self.root.join(layer.to_string());
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(IoError::Io)?.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(table) = name.strip_suffix(".jsonl") {
                found.push(TableRef::new(layer, table));
            }
        }
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn upsert_splits_inserted_and_updated() {
        let store = MemoryStore::new();
        let table = TableRef::silver("trade_flows");
        let rows = vec![
            row(&[("period", json!("2024-08")), ("hs", json!("100590")), ("v", json!(1))]),
            row(&[("period", json!("2024-08")), ("hs", json!("120190")), ("v", json!(2))]),
        ];

        let first = store.upsert(&table, &["period", "hs"], &rows).unwrap();
        assert_eq!(first.inserted, 2);
        assert_eq!(first.updated, 0);

        let second = store.upsert(&table, &["period", "hs"], &rows).unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.updated, 2);
        assert_eq!(store.count(&table).unwrap(), 2);
    }

    #[test]
    fn missing_unique_column_is_rejected() {
        let store = MemoryStore::new();
        let table = TableRef::bronze("x");
        let rows = vec![row(&[("a", json!(1))])];
        let err = store.upsert(&table, &["a", "b"], &rows).unwrap_err();
        assert!(err.to_string().contains("unique column 'b'"));
    }

    #[test]
    fn null_key_part_contributes_empty_segment() {
        let table = TableRef::silver("t");
        let r = row(&[("a", json!("x")), ("b", Value::Null)]);
        assert_eq!(row_key(&table, &["a", "b"], &r).unwrap(), "x|");
    }

    #[test]
    fn local_store_round_trips_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        let table = TableRef::gold("yield_forecast");

        let rows = vec![row(&[
            ("commodity", json!("CORN")),
            ("state", json!("IA")),
            ("yield_forecast", json!(201.5)),
        ])];
        store.upsert(&table, &["commodity", "state"], &rows).unwrap();
        store.upsert(&table, &["commodity", "state"], &rows).unwrap();

        let scanned = store.scan(&table).unwrap();
        assert_eq!(scanned.len(), 1);
        assert_eq!(scanned[0]["yield_forecast"], json!(201.5));

        let tables = store.tables(Layer::Gold).unwrap();
        assert_eq!(tables, vec![TableRef::gold("yield_forecast")]);
    }
}
