//! Store seams for Decant: document sources and relational destinations.
//!
//! Both sides are traits so the engine never touches a driver directly. The
//! document side ships a JSONL-dump reader and an in-memory store; the
//! relational side ships a PostgreSQL implementation over sqlx and an
//! in-memory implementation that enforces the same constraint classes, which
//! keeps the whole import pipeline testable without a running database.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use decant_core::{
    ColumnSpec, ColumnType, Document, DocumentFilter, Row, TableConstraint, TableDef,
};
use serde_json::Value;
use sqlx::postgres::PgPool;
use sqlx::Row as SqlxRow;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub const CRATE_NAME: &str = "decant-storage";

#[derive(Debug, Error)]
pub enum DocumentStoreError {
    #[error("unknown collection `{0}`")]
    UnknownCollection(String),
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}:{line}: invalid document: {source}")]
    Malformed {
        path: String,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Setup-time relational failures. These are fatal to a run, unlike
/// [`InsertError`].
#[derive(Debug, Error)]
pub enum RelationalError {
    #[error("unknown table `{0}`")]
    UnknownTable(String),
    #[error("database error: {0}")]
    Database(String),
}

/// Row-level insert failures, classified for the per-row reject tally.
#[derive(Debug, Error)]
pub enum InsertError {
    #[error("type/format violation: {0}")]
    Type(String),
    #[error("uniqueness violation: {0}")]
    Unique(String),
    #[error("foreign key violation: {0}")]
    ForeignKey(String),
    #[error("store error: {0}")]
    Store(String),
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch at most `limit` documents matching the equality `filter`,
    /// narrowed to the projected field paths.
    async fn find(
        &self,
        collection: &str,
        filter: &DocumentFilter,
        projection: &[String],
        limit: usize,
    ) -> Result<Vec<Document>, DocumentStoreError>;
}

#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// Idempotent create-if-absent. An existing table is left untouched.
    async fn create_table(&self, table: &TableDef) -> Result<(), RelationalError>;

    /// Idempotent drop-if-exists.
    async fn drop_table(&self, name: &str) -> Result<(), RelationalError>;

    /// Insert one row, classifying any failure. `Serial` columns absent from
    /// the row are assigned by the store.
    async fn insert(&self, table: &TableDef, row: &Row) -> Result<(), InsertError>;

    /// Read the surrogate key for `value` in a dimension table (the
    /// `key`/`value` shape built by [`decant_core::dimension_table`]).
    async fn lookup_key(
        &self,
        table: &TableDef,
        value: &Value,
    ) -> Result<Option<i64>, RelationalError>;
}

/// Top-level equality match, the only filter shape the engine pushes down.
pub fn matches_filter(document: &Document, filter: &DocumentFilter) -> bool {
    filter
        .iter()
        .all(|(field, expected)| decant_core::read_path(document, field) == Some(expected))
}

/// Narrow a document to the projected field paths. Only the leading path
/// segment is used for narrowing; `_id` is always retained so rejected rows
/// can still name their originating document.
pub fn project_document(document: &Document, projection: &[String]) -> Document {
    if projection.is_empty() {
        return document.clone();
    }
    let mut keep: Vec<&str> = projection
        .iter()
        .filter_map(|path| path.split('.').next())
        .collect();
    keep.push("_id");
    document
        .iter()
        .filter(|(key, _)| keep.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Export tools wrap driver-native scalars in single-key objects
/// (`{"$oid": ...}`, `{"$date": ...}`, `{"$numberLong": ...}`). Unwrap them
/// so mapped fields carry the values those wrappers stand for.
pub fn normalize_extended_json(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            if map.len() == 1 {
                let (key, inner) = map.iter().next().expect("len checked");
                match (key.as_str(), inner) {
                    ("$oid", Value::String(s)) => return Value::String(s.clone()),
                    ("$date", Value::String(s)) => return Value::String(s.clone()),
                    ("$date", Value::Object(fields)) => {
                        if let Some(Value::String(millis)) = fields.get("$numberLong") {
                            if let Some(ts) = millis
                                .parse::<i64>()
                                .ok()
                                .and_then(DateTime::from_timestamp_millis)
                            {
                                return Value::String(ts.to_rfc3339());
                            }
                        }
                    }
                    ("$numberLong", Value::String(s)) => {
                        if let Ok(n) = s.parse::<i64>() {
                            return Value::Number(n.into());
                        }
                    }
                    _ => {}
                }
            }
            Value::Object(
                map.into_iter()
                    .map(|(key, value)| (key, normalize_extended_json(value)))
                    .collect(),
            )
        }
        Value::Array(items) => {
            Value::Array(items.into_iter().map(normalize_extended_json).collect())
        }
        other => other,
    }
}

/// A directory of `<collection>.jsonl` dump files, one document per line.
#[derive(Debug, Clone)]
pub struct JsonlDocumentStore {
    root: PathBuf,
}

impl JsonlDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn collection_path(&self, collection: &str) -> PathBuf {
        self.root.join(format!("{collection}.jsonl"))
    }
}

#[async_trait]
impl DocumentStore for JsonlDocumentStore {
    async fn find(
        &self,
        collection: &str,
        filter: &DocumentFilter,
        projection: &[String],
        limit: usize,
    ) -> Result<Vec<Document>, DocumentStoreError> {
        let path = self.collection_path(collection);
        let text = tokio::fs::read_to_string(&path).await.map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                DocumentStoreError::UnknownCollection(collection.to_string())
            } else {
                DocumentStoreError::Io {
                    path: path.display().to_string(),
                    source,
                }
            }
        })?;

        let mut documents = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            if documents.len() >= limit {
                break;
            }
            if line.trim().is_empty() {
                continue;
            }
            let value: Value =
                serde_json::from_str(line).map_err(|source| DocumentStoreError::Malformed {
                    path: path.display().to_string(),
                    line: idx + 1,
                    source,
                })?;
            let Value::Object(document) = normalize_extended_json(value) else {
                debug!(collection, line = idx + 1, "skipping non-object dump line");
                continue;
            };
            if !matches_filter(&document, filter) {
                continue;
            }
            documents.push(project_document(&document, projection));
        }
        Ok(documents)
    }
}

/// Seedable in-memory collections, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    collections: Mutex<BTreeMap<String, Vec<Document>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, collection: &str, documents: Vec<Document>) {
        self.collections
            .lock()
            .await
            .entry(collection.to_string())
            .or_default()
            .extend(documents);
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn find(
        &self,
        collection: &str,
        filter: &DocumentFilter,
        projection: &[String],
        limit: usize,
    ) -> Result<Vec<Document>, DocumentStoreError> {
        let collections = self.collections.lock().await;
        let documents = collections
            .get(collection)
            .ok_or_else(|| DocumentStoreError::UnknownCollection(collection.to_string()))?;
        Ok(documents
            .iter()
            .filter(|document| matches_filter(document, filter))
            .take(limit)
            .map(|document| project_document(document, projection))
            .collect())
    }
}

// --- in-memory relational store -------------------------------------------

#[derive(Debug, Clone)]
struct MemTable {
    def: TableDef,
    rows: Vec<Row>,
    next_key: i64,
}

/// Constraint-enforcing in-memory relational store. Classifies failures the
/// same way [`PgStore`] does, so engine tests exercise the real reject
/// paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<BTreeMap<String, MemTable>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn table_names(&self) -> Vec<String> {
        self.tables.lock().await.keys().cloned().collect()
    }

    pub async fn table_def(&self, name: &str) -> Option<TableDef> {
        self.tables.lock().await.get(name).map(|t| t.def.clone())
    }

    pub async fn rows(&self, name: &str) -> Vec<Row> {
        self.tables
            .lock()
            .await
            .get(name)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }
}

fn value_fits(value: &Value, column_type: ColumnType) -> bool {
    match column_type {
        ColumnType::Serial | ColumnType::BigInt => value.as_i64().is_some(),
        ColumnType::Integer => value
            .as_i64()
            .is_some_and(|n| i32::try_from(n).is_ok()),
        ColumnType::Float => value.as_f64().is_some(),
        ColumnType::Text => value.is_string(),
        ColumnType::Boolean => value.is_boolean(),
        ColumnType::Timestamp => value
            .as_str()
            .is_some_and(|s| DateTime::parse_from_rfc3339(s).is_ok()),
    }
}

fn tuple_of<'a>(row: &'a Row, columns: &[String]) -> Option<Vec<&'a Value>> {
    // SQL uniqueness never fires on NULL members; a missing column reads as
    // NULL here.
    columns
        .iter()
        .map(|column| match row.get(column) {
            Some(value) if !value.is_null() => Some(value),
            _ => None,
        })
        .collect()
}

impl MemoryStore {
    fn check_insert(
        tables: &BTreeMap<String, MemTable>,
        table: &MemTable,
        row: &Row,
    ) -> Result<(), InsertError> {
        for column in row.keys() {
            if table.def.column(column).is_none() {
                return Err(InsertError::Store(format!(
                    "unknown column `{column}` in `{}`",
                    table.def.name
                )));
            }
        }

        for column in &table.def.columns {
            let value = row.get(&column.name).unwrap_or(&Value::Null);
            if value.is_null() {
                let generated = column.column_type == ColumnType::Serial;
                if !column.nullable && !generated {
                    return Err(InsertError::Type(format!(
                        "null value in non-nullable column `{}`",
                        column.name
                    )));
                }
                continue;
            }
            if !value_fits(value, column.column_type) {
                return Err(InsertError::Type(format!(
                    "value for `{}` does not fit {:?}",
                    column.name, column.column_type
                )));
            }
        }

        let mut unique_sets: Vec<Vec<String>> = Vec::new();
        let primary: Vec<String> = table
            .def
            .columns
            .iter()
            .filter(|c| c.primary_key && c.column_type != ColumnType::Serial)
            .map(|c| c.name.clone())
            .collect();
        if !primary.is_empty() {
            unique_sets.push(primary);
        }
        for column in table.def.columns.iter().filter(|c| c.unique) {
            unique_sets.push(vec![column.name.clone()]);
        }
        for constraint in &table.def.constraints {
            if let TableConstraint::Unique { columns } = constraint {
                unique_sets.push(columns.clone());
            }
        }
        for columns in &unique_sets {
            let Some(candidate) = tuple_of(row, columns) else {
                continue;
            };
            for existing in &table.rows {
                if tuple_of(existing, columns).as_ref() == Some(&candidate) {
                    return Err(InsertError::Unique(format!(
                        "duplicate ({}) in `{}`",
                        columns.join(", "),
                        table.def.name
                    )));
                }
            }
        }

        for constraint in &table.def.constraints {
            let TableConstraint::ForeignKey {
                columns,
                table: target,
                references,
            } = constraint
            else {
                continue;
            };
            let Some(candidate) = tuple_of(row, columns) else {
                continue;
            };
            let referenced = tables.get(target).ok_or_else(|| {
                InsertError::ForeignKey(format!("referenced table `{target}` does not exist"))
            })?;
            let hit = referenced
                .rows
                .iter()
                .any(|existing| tuple_of(existing, references).as_ref() == Some(&candidate));
            if !hit {
                return Err(InsertError::ForeignKey(format!(
                    "({}) not present in `{target}`",
                    columns.join(", ")
                )));
            }
        }

        Ok(())
    }
}

#[async_trait]
impl RelationalStore for MemoryStore {
    async fn create_table(&self, table: &TableDef) -> Result<(), RelationalError> {
        let mut tables = self.tables.lock().await;
        tables.entry(table.name.clone()).or_insert_with(|| MemTable {
            def: table.clone(),
            rows: Vec::new(),
            next_key: 1,
        });
        Ok(())
    }

    async fn drop_table(&self, name: &str) -> Result<(), RelationalError> {
        self.tables.lock().await.remove(name);
        Ok(())
    }

    async fn insert(&self, table: &TableDef, row: &Row) -> Result<(), InsertError> {
        let mut tables = self.tables.lock().await;
        let target = tables
            .get(&table.name)
            .ok_or_else(|| InsertError::Store(format!("unknown table `{}`", table.name)))?;

        let mut stored = row.clone();
        for column in &target.def.columns {
            let absent = stored
                .get(&column.name)
                .map_or(true, serde_json::Value::is_null);
            if column.column_type == ColumnType::Serial && absent {
                let key = target.next_key;
                stored.insert(column.name.clone(), Value::Number(key.into()));
            }
        }

        Self::check_insert(&tables, target, &stored)?;

        let target = tables.get_mut(&table.name).expect("checked above");
        let serial_columns = target
            .def
            .columns
            .iter()
            .filter(|c| c.column_type == ColumnType::Serial)
            .count();
        target.next_key += serial_columns as i64;
        target.rows.push(stored);
        Ok(())
    }

    async fn lookup_key(
        &self,
        table: &TableDef,
        value: &Value,
    ) -> Result<Option<i64>, RelationalError> {
        let tables = self.tables.lock().await;
        let target = tables
            .get(&table.name)
            .ok_or_else(|| RelationalError::UnknownTable(table.name.clone()))?;
        Ok(target
            .rows
            .iter()
            .find(|row| row.get("value") == Some(value))
            .and_then(|row| row.get("key"))
            .and_then(Value::as_i64))
    }
}

// --- PostgreSQL store -----------------------------------------------------

fn sql_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Serial => "BIGSERIAL",
        ColumnType::BigInt => "BIGINT",
        ColumnType::Integer => "INTEGER",
        ColumnType::Float => "DOUBLE PRECISION",
        ColumnType::Text => "TEXT",
        ColumnType::Boolean => "BOOLEAN",
        ColumnType::Timestamp => "TIMESTAMPTZ",
    }
}

fn render_create_table(table: &TableDef) -> String {
    let mut parts = Vec::new();
    for column in &table.columns {
        let mut part = format!("\"{}\" {}", column.name, sql_type(column.column_type));
        if !column.nullable && !column.primary_key {
            part.push_str(" NOT NULL");
        }
        if column.unique {
            part.push_str(" UNIQUE");
        }
        parts.push(part);
    }

    let primary: Vec<String> = table
        .columns
        .iter()
        .filter(|c| c.primary_key)
        .map(|c| format!("\"{}\"", c.name))
        .collect();
    if !primary.is_empty() {
        parts.push(format!("PRIMARY KEY ({})", primary.join(", ")));
    }

    for constraint in &table.constraints {
        match constraint {
            TableConstraint::Unique { columns } => {
                parts.push(format!("UNIQUE ({})", quoted_list(columns)));
            }
            TableConstraint::ForeignKey {
                columns,
                table: target,
                references,
            } => {
                parts.push(format!(
                    "FOREIGN KEY ({}) REFERENCES \"{target}\" ({})",
                    quoted_list(columns),
                    quoted_list(references)
                ));
            }
        }
    }

    format!(
        "CREATE TABLE IF NOT EXISTS \"{}\" ({})",
        table.name,
        parts.join(", ")
    )
}

fn quoted_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| format!("\"{c}\""))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Map a SQLSTATE onto the reject classes the import pipeline counts.
fn classify_sqlstate(code: &str, message: &str) -> InsertError {
    if code == "23505" {
        InsertError::Unique(message.to_string())
    } else if code == "23503" {
        InsertError::ForeignKey(message.to_string())
    } else if code.starts_with("22") || code == "23502" || code == "23514" {
        InsertError::Type(message.to_string())
    } else {
        InsertError::Store(message.to_string())
    }
}

fn classify_db_error(err: sqlx::Error) -> InsertError {
    match &err {
        sqlx::Error::Database(db) => match db.code() {
            Some(code) => classify_sqlstate(code.as_ref(), db.message()),
            None => InsertError::Store(db.message().to_string()),
        },
        _ => InsertError::Store(err.to_string()),
    }
}

/// A row value coerced to the wire type its declared column expects. The
/// coercion happens before the statement runs, so a misfit classifies as a
/// type reject without a round-trip.
#[derive(Debug, Clone, PartialEq)]
enum PgValue {
    BigInt(Option<i64>),
    Integer(Option<i32>),
    Float(Option<f64>),
    Text(Option<String>),
    Boolean(Option<bool>),
    Timestamp(Option<DateTime<Utc>>),
}

fn pg_value(column: &ColumnSpec, value: &Value) -> Result<PgValue, InsertError> {
    let mismatch = || {
        InsertError::Type(format!(
            "value for `{}` does not fit {:?}",
            column.name, column.column_type
        ))
    };
    if value.is_null() {
        return Ok(match column.column_type {
            ColumnType::Serial | ColumnType::BigInt => PgValue::BigInt(None),
            ColumnType::Integer => PgValue::Integer(None),
            ColumnType::Float => PgValue::Float(None),
            ColumnType::Text => PgValue::Text(None),
            ColumnType::Boolean => PgValue::Boolean(None),
            ColumnType::Timestamp => PgValue::Timestamp(None),
        });
    }
    Ok(match column.column_type {
        ColumnType::Serial | ColumnType::BigInt => {
            PgValue::BigInt(Some(value.as_i64().ok_or_else(mismatch)?))
        }
        ColumnType::Integer => {
            let n = value.as_i64().ok_or_else(mismatch)?;
            PgValue::Integer(Some(i32::try_from(n).map_err(|_| mismatch())?))
        }
        ColumnType::Float => PgValue::Float(Some(value.as_f64().ok_or_else(mismatch)?)),
        ColumnType::Text => PgValue::Text(Some(value.as_str().ok_or_else(mismatch)?.to_string())),
        ColumnType::Boolean => PgValue::Boolean(Some(value.as_bool().ok_or_else(mismatch)?)),
        ColumnType::Timestamp => {
            let text = value.as_str().ok_or_else(mismatch)?;
            let parsed = DateTime::parse_from_rfc3339(text).map_err(|_| mismatch())?;
            PgValue::Timestamp(Some(parsed.with_timezone(&Utc)))
        }
    })
}

/// PostgreSQL-backed relational store over a shared connection pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self, RelationalError> {
        let pool = PgPool::connect(url)
            .await
            .map_err(|err| RelationalError::Database(err.to_string()))?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl RelationalStore for PgStore {
    async fn create_table(&self, table: &TableDef) -> Result<(), RelationalError> {
        let ddl = render_create_table(table);
        debug!(table = %table.name, "creating table");
        sqlx::query(&ddl)
            .execute(&self.pool)
            .await
            .map_err(|err| RelationalError::Database(err.to_string()))?;
        Ok(())
    }

    async fn drop_table(&self, name: &str) -> Result<(), RelationalError> {
        let ddl = format!("DROP TABLE IF EXISTS \"{name}\"");
        debug!(table = %name, "dropping table");
        sqlx::query(&ddl)
            .execute(&self.pool)
            .await
            .map_err(|err| RelationalError::Database(err.to_string()))?;
        Ok(())
    }

    async fn insert(&self, table: &TableDef, row: &Row) -> Result<(), InsertError> {
        let present: Vec<&ColumnSpec> = table
            .columns
            .iter()
            .filter(|column| row.contains_key(&column.name))
            .collect();
        if present.is_empty() {
            return Err(InsertError::Store(format!(
                "empty row for `{}`",
                table.name
            )));
        }

        let columns = present
            .iter()
            .map(|c| format!("\"{}\"", c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=present.len())
            .map(|i| format!("${i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO \"{}\" ({columns}) VALUES ({placeholders})",
            table.name
        );

        let mut query = sqlx::query(&sql);
        for &column in &present {
            query = match pg_value(column, &row[&column.name])? {
                PgValue::BigInt(v) => query.bind(v),
                PgValue::Integer(v) => query.bind(v),
                PgValue::Float(v) => query.bind(v),
                PgValue::Text(v) => query.bind(v),
                PgValue::Boolean(v) => query.bind(v),
                PgValue::Timestamp(v) => query.bind(v),
            };
        }
        query
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(classify_db_error)
    }

    async fn lookup_key(
        &self,
        table: &TableDef,
        value: &Value,
    ) -> Result<Option<i64>, RelationalError> {
        let value_column = table
            .column("value")
            .ok_or_else(|| RelationalError::UnknownTable(table.name.clone()))?;
        let sql = format!(
            "SELECT \"key\" FROM \"{}\" WHERE \"value\" = $1",
            table.name
        );
        let query = sqlx::query(&sql);
        let query = match pg_value(value_column, value)
            .map_err(|err| RelationalError::Database(err.to_string()))?
        {
            PgValue::BigInt(v) => query.bind(v),
            PgValue::Integer(v) => query.bind(v),
            PgValue::Float(v) => query.bind(v),
            PgValue::Text(v) => query.bind(v),
            PgValue::Boolean(v) => query.bind(v),
            PgValue::Timestamp(v) => query.bind(v),
        };
        let found = query
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| RelationalError::Database(err.to_string()))?;
        found
            .map(|row| {
                row.try_get::<i64, _>(0)
                    .map_err(|err| RelationalError::Database(err.to_string()))
            })
            .transpose()
    }
}
