//! Import pipeline for Decant: lookup conversion, row assembly, and the
//! schema manager that drives a run.
//!
//! A run walks *Initialized → Converters-Ready → Tables-Ready → Importing →
//! Done*: dimension tables first, then destination lifecycle, then a
//! document-by-document, row-by-row import in which every failure below the
//! setup level is recovered, classified and tallied instead of aborting the
//! batch.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use decant_core::{
    dimension_table, ColumnType, CompiledConfig, CompiledMapping, Document, Row, SourceDef,
    TableDef,
};
use decant_storage::{DocumentStore, InsertError, RelationalError, RelationalStore};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "decant-import";

/// Documents fetched per source per run when the caller does not say
/// otherwise.
pub const DEFAULT_FETCH_LIMIT: usize = 100;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("converter `{converter}`: {message}")]
    Store { converter: String, message: String },
}

/// Maps arbitrary values to stable surrogate keys in a dimension table,
/// creating keys on first sight. Holds no cache: the value column's
/// uniqueness constraint is the only deduplication authority.
pub struct LookupConverter {
    name: String,
    table: TableDef,
    store: Arc<dyn RelationalStore>,
}

impl LookupConverter {
    pub fn new(name: &str, value_type: ColumnType, store: Arc<dyn RelationalStore>) -> Self {
        Self {
            name: name.to_string(),
            table: dimension_table(name, value_type),
            store,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &TableDef {
        &self.table
    }

    /// Dimension tables are created before any import and never dropped, so
    /// keys stay stable across runs.
    pub async fn ensure_table(&self) -> Result<(), RelationalError> {
        self.store.create_table(&self.table).await
    }

    /// Idempotent value → surrogate key. Read first; on miss, insert; if the
    /// insert loses a uniqueness race, re-read for the winner's key.
    pub async fn lookup(&self, value: &Value) -> Result<i64, ConvertError> {
        let store_err = |message: String| ConvertError::Store {
            converter: self.name.clone(),
            message,
        };

        if let Some(key) = self
            .store
            .lookup_key(&self.table, value)
            .await
            .map_err(|err| store_err(err.to_string()))?
        {
            return Ok(key);
        }

        let mut row = Row::new();
        row.insert("value".to_string(), value.clone());
        match self.store.insert(&self.table, &row).await {
            Ok(()) => {}
            // Lost the race; the winner's key is now readable.
            Err(InsertError::Unique(_)) => {}
            Err(other) => return Err(store_err(other.to_string())),
        }

        match self
            .store
            .lookup_key(&self.table, value)
            .await
            .map_err(|err| store_err(err.to_string()))?
        {
            Some(key) => Ok(key),
            None => Err(store_err(format!("no key for {value} after insert"))),
        }
    }
}

/// Why a candidate row was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Type,
    Unique,
    ForeignKey,
    Conversion,
    Store,
}

impl RejectReason {
    fn from_insert(err: &InsertError) -> Self {
        match err {
            InsertError::Type(_) => Self::Type,
            InsertError::Unique(_) => Self::Unique,
            InsertError::ForeignKey(_) => Self::ForeignKey,
            InsertError::Store(_) => Self::Store,
        }
    }
}

/// One rejected row, tied back to its originating document where the
/// document carries an `_id`.
#[derive(Debug, Clone, Serialize)]
pub struct RejectedRow {
    pub table: String,
    pub collection: String,
    pub document_id: Option<String>,
    pub reason: RejectReason,
    pub detail: String,
}

/// Rows assembled from one document. Empty rows with no failures means the
/// document contributed nothing (missing required field or empty fan-out
/// set) — that is extraction policy, not an error.
#[derive(Debug, Default)]
pub struct AssembledRows {
    pub rows: Vec<Row>,
    pub conversion_failures: Vec<String>,
}

/// Turns one document from one source into candidate rows.
pub struct RowAssembler<'a> {
    source: &'a SourceDef,
    converters: &'a BTreeMap<String, LookupConverter>,
}

impl<'a> RowAssembler<'a> {
    pub fn new(source: &'a SourceDef, converters: &'a BTreeMap<String, LookupConverter>) -> Self {
        Self { source, converters }
    }

    async fn convert(&self, converter: &str, value: &Value) -> Result<Value, String> {
        match self.converters.get(converter) {
            Some(converter) => converter
                .lookup(value)
                .await
                .map(Value::from)
                .map_err(|err| err.to_string()),
            None => Err(format!("unknown converter `{converter}`")),
        }
    }

    pub async fn rows_for(&self, document: &Document) -> AssembledRows {
        let mut outcome = AssembledRows::default();

        // The base columns are shared by every fan-out row, so their
        // required-field and conversion fate applies to the document as a
        // whole.
        let mut base = Row::new();
        for extractor in &self.source.extractors {
            let raw = match extractor.read(document) {
                Ok(raw) => raw,
                Err(_) => return outcome,
            };
            let value = match extractor.converter() {
                Some(converter) if !raw.is_null() => match self.convert(converter, &raw).await {
                    Ok(key) => key,
                    Err(detail) => {
                        outcome.conversion_failures.push(detail);
                        return outcome;
                    }
                },
                _ => raw,
            };
            base.insert(extractor.column.clone(), value);
        }

        let Some(linking) = &self.source.linking else {
            outcome.rows.push(base);
            return outcome;
        };

        let values = match linking.read_values(document) {
            Ok(values) => values,
            Err(_) => return outcome,
        };
        for value in values {
            let value = match &linking.converter {
                Some(converter) => match self.convert(converter, &value).await {
                    Ok(key) => key,
                    Err(detail) => {
                        // One bad value rejects one fan-out row; siblings
                        // keep going.
                        outcome.conversion_failures.push(detail);
                        continue;
                    }
                },
                None => value,
            };
            let mut row = base.clone();
            row.insert(linking.column.clone(), value);
            outcome.rows.push(row);
        }
        outcome
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MappingReport {
    pub table: String,
    pub documents: usize,
    pub inserted: usize,
    pub rejected: usize,
    pub skipped: usize,
    pub rejects: Vec<RejectedRow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub run_id: Uuid,
    pub db: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub mappings: Vec<MappingReport>,
}

impl ImportReport {
    pub fn total_inserted(&self) -> usize {
        self.mappings.iter().map(|m| m.inserted).sum()
    }

    pub fn total_rejected(&self) -> usize {
        self.mappings.iter().map(|m| m.rejected).sum()
    }

    pub fn total_documents(&self) -> usize {
        self.mappings.iter().map(|m| m.documents).sum()
    }
}

/// Owns the mappings and converters for one run and drives the pipeline.
pub struct SchemaManager {
    db: String,
    mappings: Vec<CompiledMapping>,
    converters: BTreeMap<String, LookupConverter>,
    relational: Arc<dyn RelationalStore>,
    documents: Arc<dyn DocumentStore>,
}

impl SchemaManager {
    pub fn new(
        config: CompiledConfig,
        relational: Arc<dyn RelationalStore>,
        documents: Arc<dyn DocumentStore>,
    ) -> Self {
        let converters = config
            .converters
            .iter()
            .map(|(name, value_type)| {
                (
                    name.clone(),
                    LookupConverter::new(name, *value_type, relational.clone()),
                )
            })
            .collect();
        Self {
            db: config.db,
            mappings: config.mappings,
            converters,
            relational,
            documents,
        }
    }

    pub fn mapping_names(&self) -> Vec<&str> {
        self.mappings.iter().map(CompiledMapping::name).collect()
    }

    /// Restrict the run to the named mappings; both table lifecycle and
    /// import honor the restriction. An empty selection keeps everything.
    pub fn select(&mut self, names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        for name in names {
            if !self.mappings.iter().any(|m| m.name() == name) {
                bail!("unknown mapping `{name}`");
            }
        }
        self.mappings.retain(|m| names.iter().any(|n| n == m.name()));
        Ok(())
    }

    /// *Initialized → Converters-Ready*: every dimension table exists.
    pub async fn prepare_converters(&self) -> Result<()> {
        for converter in self.converters.values() {
            converter
                .ensure_table()
                .await
                .with_context(|| format!("creating dimension table `{}`", converter.name()))?;
        }
        Ok(())
    }

    /// *Converters-Ready → Tables-Ready*. Refreshable destinations are
    /// dropped in reverse registration order and created in registration
    /// order, so foreign-key dependents go down before their targets and
    /// come up after. Non-refreshable destinations are created if absent
    /// but never dropped.
    pub async fn prepare_tables(&self) -> Result<()> {
        for mapping in self.mappings.iter().rev().filter(|m| m.refresh) {
            self.relational
                .drop_table(mapping.name())
                .await
                .with_context(|| format!("dropping table `{}`", mapping.name()))?;
        }
        for mapping in &self.mappings {
            self.relational
                .create_table(&mapping.table)
                .await
                .with_context(|| format!("creating table `{}`", mapping.name()))?;
        }
        Ok(())
    }

    /// *Tables-Ready → Importing → Done*. Row-level failures never abort a
    /// mapping or the run.
    pub async fn import_all(&self, limit: usize) -> Result<ImportReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut mappings = Vec::new();
        for mapping in &self.mappings {
            mappings.push(self.import_mapping(mapping, limit).await?);
        }
        Ok(ImportReport {
            run_id,
            db: self.db.clone(),
            started_at,
            finished_at: Utc::now(),
            mappings,
        })
    }

    /// Full pipeline for the (possibly restricted) mapping set.
    pub async fn run(&self, limit: usize) -> Result<ImportReport> {
        self.prepare_converters().await?;
        self.prepare_tables().await?;
        self.import_all(limit).await
    }

    async fn import_mapping(
        &self,
        mapping: &CompiledMapping,
        limit: usize,
    ) -> Result<MappingReport> {
        let mut report = MappingReport {
            table: mapping.name().to_string(),
            documents: 0,
            inserted: 0,
            rejected: 0,
            skipped: 0,
            rejects: Vec::new(),
        };

        for source in &mapping.sources {
            let projection = source.projection();
            let documents = self
                .documents
                .find(&source.collection, &source.filter, &projection, limit)
                .await
                .with_context(|| {
                    format!(
                        "fetching `{}` for mapping `{}`",
                        source.collection,
                        mapping.name()
                    )
                })?;

            let assembler = RowAssembler::new(source, &self.converters);
            for document in &documents {
                report.documents += 1;
                let outcome = assembler.rows_for(document).await;
                if outcome.rows.is_empty() && outcome.conversion_failures.is_empty() {
                    report.skipped += 1;
                    continue;
                }

                for detail in outcome.conversion_failures {
                    warn!(table = %mapping.name(), %detail, "row rejected during conversion");
                    report.rejects.push(RejectedRow {
                        table: mapping.name().to_string(),
                        collection: source.collection.clone(),
                        document_id: document_id(document),
                        reason: RejectReason::Conversion,
                        detail,
                    });
                }

                for row in outcome.rows {
                    match self.relational.insert(&mapping.table, &row).await {
                        Ok(()) => report.inserted += 1,
                        Err(err) => {
                            warn!(table = %mapping.name(), %err, "row rejected on insert");
                            report.rejects.push(RejectedRow {
                                table: mapping.name().to_string(),
                                collection: source.collection.clone(),
                                document_id: document_id(document),
                                reason: RejectReason::from_insert(&err),
                                detail: err.to_string(),
                            });
                        }
                    }
                }
            }
        }

        report.rejected = report.rejects.len();
        info!(
            table = %report.table,
            documents = report.documents,
            inserted = report.inserted,
            rejected = report.rejected,
            skipped = report.skipped,
            "mapping imported"
        );
        Ok(report)
    }
}

fn document_id(document: &Document) -> Option<String> {
    document.get("_id").map(|id| match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use decant_core::{LinkingExtractor, MappingConfig, ValueExtractor};
    use decant_storage::{MemoryDocumentStore, MemoryStore};
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().expect("object").clone()
    }

    fn mk_store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::new())
    }

    async fn mk_converter(store: &Arc<MemoryStore>) -> LookupConverter {
        let converter = LookupConverter::new(
            "tags",
            ColumnType::Text,
            store.clone() as Arc<dyn RelationalStore>,
        );
        converter.ensure_table().await.expect("dimension table");
        converter
    }

    #[tokio::test]
    async fn lookup_returns_the_same_key_for_equal_values() {
        let store = mk_store();
        let converter = mk_converter(&store).await;

        let first = converter.lookup(&json!("rust")).await.expect("lookup");
        let other = converter.lookup(&json!("json")).await.expect("lookup");
        let again = converter.lookup(&json!("rust")).await.expect("lookup");

        assert_eq!(first, again);
        assert_ne!(first, other);
        assert_eq!(store.rows("tags").await.len(), 2);
    }

    #[tokio::test]
    async fn lookup_recovers_when_the_value_already_landed() {
        let store = mk_store();
        let converter = mk_converter(&store).await;

        // Another writer got there first.
        let mut row = Row::new();
        row.insert("value".to_string(), json!("seen"));
        store.insert(converter.table(), &row).await.expect("seed");

        let key = converter.lookup(&json!("seen")).await.expect("lookup");
        assert_eq!(key, 1);
        assert_eq!(store.rows("tags").await.len(), 1);
    }

    #[tokio::test]
    async fn lookup_misfit_value_is_a_conversion_failure() {
        let store = mk_store();
        let converter = mk_converter(&store).await;
        let err = converter.lookup(&json!({"not": "scalar"})).await;
        assert!(err.is_err());
    }

    fn plain_source() -> SourceDef {
        SourceDef {
            collection: "people".into(),
            filter: Document::new(),
            extractors: vec![
                ValueExtractor::field("person_id", "_id", true),
                ValueExtractor::field("name", "name", true),
                ValueExtractor::field("nick", "nick", false),
            ],
            linking: None,
        }
    }

    #[tokio::test]
    async fn missing_optional_field_still_yields_a_row_with_null() {
        let source = plain_source();
        let converters = BTreeMap::new();
        let assembler = RowAssembler::new(&source, &converters);

        let outcome = assembler
            .rows_for(&doc(json!({"_id": "p1", "name": "ann"})))
            .await;
        assert_eq!(outcome.rows.len(), 1);
        assert_eq!(outcome.rows[0]["nick"], Value::Null);
    }

    #[tokio::test]
    async fn missing_required_field_yields_zero_rows() {
        let source = plain_source();
        let converters = BTreeMap::new();
        let assembler = RowAssembler::new(&source, &converters);

        let outcome = assembler.rows_for(&doc(json!({"_id": "p2"}))).await;
        assert!(outcome.rows.is_empty());
        assert!(outcome.conversion_failures.is_empty());
    }

    fn linking_source(pattern: Option<&str>, converter: Option<&str>) -> SourceDef {
        SourceDef {
            collection: "people".into(),
            filter: Document::new(),
            extractors: vec![ValueExtractor::field("person_id", "_id", true)],
            linking: Some(LinkingExtractor {
                column: "tag".into(),
                path: "tags".into(),
                required: false,
                pattern: pattern.map(|p| regex_lite(p)),
                converter: converter.map(str::to_string),
            }),
        }
    }

    fn regex_lite(pattern: &str) -> regex::Regex {
        regex::Regex::new(pattern).expect("pattern")
    }

    #[tokio::test]
    async fn fan_out_deduplicates_within_one_document() {
        let source = linking_source(None, None);
        let converters = BTreeMap::new();
        let assembler = RowAssembler::new(&source, &converters);

        let outcome = assembler
            .rows_for(&doc(json!({"_id": "p1", "tags": ["a", "a", "b"]})))
            .await;
        assert_eq!(outcome.rows.len(), 2);
        for row in &outcome.rows {
            assert_eq!(row["person_id"], json!("p1"));
        }
    }

    #[tokio::test]
    async fn fan_out_pattern_keeps_matching_values() {
        let source = linking_source(Some("^a"), None);
        let converters = BTreeMap::new();
        let assembler = RowAssembler::new(&source, &converters);

        let outcome = assembler
            .rows_for(&doc(json!({"_id": "p1", "tags": ["a1", "b1", "a2"]})))
            .await;
        let mut tags: Vec<&Value> = outcome.rows.iter().map(|r| &r["tag"]).collect();
        tags.sort_by_key(|v| v.to_string());
        assert_eq!(tags, vec![&json!("a1"), &json!("a2")]);
    }

    #[tokio::test]
    async fn fan_out_converts_values_through_the_dimension() {
        let store = mk_store();
        let mut converters = BTreeMap::new();
        converters.insert("tags".to_string(), mk_converter(&store).await);
        let source = linking_source(None, Some("tags"));
        let assembler = RowAssembler::new(&source, &converters);

        let first = assembler
            .rows_for(&doc(json!({"_id": "p1", "tags": ["rust"]})))
            .await;
        let second = assembler
            .rows_for(&doc(json!({"_id": "p2", "tags": ["rust", "json"]})))
            .await;

        assert_eq!(first.rows[0]["tag"], json!(1));
        let mut keys: Vec<i64> = second.rows.iter().map(|r| r["tag"].as_i64().unwrap()).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec![1, 2]);
    }

    #[tokio::test]
    async fn one_bad_fan_out_value_spares_its_siblings() {
        let store = mk_store();
        let mut converters = BTreeMap::new();
        converters.insert("tags".to_string(), mk_converter(&store).await);
        let source = linking_source(None, Some("tags"));
        let assembler = RowAssembler::new(&source, &converters);

        // 7 cannot land in a text dimension; "ok" can.
        let outcome = assembler
            .rows_for(&doc(json!({"_id": "p1", "tags": ["ok", 7]})))
            .await;
        assert_eq!(outcome.rows.len(), 1);
        assert_eq!(outcome.conversion_failures.len(), 1);
    }

    const PIPELINE_YAML: &str = r#"
db: app
converters:
  tags: { type: string }
tables:
  - name: people
    refresh: true
    sources:
      - columns:
          - { column: person_id, field: _id, type: string, primary_key: true, required: true }
          - { column: name, field: name, type: string, required: true }
    constraints:
      - unique: [name]
  - name: person_tags
    refresh: true
    sources:
      - collection: people
        columns:
          - { column: person_id, field: _id, type: string, required: true }
        linking:
          { column: tag_key, field: tags, convert: tags }
"#;

    async fn mk_manager(
        documents: Vec<Value>,
    ) -> (SchemaManager, Arc<MemoryStore>) {
        let compiled = MappingConfig::from_yaml(PIPELINE_YAML)
            .expect("yaml")
            .compile()
            .expect("compile");
        let relational = mk_store();
        let docs = Arc::new(MemoryDocumentStore::new());
        let seeded: Vec<Document> = documents.into_iter().map(doc).collect();
        docs.seed("people", seeded).await;
        let manager = SchemaManager::new(
            compiled,
            relational.clone() as Arc<dyn RelationalStore>,
            docs as Arc<dyn DocumentStore>,
        );
        (manager, relational)
    }

    #[tokio::test]
    async fn import_counts_skipped_documents_without_rejecting_them() {
        let (manager, store) = mk_manager(vec![
            json!({"_id": "p1", "name": "ann", "tags": ["a"]}),
            json!({"_id": "p2", "tags": []}),
            json!({"_id": "p3", "name": "cyd"}),
        ])
        .await;

        let report = manager.run(DEFAULT_FETCH_LIMIT).await.expect("run");
        let people = &report.mappings[0];
        assert_eq!(people.documents, 3);
        assert_eq!(people.inserted, 2);
        assert_eq!(people.skipped, 1);
        assert_eq!(people.rejected, 0);
        assert_eq!(store.rows("people").await.len(), 2);
    }

    #[tokio::test]
    async fn uniqueness_rejects_count_without_stopping_the_batch() {
        let (manager, store) = mk_manager(vec![
            json!({"_id": "p1", "name": "ann"}),
            json!({"_id": "p2", "name": "ann"}),
            json!({"_id": "p3", "name": "cyd"}),
        ])
        .await;

        let report = manager.run(DEFAULT_FETCH_LIMIT).await.expect("run");
        let people = &report.mappings[0];
        assert_eq!(people.inserted, 2);
        assert_eq!(people.rejected, 1);
        assert_eq!(people.rejects[0].reason, RejectReason::Unique);
        assert_eq!(people.rejects[0].document_id.as_deref(), Some("p2"));
        assert_eq!(store.rows("people").await.len(), 2);
    }

    #[tokio::test]
    async fn fan_out_mapping_shares_dimension_keys_across_documents() {
        let (manager, store) = mk_manager(vec![
            json!({"_id": "p1", "name": "ann", "tags": ["rust", "json"]}),
            json!({"_id": "p2", "name": "bob", "tags": ["rust"]}),
        ])
        .await;

        let report = manager.run(DEFAULT_FETCH_LIMIT).await.expect("run");
        let person_tags = &report.mappings[1];
        assert_eq!(person_tags.inserted, 3);
        assert_eq!(store.rows("tags").await.len(), 2);

        let rows = store.rows("person_tags").await;
        let p1_keys: Vec<i64> = rows
            .iter()
            .filter(|r| r["person_id"] == json!("p1"))
            .map(|r| r["tag_key"].as_i64().unwrap())
            .collect();
        let p2_keys: Vec<i64> = rows
            .iter()
            .filter(|r| r["person_id"] == json!("p2"))
            .map(|r| r["tag_key"].as_i64().unwrap())
            .collect();
        assert_eq!(p1_keys.len(), 2);
        assert_eq!(p2_keys.len(), 1);
        assert!(p1_keys.contains(&p2_keys[0]));
    }

    #[tokio::test]
    async fn selection_restricts_lifecycle_and_import() {
        let (mut manager, store) = mk_manager(vec![json!({"_id": "p1", "name": "ann"})]).await;
        manager.select(&["people".to_string()]).expect("select");

        let report = manager.run(DEFAULT_FETCH_LIMIT).await.expect("run");
        assert_eq!(report.mappings.len(), 1);
        let tables = store.table_names().await;
        assert!(tables.contains(&"people".to_string()));
        assert!(!tables.contains(&"person_tags".to_string()));
    }

    #[tokio::test]
    async fn selecting_an_unknown_mapping_is_fatal() {
        let (mut manager, _store) = mk_manager(vec![]).await;
        assert!(manager.select(&["nope".to_string()]).is_err());
    }

    const FK_YAML: &str = r#"
db: app
tables:
  - name: teams
    refresh: true
    sources:
      - columns:
          - { column: team_id, field: _id, type: string, primary_key: true, required: true }
  - name: members
    refresh: true
    sources:
      - columns:
          - { column: member_id, field: _id, type: string, primary_key: true, required: true }
          - { column: team_id, field: team, type: string, required: true }
    constraints:
      - foreign_key: { columns: [team_id], table: teams, references: [team_id] }
"#;

    #[tokio::test]
    async fn declared_foreign_keys_reject_dangling_rows() {
        let compiled = MappingConfig::from_yaml(FK_YAML)
            .expect("yaml")
            .compile()
            .expect("compile");
        let relational = mk_store();
        let docs = Arc::new(MemoryDocumentStore::new());
        docs.seed("teams", vec![doc(json!({"_id": "t1"}))]).await;
        docs.seed(
            "members",
            vec![
                doc(json!({"_id": "m1", "team": "t1"})),
                doc(json!({"_id": "m2", "team": "ghost"})),
            ],
        )
        .await;

        let manager = SchemaManager::new(
            compiled,
            relational.clone() as Arc<dyn RelationalStore>,
            docs as Arc<dyn DocumentStore>,
        );
        let report = manager.run(DEFAULT_FETCH_LIMIT).await.expect("run");

        // Registration order creates teams before members, so the member
        // rows find their referenced table in place.
        let members = &report.mappings[1];
        assert_eq!(members.inserted, 1);
        assert_eq!(members.rejected, 1);
        assert_eq!(members.rejects[0].reason, RejectReason::ForeignKey);

        // A rerun must drop members before teams; both come back clean.
        let rerun = manager.run(DEFAULT_FETCH_LIMIT).await.expect("rerun");
        assert_eq!(rerun.mappings[1].inserted, 1);
    }

    #[tokio::test]
    async fn rerun_of_a_refreshable_mapping_recreates_its_table() {
        let (manager, store) = mk_manager(vec![json!({"_id": "p1", "name": "ann"})]).await;

        manager.run(DEFAULT_FETCH_LIMIT).await.expect("first run");
        manager.run(DEFAULT_FETCH_LIMIT).await.expect("second run");

        // Drop/recreate keeps refreshable tables duplicate-free; dimension
        // keys survive both runs.
        assert_eq!(store.rows("people").await.len(), 1);
    }
}
