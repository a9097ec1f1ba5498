//! Mapping model and pure extraction primitives for Decant.
//!
//! Everything here is I/O-free: the declarative mapping configuration, the
//! compiled table/extractor model, and the document-side half of extraction.
//! Store access and row assembly live in `decant-storage` and
//! `decant-import`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const CRATE_NAME: &str = "decant-core";

/// One document as fetched from the document store.
pub type Document = Map<String, Value>;

/// One candidate relational row: destination column name to value.
pub type Row = BTreeMap<String, Value>;

/// Equality filter applied by the document store before projection.
pub type DocumentFilter = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    /// Store-generated surrogate key. Internal to dimension tables, not
    /// accepted from configuration.
    Serial,
    BigInt,
    Integer,
    Float,
    Text,
    Boolean,
    Timestamp,
}

impl ColumnType {
    /// Closed mapping from configuration type names. Configuration text is
    /// data, never code.
    pub fn from_config_name(name: &str) -> Option<Self> {
        match name {
            "string" | "text" => Some(Self::Text),
            "int" | "integer" => Some(Self::Integer),
            "bigint" => Some(Self::BigInt),
            "float" | "double" => Some(Self::Float),
            "bool" | "boolean" => Some(Self::Boolean),
            "timestamp" | "datetime" => Some(Self::Timestamp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub column_type: ColumnType,
    pub primary_key: bool,
    pub unique: bool,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TableConstraint {
    Unique {
        columns: Vec<String>,
    },
    ForeignKey {
        columns: Vec<String>,
        table: String,
        references: Vec<String>,
    },
}

/// Declared shape of one destination table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnSpec>,
    pub constraints: Vec<TableConstraint>,
}

impl TableDef {
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Tables this one references through foreign keys.
    pub fn referenced_tables(&self) -> impl Iterator<Item = &str> {
        self.constraints.iter().filter_map(|c| match c {
            TableConstraint::ForeignKey { table, .. } => Some(table.as_str()),
            TableConstraint::Unique { .. } => None,
        })
    }
}

/// Shape of a converter's dimension table: a store-generated surrogate key
/// plus the unique looked-up value.
pub fn dimension_table(name: &str, value_type: ColumnType) -> TableDef {
    TableDef {
        name: name.to_string(),
        columns: vec![
            ColumnSpec {
                name: "key".to_string(),
                column_type: ColumnType::Serial,
                primary_key: true,
                unique: false,
                nullable: false,
            },
            ColumnSpec {
                name: "value".to_string(),
                column_type: value_type,
                primary_key: false,
                unique: true,
                nullable: false,
            },
        ],
        constraints: Vec::new(),
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ExtractError {
    #[error("required field `{field}` is missing")]
    MissingField { field: String },
}

/// Read a dot-separated field path from a document. Absent segments and
/// non-object intermediates read as `None`.
pub fn read_path<'a>(document: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = document.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Extraction behavior, fixed at construction.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractMode {
    /// Direct read of a document field path.
    Field { path: String },
    /// Precomputed constant; the document is ignored.
    Literal { value: Value },
    /// Direct read, then substitution through the named lookup converter.
    Lookup { path: String, converter: String },
}

/// Pulls one value out of a document for one destination column.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueExtractor {
    pub column: String,
    pub mode: ExtractMode,
    pub required: bool,
}

impl ValueExtractor {
    pub fn field(column: impl Into<String>, path: impl Into<String>, required: bool) -> Self {
        Self {
            column: column.into(),
            mode: ExtractMode::Field { path: path.into() },
            required,
        }
    }

    pub fn literal(column: impl Into<String>, value: Value) -> Self {
        Self {
            column: column.into(),
            mode: ExtractMode::Literal { value },
            required: false,
        }
    }

    pub fn lookup(
        column: impl Into<String>,
        path: impl Into<String>,
        converter: impl Into<String>,
        required: bool,
    ) -> Self {
        Self {
            column: column.into(),
            mode: ExtractMode::Lookup {
                path: path.into(),
                converter: converter.into(),
            },
            required,
        }
    }

    /// Document-side step of extraction. For `Lookup` this returns the raw
    /// value; key substitution happens during row assembly. An explicit JSON
    /// null reads the same as an absent field.
    pub fn read(&self, document: &Document) -> Result<Value, ExtractError> {
        match &self.mode {
            ExtractMode::Literal { value } => Ok(value.clone()),
            ExtractMode::Field { path } | ExtractMode::Lookup { path, .. } => {
                match read_path(document, path) {
                    Some(value) if !value.is_null() => Ok(value.clone()),
                    _ if self.required => Err(ExtractError::MissingField { field: path.clone() }),
                    _ => Ok(Value::Null),
                }
            }
        }
    }

    /// The document field this extractor reads, if any.
    pub fn source_path(&self) -> Option<&str> {
        match &self.mode {
            ExtractMode::Field { path } | ExtractMode::Lookup { path, .. } => Some(path),
            ExtractMode::Literal { .. } => None,
        }
    }

    pub fn converter(&self) -> Option<&str> {
        match &self.mode {
            ExtractMode::Lookup { converter, .. } => Some(converter),
            _ => None,
        }
    }
}

/// Pulls the fan-out value set out of a document: one destination row per
/// surviving value.
#[derive(Debug, Clone)]
pub struct LinkingExtractor {
    pub column: String,
    pub path: String,
    pub required: bool,
    pub pattern: Option<Regex>,
    pub converter: Option<String>,
}

impl LinkingExtractor {
    /// Deduplicated raw linking values for one document. A missing optional
    /// field and an empty array both read as an empty set; a scalar reads as
    /// a singleton. A configured pattern only ever retains string values.
    pub fn read_values(&self, document: &Document) -> Result<Vec<Value>, ExtractError> {
        let raw = match read_path(document, &self.path) {
            Some(value) if !value.is_null() => value,
            _ if self.required => {
                return Err(ExtractError::MissingField {
                    field: self.path.clone(),
                })
            }
            _ => return Ok(Vec::new()),
        };

        let items: Vec<Value> = match raw {
            Value::Array(items) => items.clone(),
            other => vec![other.clone()],
        };

        let mut seen: BTreeMap<String, Value> = BTreeMap::new();
        for item in items {
            if item.is_null() {
                continue;
            }
            if let Some(pattern) = &self.pattern {
                match item.as_str() {
                    Some(s) if pattern.is_match(s) => {}
                    _ => continue,
                }
            }
            seen.entry(item.to_string()).or_insert(item);
        }
        Ok(seen.into_values().collect())
    }
}

/// One collection feeding a destination table.
#[derive(Debug, Clone)]
pub struct SourceDef {
    pub collection: String,
    pub filter: DocumentFilter,
    pub extractors: Vec<ValueExtractor>,
    pub linking: Option<LinkingExtractor>,
}

impl SourceDef {
    /// Minimal set of document fields this source needs: the union of all
    /// extractor source paths. Filters are pushed to the store separately
    /// and never widen the projection.
    pub fn projection(&self) -> Vec<String> {
        let mut fields: BTreeSet<String> = self
            .extractors
            .iter()
            .filter_map(|e| e.source_path().map(str::to_string))
            .collect();
        if let Some(linking) = &self.linking {
            fields.insert(linking.path.clone());
        }
        fields.into_iter().collect()
    }
}

/// One destination table, its refresh policy, and the sources feeding it.
#[derive(Debug, Clone)]
pub struct CompiledMapping {
    pub table: TableDef,
    pub sources: Vec<SourceDef>,
    pub refresh: bool,
}

impl CompiledMapping {
    /// A mapping is addressed by its destination table's name.
    pub fn name(&self) -> &str {
        &self.table.name
    }
}

#[derive(Debug, Clone)]
pub struct CompiledConfig {
    pub db: String,
    pub converters: BTreeMap<String, ColumnType>,
    pub mappings: Vec<CompiledMapping>,
}

// --- declarative mapping file ---------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct MappingConfig {
    pub db: String,
    #[serde(default)]
    pub converters: BTreeMap<String, ConverterSpec>,
    #[serde(default)]
    pub tables: Vec<TableSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConverterSpec {
    #[serde(rename = "type")]
    pub value_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableSpec {
    pub name: String,
    #[serde(default)]
    pub refresh: bool,
    pub sources: Vec<SourceSpec>,
    #[serde(default, with = "serde_yaml::with::singleton_map_recursive")]
    pub constraints: Vec<ConstraintEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceSpec {
    /// Source collection; defaults to the destination table's name.
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub filter: DocumentFilter,
    pub columns: Vec<ColumnEntry>,
    #[serde(default)]
    pub linking: Option<LinkingEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ColumnEntry {
    pub column: String,
    #[serde(default)]
    pub field: Option<String>,
    #[serde(rename = "type", default)]
    pub column_type: Option<String>,
    #[serde(default)]
    pub literal: Option<Value>,
    #[serde(default)]
    pub convert: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub unique: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinkingEntry {
    pub column: String,
    pub field: String,
    #[serde(rename = "type", default)]
    pub column_type: Option<String>,
    #[serde(default)]
    pub convert: Option<String>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintEntry {
    Unique(Vec<String>),
    ForeignKey {
        columns: Vec<String>,
        table: String,
        references: Vec<String>,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing mapping file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("converter `{name}`: unknown value type `{value_type}`")]
    ConverterType { name: String, value_type: String },
    #[error("invalid identifier `{0}`")]
    Identifier(String),
    #[error("duplicate table `{0}`")]
    DuplicateTable(String),
    #[error("table `{table}`: {message}")]
    Table { table: String, message: String },
}

fn valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn check_identifier(name: &str) -> Result<(), ConfigError> {
    if valid_identifier(name) {
        Ok(())
    } else {
        Err(ConfigError::Identifier(name.to_string()))
    }
}

fn table_error(table: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::Table {
        table: table.to_string(),
        message: message.into(),
    }
}

impl MappingConfig {
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    /// Validate the declarative form and build the runtime mapping model.
    pub fn compile(&self) -> Result<CompiledConfig, ConfigError> {
        let mut converters = BTreeMap::new();
        for (name, spec) in &self.converters {
            check_identifier(name)?;
            let value_type = ColumnType::from_config_name(&spec.value_type).ok_or_else(|| {
                ConfigError::ConverterType {
                    name: name.clone(),
                    value_type: spec.value_type.clone(),
                }
            })?;
            converters.insert(name.clone(), value_type);
        }

        let mut mappings = Vec::new();
        let mut seen_tables = BTreeSet::new();
        for table in &self.tables {
            check_identifier(&table.name)?;
            if converters.contains_key(&table.name) {
                return Err(ConfigError::DuplicateTable(table.name.clone()));
            }
            if !seen_tables.insert(table.name.clone()) {
                return Err(ConfigError::DuplicateTable(table.name.clone()));
            }
            mappings.push(compile_table(table, &converters)?);
        }

        Ok(CompiledConfig {
            db: self.db.clone(),
            converters,
            mappings,
        })
    }
}

fn compile_table(
    spec: &TableSpec,
    converters: &BTreeMap<String, ColumnType>,
) -> Result<CompiledMapping, ConfigError> {
    if spec.sources.is_empty() {
        return Err(table_error(&spec.name, "no sources declared"));
    }

    let mut sources = Vec::new();
    for source in &spec.sources {
        sources.push(compile_source(&spec.name, source, converters)?);
    }

    // The first source fixes the destination column list; the rest must
    // target the same columns.
    let mut columns = Vec::new();
    let mut auto_constraints = Vec::new();
    let first = &spec.sources[0];
    if let Some(linking) = &first.linking {
        columns.push(linking_column(&spec.name, linking, converters)?);
        if let Some(converter) = &linking.convert {
            auto_constraints.push(dimension_fk(&linking.column, converter));
        }
    }
    for entry in &first.columns {
        columns.push(destination_column(&spec.name, entry, converters)?);
        if let Some(converter) = &entry.convert {
            auto_constraints.push(dimension_fk(&entry.column, converter));
        }
    }

    let declared: BTreeSet<&str> = columns.iter().map(|c| c.name.as_str()).collect();
    if declared.len() != columns.len() {
        return Err(table_error(&spec.name, "duplicate destination column"));
    }
    for source in &sources[1..] {
        let mut names: BTreeSet<&str> = source
            .extractors
            .iter()
            .map(|e| e.column.as_str())
            .collect();
        if let Some(linking) = &source.linking {
            names.insert(linking.column.as_str());
        }
        if names != declared {
            return Err(table_error(
                &spec.name,
                format!(
                    "source `{}` does not target the same destination columns as the first source",
                    source.collection
                ),
            ));
        }
    }

    let mut constraints = auto_constraints;
    for entry in &spec.constraints {
        constraints.push(declared_constraint(&spec.name, entry, &declared)?);
    }

    Ok(CompiledMapping {
        table: TableDef {
            name: spec.name.clone(),
            columns,
            constraints,
        },
        sources,
        refresh: spec.refresh,
    })
}

fn compile_source(
    table: &str,
    spec: &SourceSpec,
    converters: &BTreeMap<String, ColumnType>,
) -> Result<SourceDef, ConfigError> {
    if spec.columns.is_empty() {
        return Err(table_error(table, "source declares no columns"));
    }

    let mut extractors = Vec::new();
    for entry in &spec.columns {
        check_identifier(&entry.column)?;
        extractors.push(column_extractor(table, entry, converters)?);
    }

    let linking = match &spec.linking {
        Some(entry) => {
            check_identifier(&entry.column)?;
            if let Some(converter) = &entry.convert {
                if !converters.contains_key(converter) {
                    return Err(table_error(
                        table,
                        format!("linking column `{}` names unknown converter `{converter}`", entry.column),
                    ));
                }
            }
            let pattern = entry
                .pattern
                .as_deref()
                .map(Regex::new)
                .transpose()
                .map_err(|err| {
                    table_error(table, format!("invalid linking pattern: {err}"))
                })?;
            Some(LinkingExtractor {
                column: entry.column.clone(),
                path: entry.field.clone(),
                required: entry.required,
                pattern,
                converter: entry.convert.clone(),
            })
        }
        None => None,
    };

    Ok(SourceDef {
        collection: spec.collection.clone().unwrap_or_else(|| table.to_string()),
        filter: spec.filter.clone(),
        extractors,
        linking,
    })
}

fn column_extractor(
    table: &str,
    entry: &ColumnEntry,
    converters: &BTreeMap<String, ColumnType>,
) -> Result<ValueExtractor, ConfigError> {
    match (&entry.field, &entry.literal, &entry.convert) {
        (Some(_), Some(_), _) => Err(table_error(
            table,
            format!("column `{}` sets both `field` and `literal`", entry.column),
        )),
        (_, Some(_), Some(_)) => Err(table_error(
            table,
            format!("column `{}` sets both `literal` and `convert`", entry.column),
        )),
        (None, None, _) => Err(table_error(
            table,
            format!("column `{}` sets neither `field` nor `literal`", entry.column),
        )),
        (None, Some(_), None) if entry.required => Err(table_error(
            table,
            format!("literal column `{}` cannot be required", entry.column),
        )),
        (None, Some(value), None) => Ok(ValueExtractor::literal(&entry.column, value.clone())),
        (Some(path), None, Some(converter)) => {
            if !converters.contains_key(converter) {
                return Err(table_error(
                    table,
                    format!("column `{}` names unknown converter `{converter}`", entry.column),
                ));
            }
            Ok(ValueExtractor::lookup(
                &entry.column,
                path,
                converter,
                entry.required,
            ))
        }
        (Some(path), None, None) => Ok(ValueExtractor::field(&entry.column, path, entry.required)),
    }
}

fn destination_column(
    table: &str,
    entry: &ColumnEntry,
    converters: &BTreeMap<String, ColumnType>,
) -> Result<ColumnSpec, ConfigError> {
    let column_type = column_entry_type(
        table,
        &entry.column,
        entry.column_type.as_deref(),
        entry.convert.as_deref(),
        converters,
    )?;
    Ok(ColumnSpec {
        name: entry.column.clone(),
        column_type,
        primary_key: entry.primary_key,
        unique: entry.unique,
        nullable: !entry.primary_key && !entry.required,
    })
}

fn linking_column(
    table: &str,
    entry: &LinkingEntry,
    converters: &BTreeMap<String, ColumnType>,
) -> Result<ColumnSpec, ConfigError> {
    let column_type = column_entry_type(
        table,
        &entry.column,
        entry.column_type.as_deref(),
        entry.convert.as_deref(),
        converters,
    )?;
    Ok(ColumnSpec {
        name: entry.column.clone(),
        column_type,
        primary_key: false,
        unique: false,
        nullable: !entry.required,
    })
}

/// Converted columns hold surrogate keys and are always `BigInt`; everything
/// else must name a type from the closed mapping.
fn column_entry_type(
    table: &str,
    column: &str,
    declared: Option<&str>,
    convert: Option<&str>,
    converters: &BTreeMap<String, ColumnType>,
) -> Result<ColumnType, ConfigError> {
    match (declared, convert) {
        (Some(_), Some(_)) => Err(table_error(
            table,
            format!("column `{column}` sets `type` alongside `convert`"),
        )),
        (None, Some(converter)) => {
            if !converters.contains_key(converter) {
                return Err(table_error(
                    table,
                    format!("column `{column}` names unknown converter `{converter}`"),
                ));
            }
            Ok(ColumnType::BigInt)
        }
        (Some(name), None) => ColumnType::from_config_name(name).ok_or_else(|| {
            table_error(table, format!("column `{column}` has unknown type `{name}`"))
        }),
        (None, None) => Err(table_error(
            table,
            format!("column `{column}` declares no type"),
        )),
    }
}

fn dimension_fk(column: &str, converter: &str) -> TableConstraint {
    TableConstraint::ForeignKey {
        columns: vec![column.to_string()],
        table: converter.to_string(),
        references: vec!["key".to_string()],
    }
}

fn declared_constraint(
    table: &str,
    entry: &ConstraintEntry,
    declared: &BTreeSet<&str>,
) -> Result<TableConstraint, ConfigError> {
    let check_columns = |columns: &[String]| -> Result<(), ConfigError> {
        for column in columns {
            if !declared.contains(column.as_str()) {
                return Err(table_error(
                    table,
                    format!("constraint names unknown column `{column}`"),
                ));
            }
        }
        Ok(())
    };
    match entry {
        ConstraintEntry::Unique(columns) => {
            check_columns(columns)?;
            Ok(TableConstraint::Unique {
                columns: columns.clone(),
            })
        }
        ConstraintEntry::ForeignKey {
            columns,
            table: target,
            references,
        } => {
            check_columns(columns)?;
            check_identifier(target)?;
            if columns.len() != references.len() {
                return Err(table_error(
                    table,
                    "foreign key column and reference counts differ",
                ));
            }
            Ok(TableConstraint::ForeignKey {
                columns: columns.clone(),
                table: target.clone(),
                references: references.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().expect("object").clone()
    }

    #[test]
    fn config_type_names_are_a_closed_mapping() {
        assert_eq!(ColumnType::from_config_name("string"), Some(ColumnType::Text));
        assert_eq!(ColumnType::from_config_name("text"), Some(ColumnType::Text));
        assert_eq!(ColumnType::from_config_name("int"), Some(ColumnType::Integer));
        assert_eq!(ColumnType::from_config_name("bigint"), Some(ColumnType::BigInt));
        assert_eq!(ColumnType::from_config_name("double"), Some(ColumnType::Float));
        assert_eq!(ColumnType::from_config_name("datetime"), Some(ColumnType::Timestamp));
        assert_eq!(ColumnType::from_config_name("Integer()"), None);
        assert_eq!(ColumnType::from_config_name("serial"), None);
    }

    #[test]
    fn read_path_descends_dotted_segments() {
        let d = doc(json!({"a": {"b": {"c": 7}}, "x": 1}));
        assert_eq!(read_path(&d, "a.b.c"), Some(&json!(7)));
        assert_eq!(read_path(&d, "x"), Some(&json!(1)));
        assert_eq!(read_path(&d, "a.b.missing"), None);
        assert_eq!(read_path(&d, "x.b"), None);
    }

    #[test]
    fn optional_missing_field_reads_null() {
        let extractor = ValueExtractor::field("name", "name", false);
        let value = extractor.read(&doc(json!({"other": 1}))).unwrap();
        assert_eq!(value, Value::Null);
    }

    #[test]
    fn required_missing_field_is_an_error() {
        let extractor = ValueExtractor::field("name", "name", true);
        let err = extractor.read(&doc(json!({"other": 1}))).unwrap_err();
        assert_eq!(err, ExtractError::MissingField { field: "name".into() });
    }

    #[test]
    fn explicit_null_reads_like_absent() {
        let extractor = ValueExtractor::field("name", "name", true);
        assert!(extractor.read(&doc(json!({"name": null}))).is_err());
    }

    #[test]
    fn literal_ignores_the_document() {
        let extractor = ValueExtractor::literal("origin", json!("dump"));
        assert_eq!(extractor.read(&doc(json!({}))).unwrap(), json!("dump"));
        assert_eq!(extractor.source_path(), None);
    }

    #[test]
    fn linking_values_deduplicate_per_document() {
        let linking = LinkingExtractor {
            column: "tag".into(),
            path: "tags".into(),
            required: false,
            pattern: None,
            converter: None,
        };
        let values = linking
            .read_values(&doc(json!({"tags": ["a", "a", "b"]})))
            .unwrap();
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn linking_pattern_retains_matching_strings_only() {
        let linking = LinkingExtractor {
            column: "tag".into(),
            path: "tags".into(),
            required: false,
            pattern: Some(Regex::new("^a").unwrap()),
            converter: None,
        };
        let values = linking
            .read_values(&doc(json!({"tags": ["a1", "b1", "a2", 7]})))
            .unwrap();
        assert_eq!(values, vec![json!("a1"), json!("a2")]);
    }

    #[test]
    fn linking_missing_optional_field_is_an_empty_set() {
        let linking = LinkingExtractor {
            column: "tag".into(),
            path: "tags".into(),
            required: false,
            pattern: None,
            converter: None,
        };
        assert!(linking.read_values(&doc(json!({}))).unwrap().is_empty());
    }

    const MAPPING_YAML: &str = r#"
db: app
converters:
  plans: { type: string }
  tags: { type: string }
tables:
  - name: users
    refresh: true
    sources:
      - collection: user_profiles
        filter: { active: true }
        columns:
          - { column: user_id, field: _id, type: string, primary_key: true, required: true }
          - { column: name, field: name, type: string, required: true }
          - { column: origin, type: string, literal: dump }
          - { column: plan_key, field: plan, convert: plans }
        linking:
          { column: tag_key, field: tags, convert: tags, pattern: "^[a-z]" }
    constraints:
      - unique: [user_id, tag_key]
"#;

    #[test]
    fn compile_builds_the_destination_table() {
        let config = MappingConfig::from_yaml(MAPPING_YAML).unwrap();
        let compiled = config.compile().unwrap();

        assert_eq!(compiled.db, "app");
        assert_eq!(compiled.converters.get("plans"), Some(&ColumnType::Text));
        assert_eq!(compiled.mappings.len(), 1);

        let mapping = &compiled.mappings[0];
        assert_eq!(mapping.name(), "users");
        assert!(mapping.refresh);

        // Linking column leads, then declared order.
        let names: Vec<&str> = mapping.table.column_names().collect();
        assert_eq!(names, vec!["tag_key", "user_id", "name", "origin", "plan_key"]);

        let plan_key = mapping.table.column("plan_key").unwrap();
        assert_eq!(plan_key.column_type, ColumnType::BigInt);

        let user_id = mapping.table.column("user_id").unwrap();
        assert!(user_id.primary_key);
        assert!(!user_id.nullable);

        // Converted columns gain a dimension foreign key automatically.
        let referenced: Vec<&str> = mapping.table.referenced_tables().collect();
        assert_eq!(referenced, vec!["tags", "plans"]);
    }

    #[test]
    fn compile_derives_the_projection_from_extractors() {
        let config = MappingConfig::from_yaml(MAPPING_YAML).unwrap();
        let compiled = config.compile().unwrap();
        let source = &compiled.mappings[0].sources[0];

        assert_eq!(source.collection, "user_profiles");
        assert_eq!(source.projection(), vec!["_id", "name", "plan", "tags"]);
    }

    #[test]
    fn compile_rejects_field_and_literal_together() {
        let yaml = r#"
db: app
tables:
  - name: t
    sources:
      - columns:
          - { column: a, field: a, literal: x, type: string }
"#;
        let err = MappingConfig::from_yaml(yaml).unwrap().compile().unwrap_err();
        assert!(err.to_string().contains("both `field` and `literal`"));
    }

    #[test]
    fn compile_rejects_unknown_converters_and_types() {
        let unknown_converter = r#"
db: app
tables:
  - name: t
    sources:
      - columns:
          - { column: a, field: a, convert: nope }
"#;
        assert!(MappingConfig::from_yaml(unknown_converter)
            .unwrap()
            .compile()
            .is_err());

        let unknown_type = r#"
db: app
tables:
  - name: t
    sources:
      - columns:
          - { column: a, field: a, type: Integer() }
"#;
        assert!(MappingConfig::from_yaml(unknown_type)
            .unwrap()
            .compile()
            .is_err());
    }

    #[test]
    fn compile_rejects_invalid_identifiers() {
        let yaml = r#"
db: app
tables:
  - name: "t; drop"
    sources:
      - columns:
          - { column: a, field: a, type: string }
"#;
        let err = MappingConfig::from_yaml(yaml).unwrap().compile().unwrap_err();
        assert!(matches!(err, ConfigError::Identifier(_)));
    }

    #[test]
    fn compile_rejects_sources_with_mismatched_columns() {
        let yaml = r#"
db: app
tables:
  - name: t
    sources:
      - collection: one
        columns:
          - { column: a, field: a, type: string }
      - collection: two
        columns:
          - { column: b, field: b, type: string }
"#;
        let err = MappingConfig::from_yaml(yaml).unwrap().compile().unwrap_err();
        assert!(err.to_string().contains("same destination columns"));
    }

    #[test]
    fn dimension_tables_pair_a_serial_key_with_a_unique_value() {
        let table = dimension_table("tags", ColumnType::Text);
        assert_eq!(table.columns[0].column_type, ColumnType::Serial);
        assert!(table.columns[0].primary_key);
        assert!(table.columns[1].unique);
        assert!(!table.columns[1].nullable);
    }
}
