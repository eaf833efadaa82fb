//! Table schemas and sort specifications.
//!
//! A [`TableSchema`] declares a table's typed columns, its primary key, and
//! its unique indexes; the primary key always corresponds to a unique index.
//! A [`SortSpec`] is a non-empty `(column, direction)` sequence; all sorts
//! used by the pipeline are PK-complete so that ordering is total.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::LiteTrickleError;
use crate::hash;
use crate::row::Row;

/// Declared type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Boolean,
    Number,
    String,
    Null,
    Json,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Boolean => "boolean",
            ColumnType::Number => "number",
            ColumnType::String => "string",
            ColumnType::Null => "null",
            ColumnType::Json => "json",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, LiteTrickleError> {
        match s {
            "boolean" => Ok(ColumnType::Boolean),
            "number" => Ok(ColumnType::Number),
            "string" => Ok(ColumnType::String),
            "null" => Ok(ColumnType::Null),
            "json" => Ok(ColumnType::Json),
            other => Err(LiteTrickleError::InvalidArgument(format!(
                "unknown column type: {other}"
            ))),
        }
    }
}

/// A single typed column declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        ColumnSpec {
            name: name.into(),
            column_type,
        }
    }
}

/// A named table with typed columns, a primary key, and unique indexes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSpec>,
    /// Non-empty ordered list of column names uniquely identifying a row.
    pub primary_key: Vec<String>,
    /// Unique column sets. Always contains the primary key.
    pub unique_indexes: Vec<Vec<String>>,
}

impl TableSchema {
    /// Validate and construct a schema.
    ///
    /// The primary key must be non-empty and reference declared columns.
    /// If no declared unique index covers the primary key, one is added, so
    /// the PK ↔ unique-index correspondence always holds.
    pub fn new(
        name: impl Into<String>,
        columns: Vec<ColumnSpec>,
        primary_key: Vec<String>,
        mut unique_indexes: Vec<Vec<String>>,
    ) -> Result<Self, LiteTrickleError> {
        let name = name.into();
        if primary_key.is_empty() {
            return Err(LiteTrickleError::InvalidArgument(format!(
                "table {name}: primary key must be non-empty"
            )));
        }
        for pk_col in &primary_key {
            if !columns.iter().any(|c| &c.name == pk_col) {
                return Err(LiteTrickleError::UnknownColumn {
                    table: name,
                    column: pk_col.clone(),
                });
            }
        }
        for index in &unique_indexes {
            for col in index {
                if !columns.iter().any(|c| &c.name == col) {
                    return Err(LiteTrickleError::UnknownColumn {
                        table: name,
                        column: col.clone(),
                    });
                }
            }
        }
        if !unique_indexes
            .iter()
            .any(|idx| same_column_set(idx, &primary_key))
        {
            unique_indexes.push(primary_key.clone());
        }
        Ok(TableSchema {
            name,
            columns,
            primary_key,
            unique_indexes,
        })
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c.name == column)
    }

    pub fn column_type(&self, column: &str) -> Option<ColumnType> {
        self.columns
            .iter()
            .find(|c| c.name == column)
            .map(|c| c.column_type)
    }

    /// A unique index whose columns are all present in `available`, if any.
    /// Used for point reads by arbitrary unique-key subsets.
    pub fn unique_index_within(&self, available: &[String]) -> Option<&Vec<String>> {
        self.unique_indexes
            .iter()
            .find(|idx| idx.iter().all(|c| available.contains(c)))
    }

    /// Deterministic fingerprint of the normalised layout, used to verify a
    /// replica's on-disk shape matches the declared schema.
    pub fn fingerprint(&self) -> u64 {
        let mut parts: Vec<Option<String>> = vec![Some(self.name.clone())];
        for c in &self.columns {
            parts.push(Some(format!("c:{}:{}", c.name, c.column_type.as_str())));
        }
        parts.push(Some(format!("pk:{}", self.primary_key.join(","))));
        let mut indexes: Vec<String> = self
            .unique_indexes
            .iter()
            .map(|idx| {
                let mut sorted = idx.clone();
                sorted.sort();
                sorted.join(",")
            })
            .collect();
        indexes.sort();
        for idx in indexes {
            parts.push(Some(format!("uq:{idx}")));
        }
        hash::hash_parts(&parts)
    }

    /// Primary-key fingerprint of a row, for identity maps and dedup sets.
    pub fn row_key(&self, row: &Row) -> u64 {
        hash::row_key_hash(row, &self.primary_key)
    }

    /// Short display form of a row's primary key, for error messages.
    pub fn describe_key(&self, row: &Row) -> String {
        let parts: Vec<String> = self
            .primary_key
            .iter()
            .map(|c| format!("{c}={:?}", row.get_or_null(c)))
            .collect();
        parts.join(", ")
    }
}

fn same_column_set(a: &[String], b: &[String]) -> bool {
    a.len() == b.len() && a.iter().all(|c| b.contains(c))
}

// ── Sort specifications ────────────────────────────────────────────────────

/// Direction of one ordering key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    pub fn reversed(&self) -> Direction {
        match self {
            Direction::Asc => Direction::Desc,
            Direction::Desc => Direction::Asc,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Asc => "asc",
            Direction::Desc => "desc",
        }
    }
}

/// A non-empty `(column, direction)` sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub keys: Vec<(String, Direction)>,
}

impl SortSpec {
    pub fn new(keys: Vec<(String, Direction)>) -> Self {
        SortSpec { keys }
    }

    /// The completion of `declared` for `schema`: declared keys first, then
    /// any primary-key column not already present, ascending. The result is
    /// always PK-complete.
    pub fn complete(declared: &[(String, Direction)], schema: &TableSchema) -> SortSpec {
        let mut keys: Vec<(String, Direction)> = declared.to_vec();
        for pk_col in &schema.primary_key {
            if !keys.iter().any(|(c, _)| c == pk_col) {
                keys.push((pk_col.clone(), Direction::Asc));
            }
        }
        SortSpec { keys }
    }

    /// Whether the multiset of sort columns contains every PK column.
    pub fn is_pk_complete(&self, schema: &TableSchema) -> bool {
        schema
            .primary_key
            .iter()
            .all(|pk| self.keys.iter().any(|(c, _)| c == pk))
    }

    pub fn columns(&self) -> impl Iterator<Item = &String> {
        self.keys.iter().map(|(c, _)| c)
    }

    pub fn reversed(&self) -> SortSpec {
        SortSpec {
            keys: self
                .keys
                .iter()
                .map(|(c, d)| (c.clone(), d.reversed()))
                .collect(),
        }
    }

    /// Lexicographic comparison of two rows under this sort. Missing columns
    /// compare as NULL.
    pub fn compare(&self, a: &Row, b: &Row) -> Ordering {
        for (column, direction) in &self.keys {
            let av = a.get_or_null(column);
            let bv = b.get_or_null(column);
            let ord = av.cmp(&bv);
            let ord = match direction {
                Direction::Asc => ord,
                Direction::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}
