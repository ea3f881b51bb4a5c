use crate::error::{DocketError, Result};
use crate::value::{Row, Value};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Number};

pub const ID_COLUMN: &str = "Id";
pub const DOCUMENT_ID_COLUMN: &str = "DocumentId";
pub const TYPE_COLUMN: &str = "Type";
pub const CONTENT_COLUMN: &str = "Content";
pub const VERSION_COLUMN: &str = "Version";

/// A plain object persisted as an opaque document.
///
/// An id of `0` means the entity has not been assigned an identity yet; the
/// session asks the id generator for one on first save.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Value stored in the document `Type` column.
    const TYPE: &'static str;

    fn id(&self) -> i64;

    fn set_id(&mut self, id: i64);
}

/// A derived, queryable row. Field names of the serialized form are the
/// column names listed in `COLUMNS`.
pub trait Index: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Logical table name, before collection and prefix qualification.
    const NAME: &'static str;
    const COLUMNS: &'static [Column];

    fn column(name: &str) -> Option<&'static Column> {
        Self::COLUMNS.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnKind {
    Integer,
    Real,
    Text,
    Boolean,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnKind,
    pub nullable: bool,
}

impl Column {
    pub const fn new(name: &'static str, kind: ColumnKind) -> Self {
        Self {
            name,
            kind,
            nullable: false,
        }
    }

    pub const fn integer(name: &'static str) -> Self {
        Self::new(name, ColumnKind::Integer)
    }

    pub const fn real(name: &'static str) -> Self {
        Self::new(name, ColumnKind::Real)
    }

    pub const fn text(name: &'static str) -> Self {
        Self::new(name, ColumnKind::Text)
    }

    pub const fn boolean(name: &'static str) -> Self {
        Self::new(name, ColumnKind::Boolean)
    }

    pub const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// Whether an index type is a 1:1 shadow of its document or an aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexKind {
    Map,
    Reduce,
}

/// The persisted document row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub id: i64,
    pub document_type: String,
    pub content: String,
    pub version: i64,
}

impl Document {
    pub fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_i64(ID_COLUMN)?,
            document_type: row.get_text(TYPE_COLUMN)?,
            content: row.get_text(CONTENT_COLUMN)?,
            version: row.get_i64(VERSION_COLUMN)?,
        })
    }
}

/// Physical table names for one collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableNames {
    prefix: String,
    collection: String,
}

impl TableNames {
    pub fn new(prefix: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            collection: collection.into(),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    fn qualify(&self, name: &str) -> String {
        if self.collection.is_empty() {
            format!("{}{name}", self.prefix)
        } else {
            format!("{}{}_{name}", self.prefix, self.collection)
        }
    }

    pub fn document(&self) -> String {
        self.qualify("Document")
    }

    pub fn index(&self, name: &str) -> String {
        self.qualify(name)
    }

    /// Association table linking reduce rows to their documents.
    pub fn bridge(&self, name: &str) -> String {
        self.qualify(&format!("{name}_Document"))
    }

    /// Column of the bridge table that references the reduce row.
    pub fn bridge_column(name: &str) -> String {
        format!("{name}Id")
    }
}

/// Extract the column values of an index row, in `COLUMNS` order.
pub fn index_values<I: Index>(row: &I) -> Result<Vec<(&'static str, Value)>> {
    let json = serde_json::to_value(row)?;
    let Some(obj) = json.as_object() else {
        return Err(DocketError::Validation(format!(
            "index '{}' must serialize to an object",
            I::NAME
        )));
    };
    I::COLUMNS
        .iter()
        .map(|col| Ok((col.name, json_to_value(obj.get(col.name), col)?)))
        .collect()
}

/// Rebuild an index row from a result row.
pub fn decode_index<I: Index>(row: &Row) -> Result<I> {
    let mut obj = Map::new();
    for col in I::COLUMNS {
        let value = row.get(col.name).cloned().unwrap_or_default();
        obj.insert(col.name.to_string(), value_to_json(&value, col.kind));
    }
    Ok(serde_json::from_value(serde_json::Value::Object(obj))?)
}

pub(crate) fn json_to_value(json: Option<&serde_json::Value>, col: &Column) -> Result<Value> {
    use serde_json::Value as Json;
    let Some(json) = json else {
        return Ok(Value::Null);
    };
    let mismatch = || {
        DocketError::Validation(format!(
            "column '{}' expects {:?}, got {json}",
            col.name, col.kind
        ))
    };
    match (col.kind, json) {
        (_, Json::Null) => Ok(Value::Null),
        (ColumnKind::Integer, Json::Number(n)) => n.as_i64().map(Value::Int).ok_or_else(mismatch),
        (ColumnKind::Real, Json::Number(n)) => n.as_f64().map(Value::Float).ok_or_else(mismatch),
        (ColumnKind::Boolean, Json::Bool(b)) => Ok(Value::Bool(*b)),
        (ColumnKind::Text, Json::String(s)) => Ok(Value::Text(s.clone())),
        _ => Err(mismatch()),
    }
}

pub(crate) fn value_to_json(value: &Value, kind: ColumnKind) -> serde_json::Value {
    use serde_json::Value as Json;
    match (kind, value) {
        (_, Value::Null) => Json::Null,
        (ColumnKind::Boolean, v) => v.as_bool().map(Json::Bool).unwrap_or(Json::Null),
        (ColumnKind::Real, v) => v
            .as_f64()
            .and_then(Number::from_f64)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        (ColumnKind::Integer, v) => v.as_i64().map(Json::from).unwrap_or(Json::Null),
        (ColumnKind::Text, v) => Json::String(v.to_text()),
    }
}
