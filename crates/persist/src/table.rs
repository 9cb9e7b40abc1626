//! Data tables: the wire value passed between the engine and a store.
//!
//! A [DataTable] carries its column layout plus some rows.  It is used both as a payload (load/save) and as a
//! keep-set: in the clear operations the rows name the records that must survive.
//!
//! Rows are plain ordered value sequences; the layout travels with the table, so a store can always find a row's
//! primary key columns without consulting anything else.
use std::fmt;

use smallvec::SmallVec;

use crate::descriptor::{ColumnDescriptor, ColumnType, EntityDescriptor, SubTableDescriptor};
use crate::errors::{PersistError, Result};

/// A primary-key value.  Only integer and string columns are keyable.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Key {
    Integer(i64),
    Text(String),
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Key::Integer(i) => write!(f, "{}", i),
            Key::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for Key {
    fn from(v: i64) -> Key {
        Key::Integer(v)
    }
}

impl From<String> for Key {
    fn from(v: String) -> Key {
        Key::Text(v)
    }
}

impl From<&str> for Key {
    fn from(v: &str) -> Key {
        Key::Text(v.to_string())
    }
}

/// One cell of a row.
#[derive(Clone, Debug, PartialEq)]
pub enum ColumnValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Json(serde_json::Value),
}

impl ColumnValue {
    /// Whether this value can be stored in a column of the given type.  Null fits only nullable columns.
    pub fn fits(&self, column: &ColumnDescriptor) -> bool {
        match self {
            ColumnValue::Null => column.is_nullable(),
            ColumnValue::Integer(_) => column.get_column_type() == ColumnType::Integer,
            ColumnValue::Real(_) => column.get_column_type() == ColumnType::Real,
            ColumnValue::Text(_) => column.get_column_type() == ColumnType::Text,
            ColumnValue::Json(_) => column.get_column_type() == ColumnType::Json,
        }
    }

    /// The value a column takes when nothing better is known: null where allowed, the type's zero otherwise.
    pub fn default_for(column: &ColumnDescriptor) -> ColumnValue {
        if column.is_nullable() {
            return ColumnValue::Null;
        }
        match column.get_column_type() {
            ColumnType::Integer => ColumnValue::Integer(0),
            ColumnType::Real => ColumnValue::Real(0.0),
            ColumnType::Text => ColumnValue::Text(String::new()),
            ColumnType::Json => ColumnValue::Json(serde_json::Value::Null),
        }
    }

    pub fn as_key(&self) -> Option<Key> {
        match self {
            ColumnValue::Integer(i) => Some(Key::Integer(*i)),
            ColumnValue::Text(s) => Some(Key::Text(s.clone())),
            _ => None,
        }
    }
}

impl From<&Key> for ColumnValue {
    fn from(k: &Key) -> ColumnValue {
        match k {
            Key::Integer(i) => ColumnValue::Integer(*i),
            Key::Text(s) => ColumnValue::Text(s.clone()),
        }
    }
}

/// One row.  Values are ordered per the owning table's column layout.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Row {
    values: SmallVec<[ColumnValue; 8]>,
}

impl Row {
    pub fn new() -> Row {
        Default::default()
    }

    pub fn push(&mut self, value: ColumnValue) {
        self.values.push(value);
    }

    pub fn get(&self, index: usize) -> Option<&ColumnValue> {
        self.values.get(index)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ColumnValue> {
        self.values.iter()
    }
}

impl FromIterator<ColumnValue> for Row {
    fn from_iter<I: IntoIterator<Item = ColumnValue>>(iter: I) -> Row {
        Row {
            values: iter.into_iter().collect(),
        }
    }
}

/// An ordered sequence of rows plus the column layout they follow.
#[derive(Clone, Debug, PartialEq)]
pub struct DataTable {
    name: String,
    columns: Vec<ColumnDescriptor>,
    rows: Vec<Row>,
}

impl DataTable {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDescriptor>) -> DataTable {
        DataTable {
            name: name.into(),
            columns,
            rows: vec![],
        }
    }

    /// The main-table layout for an entity.
    pub fn for_entity(descriptor: &EntityDescriptor) -> DataTable {
        DataTable::new(descriptor.get_table_name(), descriptor.get_columns().to_vec())
    }

    /// The layout for one of an entity's list sub-tables.
    pub fn for_sub_table(sub: &SubTableDescriptor) -> DataTable {
        DataTable::new(sub.get_table_name(), sub.get_columns().to_vec())
    }

    /// A keep-set table carrying only the entity's primary key column, one row per key.
    pub fn keys_only(descriptor: &EntityDescriptor, keys: impl IntoIterator<Item = Key>) -> DataTable {
        let mut table = DataTable::new(
            descriptor.get_table_name(),
            vec![descriptor.primary_key().clone()],
        );
        for key in keys {
            table.rows.push(std::iter::once(ColumnValue::from(&key)).collect());
        }
        table
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    pub fn get_columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    pub fn get_rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn push_row(&mut self, row: Row) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(PersistError::backend(
                "push_row",
                format!(
                    "{}: row has {} values for {} columns",
                    self.name,
                    row.len(),
                    self.columns.len()
                ),
            ));
        }
        self.rows.push(row);
        Ok(())
    }

    /// The *primary id* of a row: the value of the first primary-key column.  For sub-tables this is the parent's
    /// key, which is what [crate::DataStore::clear_ids] matches on.
    pub fn primary_id(&self, row: &Row) -> Result<Key> {
        row_primary_id(&self.columns, row, &self.name)
    }

    /// The full composite key of a row, one entry per primary-key column in layout order.
    pub fn composite_key(&self, row: &Row) -> Result<Vec<Key>> {
        row_composite_key(&self.columns, row, &self.name)
    }
}

pub(crate) fn row_primary_id(columns: &[ColumnDescriptor], row: &Row, table: &str) -> Result<Key> {
    let index = columns
        .iter()
        .position(|c| c.is_primary_key())
        .ok_or_else(|| PersistError::backend("key", format!("{}: no primary key column", table)))?;
    keyed_value(row, index, table)
}

pub(crate) fn row_composite_key(
    columns: &[ColumnDescriptor],
    row: &Row,
    table: &str,
) -> Result<Vec<Key>> {
    let mut key = vec![];
    for (i, c) in columns.iter().enumerate() {
        if c.is_primary_key() {
            key.push(keyed_value(row, i, table)?);
        }
    }
    if key.is_empty() {
        return Err(PersistError::backend(
            "key",
            format!("{}: no primary key column", table),
        ));
    }
    Ok(key)
}

fn keyed_value(row: &Row, index: usize, table: &str) -> Result<Key> {
    row.get(index)
        .and_then(|v| v.as_key())
        .ok_or_else(|| {
            PersistError::backend("key", format!("{}: row has no usable key value", table))
        })
}
