//! Entity descriptors.
//!
//! An [EntityDescriptor] is the static metadata mapping a type onto tabular storage: the schema it lives in, its
//! table, an ordered column list, which column is the primary key, and one sub-table per list-valued field.  It is
//! built once per type through an [EntityBuilder] and then never changes; the engine keeps it alongside the type in
//! the registry instead of re-deriving it per call.
//!
//! A column may be a 64-bit signed integer, an IEEE double, a string, or a value serialized to JSON.  The primary
//! key must be an integer or string column: JSON is not deterministic enough to key on, and doubles have the same
//! problem.
use lazy_static::lazy_static;
use regex::Regex;

use crate::errors::{PersistError, Result};

lazy_static! {
    static ref IDENT: Regex = Regex::new("^[a-z][a-z0-9_]*$").expect("static pattern");
}

/// Table names the engine reserves for its own bookkeeping.
const RESERVED_TABLES: &[&str] = &["versions"];

/// Column names a sub-table adds next to the parent's key.
const SUB_TABLE_COLUMNS: &[&str] = &["ord", "value"];

fn check_ident(what: &str, name: &str) -> Result<()> {
    if !IDENT.is_match(name) {
        return Err(PersistError::invalid(
            name,
            format!("{} must match [a-z][a-z0-9_]*", what),
        ));
    }
    Ok(())
}

/// Types of a row's columns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnType {
    /// A 64-bit signed integer.
    Integer,
    /// An IEEE 754 double.
    Real,
    /// A string.
    Text,
    /// A value which is serialized to JSON.
    Json,
}

impl ColumnType {
    /// Whether a column of this type may serve as (part of) a primary key.
    pub fn is_keyable(self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::Text)
    }
}

/// A column in a table.
#[derive(Clone, Debug, PartialEq)]
pub struct ColumnDescriptor {
    name: String,
    column_type: ColumnType,
    primary_key: bool,
    nullable: bool,
}

impl ColumnDescriptor {
    pub fn new(
        name: impl Into<String>,
        column_type: ColumnType,
        primary_key: bool,
        nullable: bool,
    ) -> Result<ColumnDescriptor> {
        let name = name.into();
        check_ident("column names", &name)?;

        if primary_key && nullable {
            return Err(PersistError::invalid(
                &name,
                "primary key columns may not be nullable",
            ));
        }
        if primary_key && !column_type.is_keyable() {
            return Err(PersistError::invalid(
                &name,
                "primary key columns must be integers or strings",
            ));
        }

        Ok(ColumnDescriptor {
            name,
            column_type,
            primary_key,
            nullable,
        })
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    pub fn get_column_type(&self) -> ColumnType {
        self.column_type
    }

    pub fn is_primary_key(&self) -> bool {
        self.primary_key
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }
}

/// The sub-table derived for one list-valued field.
///
/// Layout is always `(parent key, ord, value)`: the parent's primary key column (same name and type), an integer
/// element discriminator, and the element itself.  The composite primary key is `(parent key, ord)`; the parent key
/// is the *primary id* that [crate::DataStore::clear_ids] matches on.
#[derive(Clone, Debug, PartialEq)]
pub struct SubTableDescriptor {
    field: String,
    table_name: String,
    columns: Vec<ColumnDescriptor>,
}

impl SubTableDescriptor {
    fn new(parent_table: &str, parent_key: &ColumnDescriptor, field: String, element: ColumnType) -> Result<SubTableDescriptor> {
        let columns = vec![
            ColumnDescriptor::new(parent_key.get_name(), parent_key.get_column_type(), true, false)?,
            ColumnDescriptor::new("ord", ColumnType::Integer, true, false)?,
            ColumnDescriptor::new("value", element, false, false)?,
        ];
        Ok(SubTableDescriptor {
            table_name: format!("{}_{}", parent_table, field),
            field,
            columns,
        })
    }

    /// The list-valued field on the parent type this sub-table stores.
    pub fn get_field(&self) -> &str {
        &self.field
    }

    pub fn get_table_name(&self) -> &str {
        &self.table_name
    }

    pub fn get_columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    /// The column holding list elements.
    pub fn value_column(&self) -> &ColumnDescriptor {
        &self.columns[2]
    }
}

/// Description of how a type maps to one table plus its list sub-tables.
#[derive(Clone, Debug, PartialEq)]
pub struct EntityDescriptor {
    schema_name: String,
    table_name: String,
    columns: Vec<ColumnDescriptor>,
    primary_key: usize,
    sub_tables: Vec<SubTableDescriptor>,
}

impl EntityDescriptor {
    pub fn get_schema_name(&self) -> &str {
        &self.schema_name
    }

    pub fn get_table_name(&self) -> &str {
        &self.table_name
    }

    /// `schema.table`, for diagnostics.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema_name, self.table_name)
    }

    pub fn get_columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    pub fn primary_key(&self) -> &ColumnDescriptor {
        &self.columns[self.primary_key]
    }

    pub fn primary_key_index(&self) -> usize {
        self.primary_key
    }

    pub fn get_sub_tables(&self) -> &[SubTableDescriptor] {
        &self.sub_tables
    }
}

/// A helper to build entity descriptors.
pub struct EntityBuilder {
    schema_name: String,
    table_name: String,
    columns: Vec<ColumnDescriptor>,
    lists: Vec<(String, ColumnType)>,
}

impl EntityBuilder {
    pub fn new(schema_name: impl Into<String>, table_name: impl Into<String>) -> EntityBuilder {
        EntityBuilder {
            schema_name: schema_name.into(),
            table_name: table_name.into(),
            columns: vec![],
            lists: vec![],
        }
    }

    fn check_name(&self, name: &str) -> Result<()> {
        if self.columns.iter().any(|c| c.get_name() == name)
            || self.lists.iter().any(|(f, _)| f == name)
        {
            return Err(PersistError::invalid(name, "duplicate column names not allowed"));
        }
        Ok(())
    }

    pub fn add_integer_column(
        &mut self,
        name: impl Into<String>,
        primary_key: bool,
        nullable: bool,
    ) -> Result<&mut EntityBuilder> {
        let name = name.into();
        self.check_name(&name)?;
        self.columns
            .push(ColumnDescriptor::new(name, ColumnType::Integer, primary_key, nullable)?);
        Ok(self)
    }

    pub fn add_real_column(
        &mut self,
        name: impl Into<String>,
        nullable: bool,
    ) -> Result<&mut EntityBuilder> {
        let name = name.into();
        self.check_name(&name)?;
        self.columns
            .push(ColumnDescriptor::new(name, ColumnType::Real, false, nullable)?);
        Ok(self)
    }

    pub fn add_text_column(
        &mut self,
        name: impl Into<String>,
        primary_key: bool,
        nullable: bool,
    ) -> Result<&mut EntityBuilder> {
        let name = name.into();
        self.check_name(&name)?;
        self.columns
            .push(ColumnDescriptor::new(name, ColumnType::Text, primary_key, nullable)?);
        Ok(self)
    }

    pub fn add_json_column(&mut self, name: impl Into<String>) -> Result<&mut EntityBuilder> {
        let name = name.into();
        self.check_name(&name)?;
        // JSON null round-trips through the column itself, so the column is never null.
        self.columns
            .push(ColumnDescriptor::new(name, ColumnType::Json, false, false)?);
        Ok(self)
    }

    /// Declare a list-valued field.  The field becomes a sub-table keyed by the parent's primary key plus an
    /// element discriminator, not a column on the main table.
    pub fn add_list_column(
        &mut self,
        name: impl Into<String>,
        element: ColumnType,
    ) -> Result<&mut EntityBuilder> {
        let name = name.into();
        self.check_name(&name)?;
        check_ident("field names", &name)?;
        self.lists.push((name, element));
        Ok(self)
    }

    pub fn build(self) -> Result<EntityDescriptor> {
        check_ident("schema names", &self.schema_name)?;
        check_ident("table names", &self.table_name)?;
        if RESERVED_TABLES.contains(&self.table_name.as_str()) {
            return Err(PersistError::invalid(&self.table_name, "table name is reserved"));
        }

        let mut primary = None;
        for (i, c) in self.columns.iter().enumerate() {
            if c.is_primary_key() {
                if primary.is_some() {
                    return Err(PersistError::invalid(
                        &self.table_name,
                        "entities have exactly one primary key column",
                    ));
                }
                primary = Some(i);
            }
        }
        let primary = primary.ok_or_else(|| {
            PersistError::invalid(&self.table_name, "entities have exactly one primary key column")
        })?;

        if !self.lists.is_empty() && SUB_TABLE_COLUMNS.contains(&self.columns[primary].get_name()) {
            return Err(PersistError::invalid(
                self.columns[primary].get_name(),
                "primary key name collides with sub-table bookkeeping columns",
            ));
        }

        let mut sub_tables = vec![];
        for (field, element) in self.lists {
            sub_tables.push(SubTableDescriptor::new(
                &self.table_name,
                &self.columns[primary],
                field,
                element,
            )?);
        }

        Ok(EntityDescriptor {
            schema_name: self.schema_name,
            table_name: self.table_name,
            columns: self.columns,
            primary_key: primary,
            sub_tables,
        })
    }
}
