//! The in-memory store.
//!
//! This is the reference [DataStore]: it implements the full contract, including header introspection and the
//! keep-set clear semantics, against plain maps.  Handles are cheap clones sharing one underlying set of tables, so
//! a host (or a test) can keep a handle for inspection while the engine owns another through its schema.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::*;

use crate::descriptor::ColumnDescriptor;
use crate::errors::{PersistError, Result};
use crate::store::{DataStore, StoreFactory};
use crate::table::{row_composite_key, row_primary_id, ColumnValue, DataTable, Key, Row};

struct MemTable {
    columns: Vec<ColumnDescriptor>,
    rows: Vec<Row>,
}

impl MemTable {
    fn composite_key(&self, row: &Row, name: &str) -> Result<Vec<Key>> {
        row_composite_key(&self.columns, row, name)
    }

    /// Project a row from another layout onto this table's layout, matching columns by name.  Unknown or
    /// type-mismatched source values fall back to the column default; this is what makes loading a legacy table
    /// with a newer layout survivable.
    fn project(&self, from: &[ColumnDescriptor], row: &Row) -> Row {
        self.columns
            .iter()
            .map(|column| {
                from.iter()
                    .position(|c| c.get_name() == column.get_name())
                    .and_then(|i| row.get(i))
                    .filter(|v| v.fits(column))
                    .cloned()
                    .unwrap_or_else(|| ColumnValue::default_for(column))
            })
            .collect()
    }
}

struct Inner {
    schema: String,
    connected: bool,
    read_only: bool,
    tables: HashMap<String, MemTable>,
}

/// An in-memory [DataStore].  Clones share the same tables.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new(schema: impl Into<String>) -> MemoryStore {
        MemoryStore::build(schema, false)
    }

    /// A store that accepts connects and reads but silently drops every write.
    pub fn read_only(schema: impl Into<String>) -> MemoryStore {
        MemoryStore::build(schema, true)
    }

    fn build(schema: impl Into<String>, read_only: bool) -> MemoryStore {
        MemoryStore {
            inner: Arc::new(Mutex::new(Inner {
                schema: schema.into(),
                connected: false,
                read_only,
                tables: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<Inner> {
        self.inner.lock().expect("memory store lock poisoned")
    }

    /// Table names currently present.  For inspection; the engine itself never calls this.
    pub fn table_names(&self) -> Vec<String> {
        let inner = self.lock();
        let mut names: Vec<_> = inner.tables.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of rows stored in a table, or None if the table doesn't exist.  For inspection.
    pub fn row_count(&self, name: &str) -> Option<usize> {
        let inner = self.lock();
        inner.tables.get(name).map(|t| t.rows.len())
    }
}

fn ensure_connected(inner: &Inner, op: &'static str) -> Result<()> {
    if !inner.connected {
        return Err(PersistError::backend(
            op,
            format!("{}: store is not connected", inner.schema),
        ));
    }
    Ok(())
}

fn get_table<'a>(inner: &'a Inner, op: &'static str, name: &str) -> Result<&'a MemTable> {
    inner.tables.get(name).ok_or_else(|| {
        PersistError::backend(op, format!("{}.{}: no such table", inner.schema, name))
    })
}

impl DataStore for MemoryStore {
    fn connect(&mut self) -> Result<()> {
        let mut inner = self.lock();
        inner.connected = true;
        debug!("{}: memory store connected", inner.schema);
        Ok(())
    }

    fn disconnect(&mut self) {
        let mut inner = self.lock();
        inner.connected = false;
        debug!("{}: memory store disconnected", inner.schema);
    }

    fn is_read_only(&self) -> bool {
        self.lock().read_only
    }

    fn table_exists(&self, name: &str) -> Result<bool> {
        let inner = self.lock();
        ensure_connected(&inner, "table_exists")?;
        Ok(inner.tables.contains_key(name))
    }

    fn create(&mut self, table: &DataTable) -> Result<()> {
        let mut inner = self.lock();
        ensure_connected(&inner, "create")?;
        if inner.read_only {
            debug!("{}: dropping create of {} (read only)", inner.schema, table.get_name());
            return Ok(());
        }
        if inner.tables.contains_key(table.get_name()) {
            return Err(PersistError::backend(
                "create",
                format!("{}.{}: table already exists", inner.schema, table.get_name()),
            ));
        }
        if !table.get_columns().iter().any(|c| c.is_primary_key()) {
            return Err(PersistError::backend(
                "create",
                format!("{}.{}: layout has no primary key", inner.schema, table.get_name()),
            ));
        }
        debug!("{}: creating table {}", inner.schema, table.get_name());
        inner.tables.insert(
            table.get_name().to_string(),
            MemTable {
                columns: table.get_columns().to_vec(),
                rows: vec![],
            },
        );
        Ok(())
    }

    fn drop_table(&mut self, name: &str) -> Result<()> {
        let mut inner = self.lock();
        ensure_connected(&inner, "drop")?;
        if inner.read_only {
            debug!("{}: dropping drop of {} (read only)", inner.schema, name);
            return Ok(());
        }
        if inner.tables.remove(name).is_none() {
            return Err(PersistError::backend(
                "drop",
                format!("{}.{}: no such table", inner.schema, name),
            ));
        }
        debug!("{}: dropped table {}", inner.schema, name);
        Ok(())
    }

    fn table_header(&self, name: &str) -> Result<Vec<ColumnDescriptor>> {
        let inner = self.lock();
        ensure_connected(&inner, "header")?;
        Ok(get_table(&inner, "header", name)?.columns.clone())
    }

    fn load(&self, table: &mut DataTable) -> Result<()> {
        let inner = self.lock();
        ensure_connected(&inner, "load")?;
        let mem = get_table(&inner, "load", table.get_name())?;

        let to = table.get_columns().to_vec();
        for stored in &mem.rows {
            let projected = to
                .iter()
                .map(|column| {
                    mem.columns
                        .iter()
                        .position(|c| c.get_name() == column.get_name())
                        .and_then(|i| stored.get(i))
                        .filter(|v| v.fits(column))
                        .cloned()
                        .unwrap_or_else(|| ColumnValue::default_for(column))
                })
                .collect();
            table.push_row(projected)?;
        }
        debug!(
            "{}: loaded {} rows from {}",
            inner.schema,
            mem.rows.len(),
            table.get_name()
        );
        Ok(())
    }

    fn save(&mut self, table: &DataTable) -> Result<()> {
        let mut inner = self.lock();
        ensure_connected(&inner, "save")?;
        if inner.read_only {
            debug!("{}: dropping save to {} (read only)", inner.schema, table.get_name());
            return Ok(());
        }
        let schema = inner.schema.clone();
        let mem = inner.tables.get_mut(table.get_name()).ok_or_else(|| {
            PersistError::backend(
                "save",
                format!("{}.{}: no such table", schema, table.get_name()),
            )
        })?;

        for row in table.get_rows() {
            let projected = mem.project(table.get_columns(), row);
            let key = mem.composite_key(&projected, table.get_name())?;
            let existing = mem
                .rows
                .iter()
                .position(|r| mem.composite_key(r, table.get_name()).ok().as_ref() == Some(&key));
            match existing {
                Some(i) => mem.rows[i] = projected,
                None => mem.rows.push(projected),
            }
        }
        debug!(
            "{}: saved {} rows to {}",
            schema,
            table.get_rows().len(),
            table.get_name()
        );
        Ok(())
    }

    fn clear(&mut self, table: &DataTable) -> Result<()> {
        let mut inner = self.lock();
        ensure_connected(&inner, "clear")?;
        if inner.read_only {
            debug!("{}: dropping clear of {} (read only)", inner.schema, table.get_name());
            return Ok(());
        }
        let keep = keep_set(table)?;
        let schema = inner.schema.clone();
        let mem = inner.tables.get_mut(table.get_name()).ok_or_else(|| {
            PersistError::backend(
                "clear",
                format!("{}.{}: no such table", schema, table.get_name()),
            )
        })?;

        let before = mem.rows.len();
        let columns = mem.columns.clone();
        mem.rows.retain(|row| {
            row_composite_key(&columns, row, table.get_name())
                .map(|k| keep.contains(&k))
                .unwrap_or(false)
        });
        debug!(
            "{}: cleared {} rows from {}",
            schema,
            before - mem.rows.len(),
            table.get_name()
        );
        Ok(())
    }

    fn clear_ids(&mut self, table: &DataTable, ids: &[Key]) -> Result<()> {
        let mut inner = self.lock();
        ensure_connected(&inner, "clear_ids")?;
        if inner.read_only {
            debug!(
                "{}: dropping clear_ids on {} (read only)",
                inner.schema,
                table.get_name()
            );
            return Ok(());
        }
        let keep = keep_set(table)?;
        let schema = inner.schema.clone();
        let mem = inner.tables.get_mut(table.get_name()).ok_or_else(|| {
            PersistError::backend(
                "clear_ids",
                format!("{}.{}: no such table", schema, table.get_name()),
            )
        })?;

        let before = mem.rows.len();
        let columns = mem.columns.clone();
        mem.rows.retain(|row| {
            let primary = row_primary_id(&columns, row, table.get_name());
            let composite = row_composite_key(&columns, row, table.get_name());
            match (primary, composite) {
                (Ok(p), Ok(c)) => !(ids.contains(&p) && !keep.contains(&c)),
                // A row we can't even key is left alone; it predates this layout.
                _ => true,
            }
        });
        debug!(
            "{}: cleared {} rows from {} for {} ids",
            schema,
            before - mem.rows.len(),
            table.get_name(),
            ids.len()
        );
        Ok(())
    }
}

fn keep_set(table: &DataTable) -> Result<std::collections::HashSet<Vec<Key>>> {
    table
        .get_rows()
        .iter()
        .map(|row| table.composite_key(row))
        .collect()
}

/// Hands one shared [MemoryStore] per schema name to the engine, keeping handles around so tests and hosts can look
/// at the stored data directly.
#[derive(Clone, Default)]
pub struct MemoryStoreFactory {
    stores: Arc<Mutex<HashMap<String, MemoryStore>>>,
}

impl MemoryStoreFactory {
    pub fn new() -> MemoryStoreFactory {
        Default::default()
    }

    /// The store backing `schema`, created empty if the engine hasn't asked for it yet.
    pub fn store(&self, schema: &str) -> MemoryStore {
        let mut stores = self.stores.lock().expect("factory lock poisoned");
        stores
            .entry(schema.to_string())
            .or_insert_with(|| MemoryStore::new(schema))
            .clone()
    }
}

impl StoreFactory for MemoryStoreFactory {
    fn open(&self, _root: &std::path::Path, schema: &str) -> Result<Box<dyn DataStore>> {
        Ok(Box::new(self.store(schema)))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::*;
    use crate::descriptor::{ColumnType, EntityBuilder, EntityDescriptor};

    fn descriptor() -> EntityDescriptor {
        let mut b = EntityBuilder::new("test", "widget");
        b.add_integer_column("id", true, false).unwrap();
        b.add_integer_column("v", false, false).unwrap();
        b.build().unwrap()
    }

    fn connected() -> MemoryStore {
        let mut store = MemoryStore::new("test");
        store.connect().unwrap();
        store
    }

    fn row(id: i64, v: i64) -> Row {
        [ColumnValue::Integer(id), ColumnValue::Integer(v)]
            .into_iter()
            .collect()
    }

    fn seed(store: &mut MemoryStore, ids: &[i64]) -> EntityDescriptor {
        let desc = descriptor();
        store.create(&DataTable::for_entity(&desc)).unwrap();
        let mut table = DataTable::for_entity(&desc);
        for id in ids {
            table.push_row(row(*id, *id * 10)).unwrap();
        }
        store.save(&table).unwrap();
        desc
    }

    fn stored_ids(store: &MemoryStore, desc: &EntityDescriptor) -> Vec<i64> {
        let mut table = DataTable::for_entity(desc);
        store.load(&mut table).unwrap();
        let mut ids: Vec<i64> = table
            .get_rows()
            .iter()
            .map(|r| match table.primary_id(r).unwrap() {
                Key::Integer(i) => i,
                Key::Text(_) => unreachable!(),
            })
            .collect();
        ids.sort();
        ids
    }

    #[test]
    fn requires_connection() {
        let store = MemoryStore::new("test");
        assert!(store.table_exists("widget").is_err());
    }

    #[test]
    fn save_upserts_by_key() {
        let mut store = connected();
        let desc = seed(&mut store, &[1, 2]);

        let mut table = DataTable::for_entity(&desc);
        table.push_row(row(2, 99)).unwrap();
        table.push_row(row(3, 30)).unwrap();
        store.save(&table).unwrap();

        assert_eq!(stored_ids(&store, &desc), vec![1, 2, 3]);
        let mut loaded = DataTable::for_entity(&desc);
        store.load(&mut loaded).unwrap();
        let updated = loaded
            .get_rows()
            .iter()
            .find(|r| loaded.primary_id(r).unwrap() == Key::Integer(2))
            .unwrap();
        assert_eq!(updated.get(1), Some(&ColumnValue::Integer(99)));
    }

    #[test]
    fn clear_keeps_only_the_keep_set() {
        let mut store = connected();
        let desc = seed(&mut store, &[1, 2, 3]);

        let mut keep = DataTable::for_entity(&desc);
        keep.push_row(row(2, 20)).unwrap();
        store.clear(&keep).unwrap();

        assert_eq!(stored_ids(&store, &desc), vec![2]);
    }

    #[test]
    fn clear_ids_spares_rows_in_the_table() {
        let mut store = connected();
        let desc = seed(&mut store, &[1, 2, 3]);

        // 2 is both condemned and in the keep-set: the keep-set wins.
        let keep = DataTable::keys_only(&desc, [Key::Integer(2)]);
        store
            .clear_ids(&keep, &[Key::Integer(2), Key::Integer(3)])
            .unwrap();

        assert_eq!(stored_ids(&store, &desc), vec![1, 2]);
    }

    #[test]
    fn clear_ids_matches_composite_keys() {
        let mut store = connected();
        let desc = {
            let mut b = EntityBuilder::new("test", "widget");
            b.add_integer_column("id", true, false).unwrap();
            b.add_list_column("parts", ColumnType::Integer).unwrap();
            b.build().unwrap()
        };
        let sub = &desc.get_sub_tables()[0];
        store.create(&DataTable::for_sub_table(sub)).unwrap();

        let mut rows = DataTable::for_sub_table(sub);
        for ord in 0..3 {
            rows.push_row(
                [
                    ColumnValue::Integer(7),
                    ColumnValue::Integer(ord),
                    ColumnValue::Integer(ord * 100),
                ]
                .into_iter()
                .collect(),
            )
            .unwrap();
        }
        store.save(&rows).unwrap();

        // Parent 7 keeps elements 0 and 1; element 2 must go even though its primary id is kept.
        let mut keep = DataTable::for_sub_table(sub);
        keep.push_row(
            [ColumnValue::Integer(7), ColumnValue::Integer(0), ColumnValue::Integer(0)]
                .into_iter()
                .collect(),
        )
        .unwrap();
        keep.push_row(
            [ColumnValue::Integer(7), ColumnValue::Integer(1), ColumnValue::Integer(100)]
                .into_iter()
                .collect(),
        )
        .unwrap();
        store.clear_ids(&keep, &[Key::Integer(7)]).unwrap();

        assert_eq!(store.row_count(sub.get_table_name()), Some(2));
    }

    #[test]
    fn read_only_drops_writes() {
        let mut store = MemoryStore::read_only("test");
        store.connect().unwrap();
        assert!(store.is_read_only());

        let desc = descriptor();
        store.create(&DataTable::for_entity(&desc)).unwrap();
        assert!(!store.table_exists("widget").unwrap());
    }

    #[test]
    fn load_projects_legacy_layouts() {
        let mut store = connected();
        seed(&mut store, &[1]);

        // Ask for a column the stored layout doesn't have; it comes back defaulted.
        let mut b = EntityBuilder::new("test", "widget");
        b.add_integer_column("id", true, false).unwrap();
        b.add_integer_column("v", false, false).unwrap();
        b.add_text_column("label", false, false).unwrap();
        let wider = b.build().unwrap();

        let mut table = DataTable::for_entity(&wider);
        store.load(&mut table).unwrap();
        assert_eq!(table.get_rows()[0].get(2), Some(&ColumnValue::Text(String::new())));
    }

    proptest! {
        /// clear_ids removes exactly the rows whose id is condemned and not in the keep-set.
        #[test]
        fn fuzz_clear_ids(
            stored in proptest::collection::hash_set(0i64..50, 0..30),
            kept in proptest::collection::hash_set(0i64..50, 0..30),
            condemned in proptest::collection::hash_set(0i64..50, 0..30),
        ) {
            let mut store = connected();
            let stored: Vec<i64> = stored.into_iter().collect();
            let desc = seed(&mut store, &stored);

            let keep = DataTable::keys_only(&desc, kept.iter().map(|i| Key::Integer(*i)));
            let ids: Vec<Key> = condemned.iter().map(|i| Key::Integer(*i)).collect();
            store.clear_ids(&keep, &ids).unwrap();

            let mut expected: Vec<i64> = stored
                .iter()
                .copied()
                .filter(|i| !(condemned.contains(i) && !kept.contains(i)))
                .collect();
            expected.sort();
            prop_assert_eq!(stored_ids(&store, &desc), expected);
        }
    }
}
