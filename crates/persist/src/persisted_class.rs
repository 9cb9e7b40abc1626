//! Persisted classes.
//!
//! A [PersistedClass] is the per-type runtime unit: it binds a type's descriptor to an in-memory cache of live
//! instances and orchestrates load/save/migration against its schema's store.  Reads are cache-first; the stored
//! table is pulled into the cache once, on the first miss.  Writes only mark entries dirty; nothing touches the
//! backend until [PersistedClass::save], which flushes exactly the dirty set.
//!
//! The cache is internally synchronized.  A save snapshots the dirty set before doing I/O, so writes racing the
//! save are never lost; they just ride the next pass.
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use log::*;

use crate::codec;
use crate::descriptor::EntityDescriptor;
use crate::engine::Engine;
use crate::errors::Result;
use crate::migration::{ensure_tables, MigrationDescriptor};
use crate::persisted::Persisted;
use crate::schema::Schema;
use crate::table::{ColumnValue, DataTable, Key};

/// The type-erased face of a [PersistedClass], for the registry and schema membership.
pub(crate) trait AnyPersistedClass: Any + Send + Sync {
    fn get_descriptor(&self) -> &EntityDescriptor;
    fn save(&self) -> Result<()>;
    fn bind_references(&self, engine: &Engine) -> Result<()>;
}

struct ClassState<T> {
    cache: HashMap<Key, T>,
    dirty: HashSet<Key>,
    removed: HashSet<Key>,
    /// Whether the stored extent has been pulled into the cache.
    loaded: bool,
    /// Whether the backend tables are known to sit at the live schema version.  Stays false while migration steps
    /// are pending so each pass re-checks.
    schema_current: bool,
    /// Whether this class has ever touched the backend.  Untouched classes don't get tables created just because
    /// an engine-wide save swept past them.
    touched: bool,
}

impl<T> Default for ClassState<T> {
    fn default() -> ClassState<T> {
        ClassState {
            cache: HashMap::new(),
            dirty: HashSet::new(),
            removed: HashSet::new(),
            loaded: false,
            schema_current: false,
            touched: false,
        }
    }
}

pub struct PersistedClass<T: Persisted> {
    descriptor: EntityDescriptor,
    migration: Option<MigrationDescriptor>,
    schema: Option<Arc<Schema>>,
    state: Mutex<ClassState<T>>,
}

impl<T: Persisted> PersistedClass<T> {
    /// Validate the type's metadata and build the (not yet registered) class.
    pub(crate) fn bind() -> Result<PersistedClass<T>> {
        let descriptor = T::descriptor()?;
        Ok(PersistedClass {
            descriptor,
            migration: None,
            schema: None,
            state: Mutex::new(Default::default()),
        })
    }

    pub(crate) fn set_schema(&mut self, schema: Arc<Schema>) {
        self.schema = Some(schema);
    }

    pub(crate) fn set_migration_info(&mut self, migration: MigrationDescriptor) {
        self.migration = Some(migration);
    }

    pub fn get_descriptor(&self) -> &EntityDescriptor {
        &self.descriptor
    }

    pub fn get_schema(&self) -> &Arc<Schema> {
        // Registration sets the schema before the class is visible anywhere.
        self.schema.as_ref().expect("schema is set during registration")
    }

    fn lock(&self) -> MutexGuard<ClassState<T>> {
        self.state.lock().expect("class state lock poisoned")
    }

    /// Look an instance up by primary key.  A miss is a normal outcome, not an error.
    pub fn get(&self, id: &Key) -> Result<Option<T>> {
        {
            let state = self.lock();
            if let Some(value) = state.cache.get(id) {
                return Ok(Some(value.clone()));
            }
            if state.loaded || state.removed.contains(id) {
                return Ok(None);
            }
        }
        self.ensure_loaded()?;
        let state = self.lock();
        Ok(state.cache.get(id).cloned())
    }

    /// Insert or update an instance in the cache and mark it dirty.  The backend sees it on the next save.
    pub fn put(&self, value: T) -> Result<Key> {
        let key = codec::extract_key(&self.descriptor, &value)?;
        let mut state = self.lock();
        state.removed.remove(&key);
        state.cache.insert(key.clone(), value);
        state.dirty.insert(key.clone());
        Ok(key)
    }

    /// Drop an instance from the cache; its row (and sub-table rows) are deleted on the next save.
    pub fn remove(&self, value: &T) -> Result<()> {
        let key = codec::extract_key(&self.descriptor, value)?;
        let mut state = self.lock();
        state.cache.remove(&key);
        state.dirty.remove(&key);
        state.removed.insert(key);
        Ok(())
    }

    /// Append every instance of this type to `out`.
    pub fn get_all(&self, out: &mut Vec<T>) -> Result<()> {
        self.ensure_loaded()?;
        let state = self.lock();
        out.extend(state.cache.values().cloned());
        Ok(())
    }

    /// Replace the type's whole extent with `values`.  Stored instances absent from `values` are deleted on the
    /// next save; everything supplied is upserted.  Callers must pass the complete desired set.
    pub fn put_all(&self, values: Vec<T>) -> Result<()> {
        self.ensure_loaded()?;

        let mut incoming = HashMap::with_capacity(values.len());
        for value in values {
            incoming.insert(codec::extract_key(&self.descriptor, &value)?, value);
        }

        let mut state = self.lock();
        let state = &mut *state;
        for key in state.cache.keys() {
            if !incoming.contains_key(key) {
                state.removed.insert(key.clone());
            }
        }
        state.removed.retain(|key| !incoming.contains_key(key));
        state.dirty = incoming.keys().cloned().collect();
        state.cache = incoming;
        Ok(())
    }

    /// Flush dirty entries and pending removals to the backend.  Unmodified cached instances generate no I/O.  On
    /// the first backend touch this also creates the tables, after running any pending migration step.
    pub fn save(&self) -> Result<()> {
        let (dirty, removed, surviving, was_current) = {
            let mut state = self.lock();
            let has_work = !state.dirty.is_empty() || !state.removed.is_empty();
            if !has_work && (state.schema_current || !state.touched) {
                return Ok(());
            }
            state.touched = true;

            let dirty: Vec<(Key, T)> = state
                .dirty
                .iter()
                .filter_map(|k| state.cache.get(k).map(|v| (k.clone(), v.clone())))
                .collect();
            let removed: Vec<Key> = state.removed.iter().cloned().collect();
            let surviving: Vec<Key> = if removed.is_empty() {
                vec![]
            } else {
                state.cache.keys().cloned().collect()
            };
            state.dirty.clear();
            state.removed.clear();
            (dirty, removed, surviving, state.schema_current)
        };

        // Serialize outside any lock.
        let encoded = self.encode_dirty(&dirty);
        let (main, subs, dirty_keys) = match encoded {
            Ok(tables) => tables,
            Err(e) => {
                self.restore_snapshot(dirty, removed);
                return Err(e);
            }
        };

        let io = self.get_schema().with_store(|store| {
            let current = if was_current {
                true
            } else {
                ensure_tables(store, &self.descriptor, self.migration.as_ref())?
            };

            if store.is_read_only() {
                debug!(
                    "{}: read-only store, dropping {} dirty rows and {} removals",
                    self.descriptor.qualified_name(),
                    main.get_rows().len(),
                    removed.len()
                );
                return Ok(current);
            }

            if !dirty_keys.is_empty() {
                store.save(&main)?;
                for sub in &subs {
                    store.save(sub)?;
                    // Purge list elements the dirty parents no longer carry, leaving other parents alone.
                    store.clear_ids(sub, &dirty_keys)?;
                }
            }

            if !removed.is_empty() {
                let keep = DataTable::keys_only(&self.descriptor, surviving.iter().cloned());
                store.clear_ids(&keep, &removed)?;
                for sub in self.descriptor.get_sub_tables() {
                    store.clear_ids(&DataTable::for_sub_table(sub), &removed)?;
                }
            }

            debug!(
                "{}: saved {} rows, removed {}",
                self.descriptor.qualified_name(),
                dirty_keys.len(),
                removed.len()
            );
            Ok(current)
        });

        match io {
            Ok(current) => {
                self.lock().schema_current = current;
                Ok(())
            }
            Err(e) => {
                self.restore_snapshot(dirty, removed);
                Err(e)
            }
        }
    }

    fn encode_dirty(&self, dirty: &[(Key, T)]) -> Result<(DataTable, Vec<DataTable>, Vec<Key>)> {
        let mut main = DataTable::for_entity(&self.descriptor);
        let mut subs: Vec<DataTable> = self
            .descriptor
            .get_sub_tables()
            .iter()
            .map(DataTable::for_sub_table)
            .collect();
        let mut dirty_keys = Vec::with_capacity(dirty.len());

        for (key, value) in dirty {
            let encoded = codec::encode(&self.descriptor, value)?;
            main.push_row(encoded.row)?;
            for (i, elements) in encoded.lists.into_iter().enumerate() {
                for (ord, element) in elements.into_iter().enumerate() {
                    subs[i].push_row(
                        [
                            ColumnValue::from(key),
                            ColumnValue::Integer(ord as i64),
                            element,
                        ]
                        .into_iter()
                        .collect(),
                    )?;
                }
            }
            dirty_keys.push(key.clone());
        }

        Ok((main, subs, dirty_keys))
    }

    /// Put a failed save's snapshot back so the next save retries, without clobbering writes that arrived in the
    /// meantime.
    fn restore_snapshot(&self, dirty: Vec<(Key, T)>, removed: Vec<Key>) {
        let mut state = self.lock();
        for (key, value) in dirty {
            if !state.dirty.contains(&key) && !state.removed.contains(&key) {
                state.cache.entry(key.clone()).or_insert(value);
                state.dirty.insert(key);
            }
        }
        for key in removed {
            if !state.cache.contains_key(&key) {
                state.removed.insert(key);
            }
        }
    }

    /// Pull the stored extent into the cache, once.  Cached entries and pending removals always win over stored
    /// rows.
    fn ensure_loaded(&self) -> Result<()> {
        let mut state = self.lock();
        if state.loaded {
            return Ok(());
        }

        let was_current = state.schema_current;
        let loaded = self.get_schema().with_store(|store| {
            let current = if was_current {
                true
            } else {
                ensure_tables(store, &self.descriptor, self.migration.as_ref())?
            };

            if !store.table_exists(self.descriptor.get_table_name())? {
                // Read-only store that never had our table; there is nothing to load.
                return Ok((current, None));
            }

            let mut main = DataTable::for_entity(&self.descriptor);
            store.load(&mut main)?;
            let mut subs = vec![];
            for sub in self.descriptor.get_sub_tables() {
                let mut table = DataTable::for_sub_table(sub);
                if store.table_exists(sub.get_table_name())? {
                    store.load(&mut table)?;
                }
                subs.push(table);
            }
            Ok((current, Some((main, subs))))
        })?;

        let (current, data) = loaded;
        state.schema_current = current;
        state.touched = true;

        if let Some((main, subs)) = data {
            // Group sub-table rows per parent, ordered by the element discriminator.
            let mut grouped: Vec<HashMap<Key, Vec<(i64, ColumnValue)>>> =
                Vec::with_capacity(subs.len());
            for table in &subs {
                let mut by_parent: HashMap<Key, Vec<(i64, ColumnValue)>> = HashMap::new();
                for row in table.get_rows() {
                    let parent = table.primary_id(row)?;
                    let ord = match row.get(1) {
                        Some(ColumnValue::Integer(ord)) => *ord,
                        _ => 0,
                    };
                    let value = row.get(2).cloned().unwrap_or(ColumnValue::Null);
                    by_parent.entry(parent).or_default().push((ord, value));
                }
                grouped.push(by_parent);
            }

            let total = main.get_rows().len();
            for row in main.get_rows() {
                let key = main.primary_id(row)?;
                if state.cache.contains_key(&key) || state.removed.contains(&key) {
                    continue;
                }
                let mut lists = Vec::with_capacity(grouped.len());
                for by_parent in grouped.iter_mut() {
                    let mut elements = by_parent.remove(&key).unwrap_or_default();
                    elements.sort_by_key(|(ord, _)| *ord);
                    lists.push(elements.into_iter().map(|(_, v)| v).collect());
                }
                let value = codec::decode::<T>(&self.descriptor, row, &lists)?;
                state.cache.insert(key, value);
            }
            debug!(
                "{}: loaded {} stored rows into the cache",
                self.descriptor.qualified_name(),
                total
            );
        }

        state.loaded = true;
        Ok(())
    }
}

impl<T: Persisted> AnyPersistedClass for PersistedClass<T> {
    fn get_descriptor(&self) -> &EntityDescriptor {
        &self.descriptor
    }

    fn save(&self) -> Result<()> {
        PersistedClass::save(self)
    }

    fn bind_references(&self, engine: &Engine) -> Result<()> {
        for reference in T::references() {
            debug!(
                "{}: binding reference to {}",
                self.descriptor.qualified_name(),
                reference.get_name()
            );
            reference.resolve(engine)?;
        }
        Ok(())
    }
}
