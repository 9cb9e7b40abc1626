//! The engine: the process-wide registry and façade.
//!
//! One [Engine] instance is constructed at host start with a storage root and a [StoreFactory], passed by reference
//! to everything that persists data, and torn down with [Engine::disconnect] at host stop.  It resolves (or lazily
//! builds, exactly once per type) the [PersistedClass] for any [Persisted] type and routes every operation to it.
//!
//! Registry reads are lock-free with respect to creation: the read path takes only the map's read lock, while a
//! single dedicated mutex serializes the check-then-create path, so simultaneous first accesses from many threads
//! still construct exactly one class.
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use itertools::Itertools;
use log::*;

use crate::errors::{PersistError, Result};
use crate::persisted::Persisted;
use crate::persisted_class::{AnyPersistedClass, PersistedClass};
use crate::schema::Schema;
use crate::store::StoreFactory;
use crate::table::Key;

/// One registry entry: the same class, both erased for iteration and downcastable for typed access.
struct Registered {
    class: Arc<dyn AnyPersistedClass>,
    instance: Arc<dyn Any + Send + Sync>,
}

pub struct Engine {
    root: PathBuf,
    factory: Box<dyn StoreFactory>,
    classes: RwLock<HashMap<TypeId, Registered>>,
    schemas: RwLock<HashMap<String, Arc<Schema>>>,
    /// Serializes the check-then-create path; see [Engine::get_persisted_class].
    create_lock: Mutex<()>,
}

impl Engine {
    /// Build an engine rooted at `root` (created if absent), opening one store per schema through `factory`.
    pub fn new(root: impl Into<PathBuf>, factory: impl StoreFactory + 'static) -> Result<Engine> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| {
            PersistError::backend("initialize", format!("{}: {}", root.display(), e))
        })?;
        Ok(Engine {
            root,
            factory: Box::new(factory),
            classes: Default::default(),
            schemas: Default::default(),
            create_lock: Mutex::new(()),
        })
    }

    /// Resolve the persisted class for `T`, building it on first access.
    ///
    /// Creation is idempotent under races: late arrivals block on the create lock and receive the instance the
    /// winner built.  A type whose metadata doesn't validate fails with [PersistError::InvalidType] and is not
    /// registered.
    pub fn get_persisted_class<T: Persisted>(&self) -> Result<Arc<PersistedClass<T>>> {
        if let Some(found) = self.lookup::<T>() {
            return Ok(found);
        }

        let guard = self.create_lock.lock().expect("create lock poisoned");
        if let Some(found) = self.lookup::<T>() {
            return Ok(found);
        }

        let mut class = PersistedClass::<T>::bind()?;
        if let Some(migration) = T::migrations()? {
            class.set_migration_info(migration);
        }
        let schema_name = class.get_descriptor().get_schema_name().to_string();
        let schema = self.schema_for(&schema_name)?;
        class.set_schema(schema.clone());

        let instance = Arc::new(class);
        let erased: Arc<dyn AnyPersistedClass> = instance.clone();
        schema.add_persisted_class(&erased);
        {
            let mut classes = self.classes.write().expect("classes lock poisoned");
            classes.insert(
                TypeId::of::<T>(),
                Registered {
                    class: erased,
                    instance: instance.clone(),
                },
            );
        }
        info!(
            "registered {} as {}",
            std::any::type_name::<T>(),
            instance.get_descriptor().qualified_name()
        );

        // Reference binding happens after the class is visible and after the create lock is released: resolving a
        // reference may recursively register the referee, and mutually referencing types must each find the other
        // already in the map.
        drop(guard);
        instance.bind_references(self)?;

        Ok(instance)
    }

    fn lookup<T: Persisted>(&self) -> Option<Arc<PersistedClass<T>>> {
        let classes = self.classes.read().expect("classes lock poisoned");
        // The registry is keyed by TypeId, so the downcast cannot miss.
        classes
            .get(&TypeId::of::<T>())
            .and_then(|registered| registered.instance.clone().downcast::<PersistedClass<T>>().ok())
    }

    fn schema_for(&self, name: &str) -> Result<Arc<Schema>> {
        if let Some(schema) = self.get_schema(name) {
            return Ok(schema);
        }
        let store = self.factory.open(&self.root, name)?;
        let schema = Arc::new(Schema::new(name, store)?);
        let mut schemas = self.schemas.write().expect("schemas lock poisoned");
        schemas.insert(name.to_string(), schema.clone());
        info!("created schema {}", name);
        Ok(schema)
    }

    /// Look an instance up by primary key.  Absence is a normal outcome: the result is None both when the id is
    /// unknown and when the type can't be persisted at all (the latter is logged).
    pub fn get<T: Persisted>(&self, id: impl Into<Key>) -> Option<T> {
        let id = id.into();
        let class = match self.get_persisted_class::<T>() {
            Ok(class) => class,
            Err(e) => {
                warn!("get: {}", e);
                return None;
            }
        };
        match class.get(&id) {
            Ok(found) => found,
            Err(e) => {
                warn!("get {}: {}", id, e);
                None
            }
        }
    }

    /// Cache an instance for write-back.  Returns false only when the type can't be persisted, never for an
    /// ordinary write.
    pub fn put<T: Persisted>(&self, value: T) -> bool {
        let class = match self.get_persisted_class::<T>() {
            Ok(class) => class,
            Err(e) => {
                warn!("put: {}", e);
                return false;
            }
        };
        match class.put(value) {
            Ok(_) => true,
            Err(e) => {
                warn!("put: {}", e);
                false
            }
        }
    }

    /// Drop an instance from the cache; the stored row goes away on the next save.
    pub fn remove<T: Persisted>(&self, value: &T) {
        match self.get_persisted_class::<T>() {
            Ok(class) => {
                if let Err(e) = class.remove(value) {
                    warn!("remove: {}", e);
                }
            }
            Err(e) => warn!("remove: {}", e),
        }
    }

    /// Append every instance of `T` to `out`.
    pub fn get_all<T: Persisted>(&self, out: &mut Vec<T>) {
        match self.get_persisted_class::<T>() {
            Ok(class) => {
                if let Err(e) = class.get_all(out) {
                    warn!("get_all: {}", e);
                }
            }
            Err(e) => warn!("get_all: {}", e),
        }
    }

    /// Replace the whole stored extent of `T` with `values`; see [PersistedClass::put_all].
    pub fn put_all<T: Persisted>(&self, values: Vec<T>) {
        match self.get_persisted_class::<T>() {
            Ok(class) => {
                if let Err(e) = class.put_all(values) {
                    warn!("put_all: {}", e);
                }
            }
            Err(e) => warn!("put_all: {}", e),
        }
    }

    /// Flush every registered class's dirty entries.  All classes are attempted even when one fails; the first
    /// failure is returned.
    pub fn save(&self) -> Result<()> {
        let classes: Vec<Arc<dyn AnyPersistedClass>> = {
            let classes = self.classes.read().expect("classes lock poisoned");
            classes.values().map(|r| r.class.clone()).collect()
        };

        let mut first_error = None;
        for class in classes {
            if let Err(e) = class.save() {
                error!(
                    "save of {} failed: {}",
                    class.get_descriptor().qualified_name(),
                    e
                );
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Drop the whole registry and schema map.  This is a blunt cache invalidation: the next access re-registers
    /// types from their metadata and re-reads the backend.
    pub fn clear(&self) {
        let mut classes = self.classes.write().expect("classes lock poisoned");
        let mut schemas = self.schemas.write().expect("schemas lock poisoned");
        info!(
            "clearing {} classes ({}) and {} schemas",
            classes.len(),
            classes
                .values()
                .map(|r| r.class.get_descriptor().get_table_name())
                .join(", "),
            schemas.len()
        );
        classes.clear();
        schemas.clear();
    }

    pub fn get_schema(&self, name: &str) -> Option<Arc<Schema>> {
        let schemas = self.schemas.read().expect("schemas lock poisoned");
        schemas.get(name).cloned()
    }

    pub fn get_schema_list(&self) -> Vec<Arc<Schema>> {
        let schemas = self.schemas.read().expect("schemas lock poisoned");
        schemas.values().cloned().collect()
    }

    /// Disconnect every schema's store.  Call at host stop, after a final [Engine::save].
    pub fn disconnect(&self) {
        for schema in self.get_schema_list() {
            schema.disconnect();
        }
    }
}
