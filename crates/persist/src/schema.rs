//! Schemas.
//!
//! A schema is a named grouping of persisted types sharing one store connection.  It exclusively owns its
//! [DataStore]; the mutex around the store doubles as the per-schema backend critical section, so writes from
//! different types never interleave on one connection.
use std::sync::{Arc, Mutex, Weak};

use log::*;

use crate::errors::Result;
use crate::persisted_class::AnyPersistedClass;
use crate::store::DataStore;

pub struct Schema {
    name: String,
    store: Mutex<Box<dyn DataStore>>,
    members: Mutex<Vec<Weak<dyn AnyPersistedClass>>>,
}

impl Schema {
    /// Wrap and connect a freshly created store.
    pub(crate) fn new(name: impl Into<String>, mut store: Box<dyn DataStore>) -> Result<Schema> {
        let name = name.into();
        store.connect()?;
        debug!("schema {} connected", name);
        Ok(Schema {
            name,
            store: Mutex::new(store),
            members: Mutex::new(vec![]),
        })
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    /// Register membership.  The schema holds only a back-reference; the engine's registry owns the class.
    pub(crate) fn add_persisted_class(&self, class: &Arc<dyn AnyPersistedClass>) {
        let mut members = self.members.lock().expect("schema members lock poisoned");
        members.push(Arc::downgrade(class));
    }

    /// Tables of the types registered under this schema, for inspection.
    pub fn member_tables(&self) -> Vec<String> {
        let members = self.members.lock().expect("schema members lock poisoned");
        members
            .iter()
            .filter_map(|m| m.upgrade())
            .map(|c| c.get_descriptor().get_table_name().to_string())
            .collect()
    }

    /// Run one backend interaction under the schema's store lock.
    pub(crate) fn with_store<R>(
        &self,
        f: impl FnOnce(&mut dyn DataStore) -> Result<R>,
    ) -> Result<R> {
        let mut store = self.store.lock().expect("schema store lock poisoned");
        f(&mut **store)
    }

    /// Disconnect the owned store.  Idempotent.
    pub fn disconnect(&self) {
        let mut store = self.store.lock().expect("schema store lock poisoned");
        store.disconnect();
        debug!("schema {} disconnected", self.name);
    }
}
