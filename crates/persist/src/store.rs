//! The storage-backend contract.
//!
//! One [DataStore] instance serves one schema (namespace).  The engine talks to stores exclusively through this
//! trait, so file-backed, SQL-backed, and in-memory implementations are interchangeable; this crate ships only the
//! in-memory one ([crate::MemoryStore]).
//!
//! All mutating operations report failure through `Result` rather than panicking, so the engine can apply one
//! retry/skip policy across backend kinds.  A store may be read-only; callers are expected to check
//! [DataStore::is_read_only] or accept that writes silently do nothing.
use std::path::Path;

use crate::descriptor::ColumnDescriptor;
use crate::errors::Result;
use crate::table::{DataTable, Key};

pub trait DataStore: Send {
    /// Connect to whatever this store fronts.  Called once when the owning schema is created.
    fn connect(&mut self) -> Result<()>;

    /// Disconnect.  Idempotent; operations after a disconnect fail.
    fn disconnect(&mut self);

    /// Whether the store refuses writes.  Mutating calls on a read-only store are no-ops.
    fn is_read_only(&self) -> bool {
        false
    }

    fn table_exists(&self, name: &str) -> Result<bool>;

    /// Create a table with the given layout.  Check [DataStore::table_exists] first; creating a table twice is an
    /// error.
    fn create(&mut self, table: &DataTable) -> Result<()>;

    /// Completely drop a table, allowing it to be re-created.
    fn drop_table(&mut self, name: &str) -> Result<()>;

    /// The column layout of an existing table, without loading any data.  This is how migration discovers the shape
    /// of a legacy table.
    fn table_header(&self, name: &str) -> Result<Vec<ColumnDescriptor>>;

    /// Fill `table` with every stored row, projected onto `table`'s column layout by name.
    fn load(&self, table: &mut DataTable) -> Result<()>;

    /// Upsert `table`'s rows, matching on the full composite primary key.  Assumes the table exists.
    fn save(&mut self, table: &DataTable) -> Result<()>;

    /// Delete every stored row *not* present in `table`.  Presence is judged by composite primary key; `table` is a
    /// keep-set, not a payload.
    fn clear(&mut self, table: &DataTable) -> Result<()>;

    /// Delete stored rows whose primary id (first primary-key column) is in `ids` and whose composite key is not
    /// present in `table`.  Rows present in `table` always survive, whatever `ids` says.  This is how list
    /// sub-tables shed elements removed from surviving parents.
    fn clear_ids(&mut self, table: &DataTable, ids: &[Key]) -> Result<()>;
}

/// Creates one store per schema name.  Injected into the engine at construction so the engine itself never names a
/// concrete backend.
pub trait StoreFactory: Send + Sync {
    fn open(&self, root: &Path, schema: &str) -> Result<Box<dyn DataStore>>;
}

impl<F> StoreFactory for F
where
    F: Fn(&Path, &str) -> Result<Box<dyn DataStore>> + Send + Sync,
{
    fn open(&self, root: &Path, schema: &str) -> Result<Box<dyn DataStore>> {
        self(root, schema)
    }
}
