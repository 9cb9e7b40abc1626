//! Schema migration.
//!
//! A type's [MigrationDescriptor] declares its live schema version plus an ordered list of steps.  The version a
//! table actually sits at is recorded in a per-schema `versions` bookkeeping table, managed through the same
//! [DataStore] contract as everything else.  When the recorded version lags the live one, the engine applies the
//! single lowest pending step and re-records; a type that is several steps behind converges over successive passes
//! instead of attempting one big-bang transform.
//!
//! Strategies:
//!
//! - Automatic: back the table up in memory, drop, re-create with the new layout, restore by column name.  Columns
//!   that no longer exist are discarded; new columns take their defaults.  The backup is validated before anything
//!   is dropped.
//! - Reset: the contents are derived/regenerable; drop and re-create empty.
//! - Custom: a caller-supplied transform maps the old table to the rows to write; the engine does not interpret it.
use std::fmt;
use std::sync::Arc;

use itertools::Itertools;
use log::*;

use crate::descriptor::{ColumnDescriptor, ColumnType, EntityDescriptor};
use crate::errors::{PersistError, Result};
use crate::store::DataStore;
use crate::table::{ColumnValue, DataTable, Row};

/// Name of the per-schema bookkeeping table recording each table's schema version.
pub(crate) const VERSIONS_TABLE: &str = "versions";

/// A caller-supplied table transform for custom steps.
pub type MigrationHandler = Arc<dyn Fn(&DataTable) -> anyhow::Result<DataTable> + Send + Sync>;

#[derive(Clone)]
pub enum MigrationStrategy {
    Automatic,
    Reset,
    Custom(MigrationHandler),
}

impl fmt::Debug for MigrationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MigrationStrategy::Automatic => write!(f, "Automatic"),
            MigrationStrategy::Reset => write!(f, "Reset"),
            MigrationStrategy::Custom(_) => write!(f, "Custom"),
        }
    }
}

/// One versioned transformation.
#[derive(Clone, Debug)]
pub struct MigrationStep {
    target_version: i64,
    strategy: MigrationStrategy,
}

impl MigrationStep {
    pub fn automatic(target_version: i64) -> MigrationStep {
        MigrationStep {
            target_version,
            strategy: MigrationStrategy::Automatic,
        }
    }

    pub fn reset(target_version: i64) -> MigrationStep {
        MigrationStep {
            target_version,
            strategy: MigrationStrategy::Reset,
        }
    }

    pub fn custom(
        target_version: i64,
        handler: impl Fn(&DataTable) -> anyhow::Result<DataTable> + Send + Sync + 'static,
    ) -> MigrationStep {
        MigrationStep {
            target_version,
            strategy: MigrationStrategy::Custom(Arc::new(handler)),
        }
    }

    pub fn get_target_version(&self) -> i64 {
        self.target_version
    }

    pub fn get_strategy(&self) -> &MigrationStrategy {
        &self.strategy
    }
}

/// The ordered migration plan attached to a type.
#[derive(Clone, Debug)]
pub struct MigrationDescriptor {
    live_version: i64,
    steps: Vec<MigrationStep>,
}

impl MigrationDescriptor {
    /// Unversioned tables sit at version 1, so steps start at 2 and must rise monotonically up to the live
    /// version.
    pub fn new(live_version: i64, steps: Vec<MigrationStep>) -> Result<MigrationDescriptor> {
        if live_version < 1 {
            return Err(PersistError::invalid("migration", "live version must be at least 1"));
        }
        let mut previous = 1;
        for step in &steps {
            if step.target_version <= previous {
                return Err(PersistError::invalid(
                    "migration",
                    "step versions must increase monotonically from 2",
                ));
            }
            previous = step.target_version;
        }
        if previous > live_version {
            return Err(PersistError::invalid(
                "migration",
                "steps may not pass the live version",
            ));
        }
        Ok(MigrationDescriptor {
            live_version,
            steps,
        })
    }

    pub fn get_live_version(&self) -> i64 {
        self.live_version
    }

    pub fn get_steps(&self) -> &[MigrationStep] {
        &self.steps
    }

    /// The one step to run when the stored version is `stored`: the lowest step above it.
    fn next_step(&self, stored: i64) -> Option<&MigrationStep> {
        self.steps.iter().find(|s| s.target_version > stored)
    }
}

fn versions_layout() -> Result<Vec<ColumnDescriptor>> {
    Ok(vec![
        ColumnDescriptor::new("name", ColumnType::Text, true, false)?,
        ColumnDescriptor::new("version", ColumnType::Integer, false, false)?,
    ])
}

/// The version recorded for `table`, or None if nothing was ever recorded.
pub(crate) fn stored_version(store: &dyn DataStore, table: &str) -> Result<Option<i64>> {
    if !store.table_exists(VERSIONS_TABLE)? {
        return Ok(None);
    }
    let mut versions = DataTable::new(VERSIONS_TABLE, versions_layout()?);
    store.load(&mut versions)?;
    for row in versions.get_rows() {
        if row.get(0) == Some(&ColumnValue::Text(table.to_string())) {
            if let Some(ColumnValue::Integer(v)) = row.get(1) {
                return Ok(Some(*v));
            }
        }
    }
    Ok(None)
}

pub(crate) fn record_version(store: &mut dyn DataStore, table: &str, version: i64) -> Result<()> {
    let mut versions = DataTable::new(VERSIONS_TABLE, versions_layout()?);
    if !store.table_exists(VERSIONS_TABLE)? {
        store.create(&versions)?;
    }
    versions.push_row(
        [
            ColumnValue::Text(table.to_string()),
            ColumnValue::Integer(version),
        ]
        .into_iter()
        .collect(),
    )?;
    store.save(&versions)
}

fn create_all(store: &mut dyn DataStore, descriptor: &EntityDescriptor) -> Result<()> {
    store.create(&DataTable::for_entity(descriptor))?;
    for sub in descriptor.get_sub_tables() {
        store.create(&DataTable::for_sub_table(sub))?;
    }
    Ok(())
}

/// Bring an entity's tables into existence and towards the live schema version, applying at most one migration
/// step.  Returns whether the tables are now current; a false return means another pass is needed.
pub(crate) fn ensure_tables(
    store: &mut dyn DataStore,
    descriptor: &EntityDescriptor,
    migration: Option<&MigrationDescriptor>,
) -> Result<bool> {
    let table = descriptor.get_table_name();
    let live = migration.map(|m| m.get_live_version()).unwrap_or(1);

    if store.is_read_only() {
        debug!("{}: read-only store, skipping schema checks", descriptor.qualified_name());
        return Ok(true);
    }

    if !store.table_exists(table)? {
        create_all(store, descriptor)?;
        record_version(store, table, live)?;
        info!("created {} at version {}", descriptor.qualified_name(), live);
        return Ok(true);
    }

    // A pre-existing main table may still be missing sub-tables for newly declared list fields.
    for sub in descriptor.get_sub_tables() {
        if !store.table_exists(sub.get_table_name())? {
            store.create(&DataTable::for_sub_table(sub))?;
        }
    }

    let stored = stored_version(store, table)?.unwrap_or(1);
    if stored >= live {
        if stored > live {
            warn!(
                "{}: stored version {} is ahead of declared version {}",
                descriptor.qualified_name(),
                stored,
                live
            );
        }
        return Ok(true);
    }

    let step = match migration.and_then(|m| m.next_step(stored)) {
        Some(step) => step,
        None => {
            // Behind but with no step covering the gap; nothing we can run, so just mark it.
            record_version(store, table, live)?;
            return Ok(true);
        }
    };

    info!(
        "{}: migrating from version {} to {} ({:?})",
        descriptor.qualified_name(),
        stored,
        step.get_target_version(),
        step.get_strategy()
    );
    apply_step(store, descriptor, step)?;
    record_version(store, table, step.get_target_version())?;
    Ok(step.get_target_version() >= live)
}

fn failed(descriptor: &EntityDescriptor, step: &MigrationStep, reason: impl Into<String>) -> PersistError {
    PersistError::migration(
        descriptor.qualified_name(),
        step.get_target_version(),
        reason,
    )
}

fn apply_step(
    store: &mut dyn DataStore,
    descriptor: &EntityDescriptor,
    step: &MigrationStep,
) -> Result<()> {
    let table = descriptor.get_table_name();

    match step.get_strategy() {
        MigrationStrategy::Automatic => {
            let backup = backup_table(store, descriptor, step)?;
            let restored = remap_rows(&backup, descriptor);
            store
                .drop_table(table)
                .map_err(|e| failed(descriptor, step, e.to_string()))?;
            store
                .create(&DataTable::for_entity(descriptor))
                .map_err(|e| failed(descriptor, step, e.to_string()))?;
            store
                .save(&restored)
                .map_err(|e| failed(descriptor, step, e.to_string()))?;
        }
        MigrationStrategy::Reset => {
            store
                .drop_table(table)
                .map_err(|e| failed(descriptor, step, e.to_string()))?;
            store
                .create(&DataTable::for_entity(descriptor))
                .map_err(|e| failed(descriptor, step, e.to_string()))?;
            for sub in descriptor.get_sub_tables() {
                if store
                    .table_exists(sub.get_table_name())
                    .map_err(|e| failed(descriptor, step, e.to_string()))?
                {
                    store
                        .drop_table(sub.get_table_name())
                        .map_err(|e| failed(descriptor, step, e.to_string()))?;
                }
                store
                    .create(&DataTable::for_sub_table(sub))
                    .map_err(|e| failed(descriptor, step, e.to_string()))?;
            }
        }
        MigrationStrategy::Custom(handler) => {
            let backup = backup_table(store, descriptor, step)?;
            let produced = handler(&backup)
                .map_err(|e| failed(descriptor, step, format!("transform failed: {:#}", e)))?;
            if produced.get_name() != table {
                return Err(failed(
                    descriptor,
                    step,
                    format!("transform returned table {}", produced.get_name()),
                ));
            }
            store
                .drop_table(table)
                .map_err(|e| failed(descriptor, step, e.to_string()))?;
            store
                .create(&DataTable::for_entity(descriptor))
                .map_err(|e| failed(descriptor, step, e.to_string()))?;
            store
                .save(&produced)
                .map_err(|e| failed(descriptor, step, e.to_string()))?;
        }
    }

    Ok(())
}

/// Load the table in its *stored* shape, failing before anything destructive if the backup looks unusable.
fn backup_table(
    store: &dyn DataStore,
    descriptor: &EntityDescriptor,
    step: &MigrationStep,
) -> Result<DataTable> {
    let table = descriptor.get_table_name();
    let header = store
        .table_header(table)
        .map_err(|e| failed(descriptor, step, e.to_string()))?;

    let key = descriptor.primary_key().get_name();
    if !header.iter().any(|c| c.get_name() == key) {
        return Err(failed(
            descriptor,
            step,
            format!("stored table has no {} column to key the backup on", key),
        ));
    }

    debug!(
        "{}: backing up columns {}",
        descriptor.qualified_name(),
        header.iter().map(|c| c.get_name()).join(", ")
    );
    let mut backup = DataTable::new(table, header);
    store
        .load(&mut backup)
        .map_err(|e| failed(descriptor, step, e.to_string()))?;
    Ok(backup)
}

/// Map backed-up rows onto the new layout by column name.  Values whose column vanished are discarded; new or
/// type-changed columns take their defaults.
fn remap_rows(backup: &DataTable, descriptor: &EntityDescriptor) -> DataTable {
    let mut out = DataTable::for_entity(descriptor);
    for row in backup.get_rows() {
        let mapped: Row = descriptor
            .get_columns()
            .iter()
            .map(|column| {
                backup
                    .get_columns()
                    .iter()
                    .position(|c| c.get_name() == column.get_name())
                    .and_then(|i| row.get(i))
                    .filter(|v| v.fits(column))
                    .cloned()
                    .unwrap_or_else(|| ColumnValue::default_for(column))
            })
            .collect();
        // Arity matches by construction.
        let _ = out.push_row(mapped);
    }
    out
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::descriptor::EntityBuilder;
    use crate::memory_store::MemoryStore;

    fn v1_descriptor() -> EntityDescriptor {
        let mut b = EntityBuilder::new("test", "widget");
        b.add_integer_column("id", true, false).unwrap();
        b.add_text_column("old_label", false, false).unwrap();
        b.build().unwrap()
    }

    fn v2_descriptor() -> EntityDescriptor {
        let mut b = EntityBuilder::new("test", "widget");
        b.add_integer_column("id", true, false).unwrap();
        b.add_text_column("label", false, false).unwrap();
        b.build().unwrap()
    }

    fn seeded_store() -> MemoryStore {
        let mut store = MemoryStore::new("test");
        store.connect().unwrap();
        let desc = v1_descriptor();
        store.create(&DataTable::for_entity(&desc)).unwrap();
        let mut rows = DataTable::for_entity(&desc);
        rows.push_row(
            [ColumnValue::Integer(1), ColumnValue::Text("one".into())]
                .into_iter()
                .collect(),
        )
        .unwrap();
        store.save(&rows).unwrap();
        record_version(&mut store, "widget", 1).unwrap();
        store
    }

    #[test]
    fn descriptor_validation() {
        assert!(MigrationDescriptor::new(0, vec![]).is_err());
        assert!(MigrationDescriptor::new(1, vec![]).is_ok());
        assert!(MigrationDescriptor::new(3, vec![MigrationStep::automatic(2)]).is_ok());
        // Steps out of order, duplicated, or past the live version.
        assert!(MigrationDescriptor::new(
            3,
            vec![MigrationStep::automatic(3), MigrationStep::automatic(2)]
        )
        .is_err());
        assert!(MigrationDescriptor::new(
            3,
            vec![MigrationStep::automatic(2), MigrationStep::automatic(2)]
        )
        .is_err());
        assert!(MigrationDescriptor::new(2, vec![MigrationStep::automatic(3)]).is_err());
    }

    #[test]
    fn version_bookkeeping() {
        let mut store = MemoryStore::new("test");
        store.connect().unwrap();
        assert_eq!(stored_version(&store, "widget").unwrap(), None);
        record_version(&mut store, "widget", 2).unwrap();
        record_version(&mut store, "other", 5).unwrap();
        record_version(&mut store, "widget", 3).unwrap();
        assert_eq!(stored_version(&store, "widget").unwrap(), Some(3));
        assert_eq!(stored_version(&store, "other").unwrap(), Some(5));
    }

    #[test]
    fn creates_fresh_tables_at_live_version() {
        let mut store = MemoryStore::new("test");
        store.connect().unwrap();
        let desc = v2_descriptor();
        let migration = MigrationDescriptor::new(2, vec![MigrationStep::automatic(2)]).unwrap();

        assert!(ensure_tables(&mut store, &desc, Some(&migration)).unwrap());
        assert!(store.table_exists("widget").unwrap());
        assert_eq!(stored_version(&store, "widget").unwrap(), Some(2));
    }

    #[test]
    fn automatic_step_remaps_by_name() {
        let mut store = seeded_store();
        let desc = v2_descriptor();
        let migration = MigrationDescriptor::new(2, vec![MigrationStep::automatic(2)]).unwrap();

        assert!(ensure_tables(&mut store, &desc, Some(&migration)).unwrap());
        assert_eq!(stored_version(&store, "widget").unwrap(), Some(2));

        let mut loaded = DataTable::for_entity(&desc);
        store.load(&mut loaded).unwrap();
        assert_eq!(loaded.get_rows().len(), 1);
        // id survives by name, old_label is discarded, label takes its default.
        assert_eq!(loaded.get_rows()[0].get(0), Some(&ColumnValue::Integer(1)));
        assert_eq!(loaded.get_rows()[0].get(1), Some(&ColumnValue::Text(String::new())));
    }

    #[test]
    fn reset_step_drops_data() {
        let mut store = seeded_store();
        let desc = v2_descriptor();
        let migration = MigrationDescriptor::new(2, vec![MigrationStep::reset(2)]).unwrap();

        assert!(ensure_tables(&mut store, &desc, Some(&migration)).unwrap());
        assert_eq!(store.row_count("widget"), Some(0));
        assert_eq!(stored_version(&store, "widget").unwrap(), Some(2));
    }

    #[test]
    fn custom_step_writes_the_transform_output() {
        let mut store = seeded_store();
        let desc = v2_descriptor();
        let migration = MigrationDescriptor::new(
            2,
            vec![MigrationStep::custom(2, |old: &DataTable| {
                let mut out = DataTable::new(
                    "widget",
                    vec![
                        ColumnDescriptor::new("id", ColumnType::Integer, true, false)?,
                        ColumnDescriptor::new("label", ColumnType::Text, false, false)?,
                    ],
                );
                for row in old.get_rows() {
                    let id = row.get(0).cloned().unwrap_or(ColumnValue::Integer(0));
                    let label = match row.get(1) {
                        Some(ColumnValue::Text(s)) => format!("migrated {}", s),
                        _ => "migrated".to_string(),
                    };
                    out.push_row([id, ColumnValue::Text(label)].into_iter().collect())?;
                }
                Ok(out)
            })],
        )
        .unwrap();

        assert!(ensure_tables(&mut store, &desc, Some(&migration)).unwrap());

        let mut loaded = DataTable::for_entity(&desc);
        store.load(&mut loaded).unwrap();
        assert_eq!(
            loaded.get_rows()[0].get(1),
            Some(&ColumnValue::Text("migrated one".into()))
        );
    }

    #[test]
    fn one_step_per_pass() {
        let mut store = seeded_store();
        let desc = v2_descriptor();
        let migration = MigrationDescriptor::new(
            3,
            vec![MigrationStep::automatic(2), MigrationStep::automatic(3)],
        )
        .unwrap();

        // First pass: only step 2 runs.
        assert!(!ensure_tables(&mut store, &desc, Some(&migration)).unwrap());
        assert_eq!(stored_version(&store, "widget").unwrap(), Some(2));

        // Second pass converges.
        assert!(ensure_tables(&mut store, &desc, Some(&migration)).unwrap());
        assert_eq!(stored_version(&store, "widget").unwrap(), Some(3));

        // Third pass is a no-op.
        assert!(ensure_tables(&mut store, &desc, Some(&migration)).unwrap());
    }

    #[test]
    fn failing_transform_leaves_the_table_alone() {
        let mut store = seeded_store();
        let desc = v2_descriptor();
        let migration = MigrationDescriptor::new(
            2,
            vec![MigrationStep::custom(2, |_old: &DataTable| {
                anyhow::bail!("nope")
            })],
        )
        .unwrap();

        let err = ensure_tables(&mut store, &desc, Some(&migration)).unwrap_err();
        assert!(matches!(err, PersistError::Migration { version: 2, .. }));
        // The transform failed before anything was dropped.
        assert_eq!(store.row_count("widget"), Some(1));
        assert_eq!(stored_version(&store, "widget").unwrap(), Some(1));
    }
}
