//! The error taxonomy.
//!
//! Three things can go wrong: a type's declared layout is unusable (`InvalidType`), the backing store refused an
//! operation (`Backend`), or a migration step died partway (`Migration`).  A lookup that finds nothing is not an
//! error anywhere in this crate; those paths return `Option`/empty instead.

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PersistError {
    /// The type's declarative metadata is missing something or contradicts itself, or an instance of the type
    /// could not be mapped onto its declared columns.  Fatal to registering/storing that type, harmless to the
    /// process.
    #[error("{entity} cannot be persisted: {reason}")]
    InvalidType { entity: String, reason: String },

    /// The backing store reported a failure.  Not retried automatically; the caller decides.
    #[error("backend failure during {op}: {detail}")]
    Backend { op: &'static str, detail: String },

    /// A migration step failed.  Nothing is dropped before the backup is validated, so the table is left in its
    /// pre-migration state unless the backend itself failed mid-write.
    #[error("migration of {table} to version {version} failed: {reason}")]
    Migration {
        table: String,
        version: i64,
        reason: String,
    },
}

impl PersistError {
    pub(crate) fn invalid(entity: impl Into<String>, reason: impl Into<String>) -> PersistError {
        PersistError::InvalidType {
            entity: entity.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn backend(op: &'static str, detail: impl Into<String>) -> PersistError {
        PersistError::Backend {
            op,
            detail: detail.into(),
        }
    }

    pub(crate) fn migration(
        table: impl Into<String>,
        version: i64,
        reason: impl Into<String>,
    ) -> PersistError {
        PersistError::Migration {
            table: table.into(),
            version,
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = PersistError> = std::result::Result<T, E>;
