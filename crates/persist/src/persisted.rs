//! The trait application types implement to become persistable.
//!
//! This is the declarative metadata the engine reads off a type: where reflection-based systems would scan
//! annotations at runtime, a Rust type hands over an explicit [EntityDescriptor] (and, optionally, a migration plan
//! and references to other persisted types).  The engine calls these once, at registration, and caches the result.
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::descriptor::EntityDescriptor;
use crate::engine::Engine;
use crate::errors::Result;
use crate::migration::MigrationDescriptor;

pub trait Persisted: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// The type's storage layout.  Called once; failures abort registration with
    /// [crate::PersistError::InvalidType].
    fn descriptor() -> Result<EntityDescriptor>;

    /// The type's migration plan, if its shape has changed across versions.
    fn migrations() -> Result<Option<MigrationDescriptor>> {
        Ok(None)
    }

    /// Other persisted types this one refers to (foreign-key-style fields).  Resolved after registration, in a
    /// second pass, so two mutually referencing types can each find the other already registered.
    fn references() -> Vec<TypeRef> {
        Vec::new()
    }
}

/// A deferred link to another persisted type.
///
/// Holds a monomorphized registration hook rather than a live class reference; resolving it registers the referee
/// if nothing else has yet.
pub struct TypeRef {
    name: &'static str,
    register: fn(&Engine) -> Result<()>,
}

impl TypeRef {
    pub fn to<T: Persisted>() -> TypeRef {
        fn register<T: Persisted>(engine: &Engine) -> Result<()> {
            engine.get_persisted_class::<T>().map(|_| ())
        }
        TypeRef {
            name: std::any::type_name::<T>(),
            register: register::<T>,
        }
    }

    pub fn get_name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn resolve(&self, engine: &Engine) -> Result<()> {
        (self.register)(engine)
    }
}
