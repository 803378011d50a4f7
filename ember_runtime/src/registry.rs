//! The registry of every runtime cell kind.
//!
//! Heaps hosting runtime objects share one [`CellRegistry`], built on
//! first use and never torn down.

use std::sync::{Arc, OnceLock};

use ember_gc::{CellRegistry, Heap, HeapConfig, HeapError, RegistryError};

use crate::object::{DecoratedObject, Domain, HostObject, PlainObject};
use crate::types::ArrayStorage;

// =============================================================================
// Global Registry
// =============================================================================

/// Global registry singleton.
static RUNTIME_REGISTRY: OnceLock<Arc<CellRegistry>> = OnceLock::new();

/// Build a registry describing every runtime kind.
pub fn build_registry() -> Result<CellRegistry, RegistryError> {
    CellRegistry::builder()
        .register_layout::<ArrayStorage>()
        .register_layout::<PlainObject>()
        .register_layout::<DecoratedObject>()
        .register_layout::<HostObject>()
        .register_layout::<Domain>()
        .build()
}

/// The shared runtime registry.
///
/// # Panics
///
/// Panics if the runtime kinds describe inconsistent layouts.
pub fn runtime_registry() -> Arc<CellRegistry> {
    let registry = RUNTIME_REGISTRY.get_or_init(|| {
        let registry = build_registry()
            .unwrap_or_else(|err| panic!("runtime cell kinds are inconsistent: {err}"));
        tracing::debug!(kinds = registry.registered_kinds().count(), "built runtime cell registry");
        Arc::new(registry)
    });
    Arc::clone(registry)
}

/// Create a heap able to hold every runtime kind.
pub fn new_heap(config: HeapConfig) -> Result<Heap, HeapError> {
    Heap::new(config, runtime_registry())
}
