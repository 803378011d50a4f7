//! Kind-indexed vtable and metadata registry.
//!
//! The registry is built once, before any heap exists, and then shared
//! read-only. Lookups are a single array index by [`CellKind`].

use super::{CellKind, CellLayout, VTable};
use crate::error::RegistryError;
use crate::metadata::{Metadata, MetadataBuilder};

/// Fills in the slot description of one kind.
pub type BuildMetadataFn = fn(&mut MetadataBuilder);

#[derive(Debug)]
struct RegistryEntry {
    vtable: &'static VTable,
    metadata: Metadata,
}

/// Vtables and slot metadata for every registered kind.
#[derive(Debug)]
pub struct CellRegistry {
    entries: [Option<RegistryEntry>; CellKind::COUNT],
}

impl CellRegistry {
    /// Start assembling a registry.
    pub fn builder() -> CellRegistryBuilder {
        CellRegistryBuilder {
            entries: std::array::from_fn(|_| None),
            error: None,
        }
    }

    #[inline]
    fn entry(&self, kind: CellKind) -> &RegistryEntry {
        match &self.entries[kind.index()] {
            Some(entry) => entry,
            None => panic!("cell kind {kind} is not registered"),
        }
    }

    /// The vtable for `kind`.
    ///
    /// # Panics
    ///
    /// Panics if `kind` was never registered.
    #[inline]
    pub fn vtable(&self, kind: CellKind) -> &'static VTable {
        self.entry(kind).vtable
    }

    /// The slot metadata for `kind`.
    ///
    /// # Panics
    ///
    /// Panics if `kind` was never registered.
    #[inline]
    pub fn metadata(&self, kind: CellKind) -> &Metadata {
        &self.entry(kind).metadata
    }

    /// The vtable for `kind`, if registered.
    #[inline]
    pub fn try_vtable(&self, kind: CellKind) -> Option<&'static VTable> {
        self.entries[kind.index()].as_ref().map(|e| e.vtable)
    }

    /// Whether `kind` has been registered.
    #[inline]
    pub fn is_registered(&self, kind: CellKind) -> bool {
        self.entries[kind.index()].is_some()
    }

    /// Whether every kind has been registered.
    pub fn is_complete(&self) -> bool {
        self.entries.iter().all(Option::is_some)
    }

    /// Registered kinds in discriminant order.
    pub fn registered_kinds(&self) -> impl Iterator<Item = CellKind> + '_ {
        CellKind::ALL
            .into_iter()
            .filter(|kind| self.is_registered(*kind))
    }
}

/// Builder for [`CellRegistry`].
#[derive(Debug)]
pub struct CellRegistryBuilder {
    entries: [Option<RegistryEntry>; CellKind::COUNT],
    error: Option<RegistryError>,
}

impl CellRegistryBuilder {
    /// Register a cell type through its [`CellLayout`] implementation.
    pub fn register_layout<T: CellLayout>(self) -> Self {
        self.register(T::VTABLE, T::build_metadata)
    }

    /// Register a vtable with a metadata builder function.
    ///
    /// Errors are deferred to [`build`](Self::build).
    pub fn register(mut self, vtable: &'static VTable, build_metadata: BuildMetadataFn) -> Self {
        if self.error.is_some() {
            return self;
        }
        let slot = &mut self.entries[vtable.kind.index()];
        if slot.is_some() {
            self.error = Some(RegistryError::DuplicateKind(vtable.kind));
            return self;
        }

        let mut builder = MetadataBuilder::new();
        build_metadata(&mut builder);
        let metadata = builder.build();

        if !vtable.is_variable_size() {
            if let Some(offset) = metadata
                .slot_offsets()
                .iter()
                .map(|(kind, field)| field.offset + kind.slot_size() as u32)
                .max()
                .filter(|end| *end > vtable.size)
            {
                self.error = Some(RegistryError::SlotOutOfBounds {
                    kind: vtable.kind,
                    offset,
                    size: vtable.size,
                });
                return self;
            }
        }

        tracing::trace!(
            kind = %vtable.kind,
            slots = metadata.slot_offsets().len(),
            has_array = metadata.array().is_some(),
            "registered cell kind"
        );
        *slot = Some(RegistryEntry { vtable, metadata });
        self
    }

    /// Finish the registry.
    pub fn build(self) -> Result<CellRegistry, RegistryError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(CellRegistry {
                entries: self.entries,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static PLAIN: VTable = VTable::new(CellKind::PlainObject, 32);
    static PLAIN_AGAIN: VTable = VTable::new(CellKind::PlainObject, 48);
    static TINY: VTable = VTable::new(CellKind::HostObject, 16);
    static ARRAY: VTable = VTable::new(CellKind::ArrayStorage, 0);

    fn two_pointers(b: &mut MetadataBuilder) {
        b.add_pointer(16, "first").add_pointer(24, "second");
    }

    fn no_slots(_: &mut MetadataBuilder) {}

    #[test]
    fn test_lookup_registered_kind() {
        let registry = CellRegistry::builder()
            .register(&PLAIN, two_pointers)
            .build()
            .unwrap();
        assert!(registry.is_registered(CellKind::PlainObject));
        assert_eq!(registry.vtable(CellKind::PlainObject).size, 32);
        assert_eq!(registry.metadata(CellKind::PlainObject).slot_offsets().len(), 2);
        assert!(!registry.is_complete());
        assert!(registry.try_vtable(CellKind::Domain).is_none());
        assert_eq!(
            registry.registered_kinds().collect::<Vec<_>>(),
            vec![CellKind::PlainObject]
        );
    }

    #[test]
    fn test_duplicate_kind_rejected() {
        let err = CellRegistry::builder()
            .register(&PLAIN, no_slots)
            .register(&PLAIN_AGAIN, no_slots)
            .build()
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateKind(CellKind::PlainObject));
    }

    #[test]
    fn test_slot_beyond_fixed_size_rejected() {
        let err = CellRegistry::builder()
            .register(&TINY, two_pointers)
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::SlotOutOfBounds {
                kind: CellKind::HostObject,
                ..
            }
        ));
    }

    #[test]
    fn test_variable_size_kind_skips_bounds_check() {
        let registry = CellRegistry::builder()
            .register(&ARRAY, two_pointers)
            .build()
            .unwrap();
        assert!(registry.vtable(CellKind::ArrayStorage).is_variable_size());
    }

    #[test]
    #[should_panic(expected = "is not registered")]
    fn test_unregistered_lookup_panics() {
        let registry = CellRegistry::builder().build().unwrap();
        let _ = registry.vtable(CellKind::Domain);
    }
}
