//! Module-loading domains.
//!
//! A [`Domain`] groups the runtime modules loaded together and owns their
//! shared CommonJS module table. Each registered module occupies one
//! record of [`CJS_MODULE_SIZE`] consecutive values in an
//! [`ArrayStorage`]:
//!
//! ```text
//! cjs_modules: ArrayStorage
//! ┌────────────────┬────────┬────────────────┬────────────────┬─────
//! │ cached exports │ module │ function index │ runtime module │ ...
//! │ EMPTY until    │ NULL   │ native u32     │ native u32     │
//! │ first require  │        │                │                │
//! └────────────────┴────────┴────────────────┴────────────────┴─────
//!   record for module 0                                         module 1
//! ```
//!
//! Dynamically required modules are keyed by their filename symbol and
//! assigned ids in import order; statically resolved modules arrive with
//! their id already chosen. A record whose function index is empty is
//! unregistered.
//!
//! Runtime modules hold only a weak reference back to their domain, and
//! their template caches hold weak values. The domain reports both from
//! its `mark_weak` hook.

use std::collections::hash_map::Entry;
use std::mem::offset_of;
use std::ptr::NonNull;

use ember_gc::cell::{heap_align_size, FinalizeContext};
use ember_gc::metadata::MetadataBuilder;
use ember_gc::{
    CellKind, CellLayout, CellRef, GcCell, GcPointer, Heap, Value, VTable, WeakRef, WeakRefAcceptor,
    WeakRefLock, WeakValueMap,
};
use rustc_hash::FxHashMap;

use super::PlainObject;
use crate::barrier::store_pointer;
use crate::error::{RuntimeError, RuntimeResult};
use crate::types::ArrayStorage;

/// Values per module record in the CommonJS module table.
pub const CJS_MODULE_SIZE: u32 = 4;

/// Offset of the cached `module.exports` within a record.
pub const CACHED_EXPORTS_OFFSET: u32 = 0;
/// Offset of the `module` object within a record.
pub const MODULE_OFFSET: u32 = 1;
/// Offset of the module function's index within a record.
pub const FUNCTION_INDEX_OFFSET: u32 = 2;
/// Offset of the owning runtime module's index within a record.
pub const RUNTIME_MODULE_OFFSET: u32 = 3;

// =============================================================================
// Runtime modules
// =============================================================================

/// A unit of loaded code owned by a [`Domain`].
pub struct RuntimeModule {
    id: u32,
    domain: WeakRef<Domain>,
    template_cache: WeakValueMap<u32, PlainObject>,
}

impl RuntimeModule {
    /// Embedder-assigned module id.
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The owning domain, while it is alive.
    pub fn domain(&self, lock: &WeakRefLock<'_>) -> Option<CellRef<Domain>> {
        self.domain.get(lock)
    }

    /// The cached object template for `key`, if it is still alive.
    pub fn cached_template(&self, lock: &WeakRefLock<'_>, key: u32) -> Option<CellRef<PlainObject>> {
        self.template_cache.lookup(lock, &key)
    }

    /// Cache `template` under `key` unless a live template is cached.
    ///
    /// Returns whether the cache changed.
    pub fn cache_template(
        &mut self,
        lock: &mut WeakRefLock<'_>,
        key: u32,
        template: CellRef<PlainObject>,
    ) -> bool {
        self.template_cache.insert_new(lock, key, template)
    }

    /// The template cache.
    pub fn template_cache(&self) -> &WeakValueMap<u32, PlainObject> {
        &self.template_cache
    }

    fn malloc_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.template_cache.native_size()
    }
}

impl std::fmt::Debug for RuntimeModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeModule")
            .field("id", &self.id)
            .field("domain", &self.domain)
            .field("templates", &self.template_cache.len())
            .finish()
    }
}

// =============================================================================
// Domain
// =============================================================================

/// Shared module state for a group of runtime modules.
#[repr(C)]
pub struct Domain {
    header: GcCell,
    cjs_modules: GcPointer,
    throwing_require: GcPointer,
    cjs_entry_module_id: Option<u32>,
    cjs_module_table: FxHashMap<u32, u32>,
    runtime_modules: Vec<Box<RuntimeModule>>,
}

impl Domain {
    /// Allocate an empty domain.
    pub fn create(heap: &mut Heap) -> RuntimeResult<CellRef<Self>> {
        let domain = heap.alloc_fixed(Domain {
            header: GcCell::uninit(),
            cjs_modules: GcPointer::NULL,
            throwing_require: GcPointer::NULL,
            cjs_entry_module_id: None,
            cjs_module_table: FxHashMap::default(),
            runtime_modules: Vec::new(),
        })?;
        tracing::trace!(domain = ?domain.as_cell(), "created domain");
        Ok(domain)
    }

    // =========================================================================
    // Runtime modules
    // =========================================================================

    /// Take ownership of a new runtime module and return its index.
    pub fn add_runtime_module(mut this: CellRef<Self>, lock: &mut WeakRefLock<'_>, id: u32) -> u32 {
        let module = Box::new(RuntimeModule {
            id,
            domain: WeakRef::new(lock, this),
            template_cache: WeakValueMap::new(),
        });
        this.runtime_modules.push(module);
        (this.runtime_modules.len() - 1) as u32
    }

    /// Number of owned runtime modules.
    #[inline]
    pub fn runtime_module_count(&self) -> usize {
        self.runtime_modules.len()
    }

    /// The runtime module at `index`.
    pub fn runtime_module(&self, index: u32) -> Option<&RuntimeModule> {
        self.runtime_modules.get(index as usize).map(Box::as_ref)
    }

    /// Mutable access to the runtime module at `index`.
    pub fn runtime_module_mut(&mut self, index: u32) -> Option<&mut RuntimeModule> {
        self.runtime_modules.get_mut(index as usize).map(Box::as_mut)
    }

    // =========================================================================
    // CommonJS module table
    // =========================================================================

    /// The module record storage, once any table was imported.
    pub fn cjs_modules(&self) -> Option<CellRef<ArrayStorage>> {
        // SAFETY: the slot only ever holds an ArrayStorage.
        self.cjs_modules
            .get()
            .map(|cell| unsafe { CellRef::from_cell_unchecked(cell) })
    }

    /// The object handed to modules in place of `require` when dynamic
    /// requires are unsupported.
    #[inline]
    pub fn throwing_require(&self) -> Option<NonNull<GcCell>> {
        self.throwing_require.get()
    }

    /// Id of the first module registered in this domain.
    #[inline]
    pub fn cjs_entry_module_id(&self) -> Option<u32> {
        self.cjs_entry_module_id
    }

    /// Id of the dynamically required module named by `filename`.
    pub fn cjs_module_id(&self, filename: u32) -> Option<u32> {
        self.cjs_module_table.get(&filename).copied()
    }

    /// Index of module `id`'s record in [`cjs_modules`](Self::cjs_modules).
    #[inline]
    pub const fn cjs_module_offset(id: u32) -> u32 {
        id * CJS_MODULE_SIZE
    }

    /// Number of module records, registered or not.
    pub fn cjs_module_count(&self) -> u32 {
        self.cjs_modules().map_or(0, |modules| modules.len() / CJS_MODULE_SIZE)
    }

    /// Whether module `id` has a record with a function index.
    pub fn is_module_registered(&self, id: u32) -> bool {
        self.cjs_modules()
            .is_some_and(|modules| Self::record_is_registered(&modules, id))
    }

    fn record_field(&self, id: u32, field: u32) -> Option<Value> {
        let index = u64::from(id) * u64::from(CJS_MODULE_SIZE) + u64::from(field);
        let index = u32::try_from(index).ok()?;
        self.cjs_modules()?.get(index).filter(|value| !value.is_empty())
    }

    /// Index of module `id`'s function.
    pub fn cjs_module_function_index(&self, id: u32) -> Option<u32> {
        self.record_field(id, FUNCTION_INDEX_OFFSET)
            .and_then(Value::as_native_u32)
    }

    /// Index of the runtime module that registered module `id`.
    pub fn cjs_module_runtime_module(&self, id: u32) -> Option<u32> {
        self.record_field(id, RUNTIME_MODULE_OFFSET)
            .and_then(Value::as_native_u32)
    }

    /// Cached `module.exports` of module `id`, once it has been required.
    pub fn cjs_module_exports(&self, id: u32) -> Option<Value> {
        self.record_field(id, CACHED_EXPORTS_OFFSET)
    }

    /// Cache `module.exports` of a registered module.
    pub fn set_cjs_module_exports(&mut self, heap: &Heap, id: u32, exports: Value) -> RuntimeResult<()> {
        match self.cjs_modules() {
            Some(mut modules) if Self::record_is_registered(&modules, id) => {
                modules.set(heap, Self::cjs_module_offset(id) + CACHED_EXPORTS_OFFSET, exports)
            }
            _ => Err(RuntimeError::IndexOutOfBounds {
                index: id,
                len: self.cjs_module_count(),
            }),
        }
    }

    fn record_is_registered(modules: &ArrayStorage, id: u32) -> bool {
        let index = u64::from(id) * u64::from(CJS_MODULE_SIZE) + u64::from(FUNCTION_INDEX_OFFSET);
        u32::try_from(index)
            .ok()
            .and_then(|index| modules.get(index))
            .is_some_and(|value| !value.is_empty())
    }

    /// Storage length covering `modules` records.
    fn record_slots(modules: u64) -> RuntimeResult<u32> {
        let slots = modules.saturating_mul(u64::from(CJS_MODULE_SIZE));
        u32::try_from(slots)
            .ok()
            .filter(|&slots| slots <= ArrayStorage::MAX_CAPACITY)
            .ok_or(RuntimeError::TooManySlots {
                requested: slots,
                max: u64::from(ArrayStorage::MAX_CAPACITY),
            })
    }

    /// Register the CommonJS modules of runtime module `runtime_module`.
    ///
    /// `dynamic` maps filename symbols to function indices; symbols already
    /// present keep their earlier module. `statics` maps pre-assigned
    /// module ids to function indices; ids that are already registered are
    /// skipped. The first module registered becomes the entry module.
    pub fn import_cjs_module_table(
        mut this: CellRef<Self>,
        heap: &mut Heap,
        runtime_module: u32,
        dynamic: &[(u32, u32)],
        statics: &[(u32, u32)],
    ) -> RuntimeResult<()> {
        if runtime_module as usize >= this.runtime_modules.len() {
            return Err(RuntimeError::UnknownRuntimeModule(runtime_module));
        }
        if dynamic.is_empty() && statics.is_empty() {
            return Ok(());
        }

        let existing = this.cjs_module_count();
        let upper_bound = statics
            .iter()
            .map(|&(id, _)| u64::from(id) + 1)
            .fold(u64::from(existing) + dynamic.len() as u64, u64::max);
        let capacity = Self::record_slots(upper_bound)?;

        let mut modules = match this.cjs_modules() {
            Some(modules) => ArrayStorage::reserve(modules, heap, capacity)?,
            None => {
                let modules = ArrayStorage::create(heap, capacity)?;
                let require = PlainObject::create(heap, None)?;
                store_pointer(heap, &mut this.throwing_require, Some(require.as_cell()));
                modules
            }
        };

        let mut next_id = existing;
        let mut registered = 0usize;
        for &(filename, function) in dynamic {
            let id = match this.cjs_module_table.entry(filename) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(entry) => *entry.insert(next_id),
            };
            next_id += 1;
            modules = this.register_module(heap, modules, id, function, runtime_module)?;
            registered += 1;
        }
        for &(id, function) in statics {
            if Self::record_is_registered(&modules, id) {
                continue;
            }
            modules = this.register_module(heap, modules, id, function, runtime_module)?;
            registered += 1;
        }

        if this.cjs_modules.get() != Some(modules.as_cell()) {
            store_pointer(heap, &mut this.cjs_modules, Some(modules.as_cell()));
        }
        tracing::debug!(
            runtime_module,
            dynamic = dynamic.len(),
            statics = statics.len(),
            registered,
            records = modules.len() / CJS_MODULE_SIZE,
            "imported CommonJS module table"
        );
        Ok(())
    }

    fn register_module(
        &mut self,
        heap: &mut Heap,
        modules: CellRef<ArrayStorage>,
        id: u32,
        function: u32,
        runtime_module: u32,
    ) -> RuntimeResult<CellRef<ArrayStorage>> {
        let offset = Self::cjs_module_offset(id);
        let end = Self::record_slots(u64::from(id) + 1)?;
        let mut modules = if modules.len() < end {
            ArrayStorage::resize(modules, heap, end)?
        } else {
            modules
        };
        modules.set(heap, offset + CACHED_EXPORTS_OFFSET, Value::EMPTY)?;
        modules.set(heap, offset + MODULE_OFFSET, Value::NULL)?;
        modules.set(heap, offset + FUNCTION_INDEX_OFFSET, Value::native_u32(function))?;
        modules.set(heap, offset + RUNTIME_MODULE_OFFSET, Value::native_u32(runtime_module))?;
        self.cjs_entry_module_id.get_or_insert(id);
        Ok(modules)
    }
}

impl std::fmt::Debug for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Domain")
            .field("cjs_modules", &self.cjs_modules)
            .field("cjs_entry_module_id", &self.cjs_entry_module_id)
            .field("cjs_module_table", &self.cjs_module_table.len())
            .field("runtime_modules", &self.runtime_modules)
            .finish()
    }
}

// =============================================================================
// Cell description
// =============================================================================

fn domain_malloc_size(domain: &Domain) -> usize {
    domain.cjs_module_table.capacity() * std::mem::size_of::<(u32, u32)>()
        + domain.runtime_modules.capacity() * std::mem::size_of::<Box<RuntimeModule>>()
        + domain
            .runtime_modules
            .iter()
            .map(|module| module.malloc_size())
            .sum::<usize>()
}

unsafe fn domain_finalize(cell: NonNull<GcCell>, ctx: &mut FinalizeContext) {
    let this = cell.cast::<Domain>().as_ptr();
    let released = domain_malloc_size(unsafe { &*this });
    // SAFETY: the cell is dead and is not touched again.
    unsafe { std::ptr::drop_in_place(this) };
    ctx.release_native(released);
}

unsafe fn domain_mark_weak(cell: NonNull<GcCell>, acceptor: &mut dyn WeakRefAcceptor) {
    let this = unsafe { cell.cast::<Domain>().as_mut() };
    for module in &mut this.runtime_modules {
        acceptor.accept_weak_slot(module.domain.slot_mut());
        module.template_cache.mark_weak_refs(&mut *acceptor);
    }
}

unsafe fn domain_get_malloc_size(cell: NonNull<GcCell>) -> usize {
    domain_malloc_size(unsafe { cell.cast::<Domain>().as_ref() })
}

static DOMAIN_VTABLE: VTable = VTable::new(
    CellKind::Domain,
    heap_align_size(std::mem::size_of::<Domain>()) as u32,
)
.with_finalizer(domain_finalize)
.with_mark_weak(domain_mark_weak)
.with_malloc_size(domain_get_malloc_size);

unsafe impl CellLayout for Domain {
    const VTABLE: &'static VTable = &DOMAIN_VTABLE;

    fn build_metadata(builder: &mut MetadataBuilder) {
        builder
            .add_pointer(offset_of!(Domain, cjs_modules), "cjs_modules")
            .add_pointer(offset_of!(Domain, throwing_require), "throwing_require");
    }
}
