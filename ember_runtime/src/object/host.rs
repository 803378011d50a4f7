//! Objects whose properties are served by the embedder.

use std::mem::offset_of;
use std::ptr::NonNull;

use ember_gc::cell::{heap_align_size, FinalizeContext};
use ember_gc::metadata::MetadataBuilder;
use ember_gc::{CellKind, CellLayout, CellRef, GcCell, GcPointer, Heap, Value, VTable};

use crate::barrier::store_pointer;
use crate::error::RuntimeResult;

/// Embedder callbacks backing a [`HostObject`].
///
/// The collector does not look inside a proxy, so values it returns or
/// stores must not be heap objects unless the embedder roots them.
pub trait HostObjectProxy {
    /// Read the property named by `name`.
    fn get(&mut self, name: u32) -> Value;

    /// Write the property named by `name`. Returns whether it was accepted.
    fn set(&mut self, name: u32, value: Value) -> bool;

    /// Names of the properties the proxy exposes.
    fn property_names(&self) -> Vec<u32>;

    /// Native bytes owned by the proxy.
    fn malloc_size(&self) -> usize {
        0
    }

    /// Called once when the owning object dies, before the proxy is dropped.
    fn finalize(&mut self) {}
}

/// An object forwarding property access to a [`HostObjectProxy`].
#[repr(C)]
pub struct HostObject {
    header: GcCell,
    prototype: GcPointer,
    proxy: Option<Box<dyn HostObjectProxy>>,
}

impl HostObject {
    /// Allocate a host object around `proxy`.
    pub fn create(
        heap: &mut Heap,
        prototype: Option<NonNull<GcCell>>,
        proxy: Box<dyn HostObjectProxy>,
    ) -> RuntimeResult<CellRef<Self>> {
        let obj = heap.alloc_fixed(HostObject {
            header: GcCell::uninit(),
            prototype: GcPointer::from_option(prototype),
            proxy: Some(proxy),
        })?;
        Ok(obj)
    }

    /// The prototype object.
    #[inline]
    pub fn prototype(&self) -> Option<NonNull<GcCell>> {
        self.prototype.get()
    }

    /// Replace the prototype.
    pub fn set_prototype(&mut self, heap: &Heap, prototype: Option<NonNull<GcCell>>) {
        store_pointer(heap, &mut self.prototype, prototype);
    }

    /// The proxy.
    pub fn proxy(&self) -> Option<&dyn HostObjectProxy> {
        self.proxy.as_deref()
    }

    /// Read a property through the proxy.
    pub fn get(&mut self, name: u32) -> Value {
        self.proxy.as_mut().map_or(Value::UNDEFINED, |proxy| proxy.get(name))
    }

    /// Write a property through the proxy.
    pub fn set(&mut self, name: u32, value: Value) -> bool {
        self.proxy.as_mut().is_some_and(|proxy| proxy.set(name, value))
    }

    /// Property names exposed by the proxy.
    pub fn property_names(&self) -> Vec<u32> {
        self.proxy.as_ref().map_or_else(Vec::new, |proxy| proxy.property_names())
    }
}

unsafe fn host_finalize(cell: NonNull<GcCell>, ctx: &mut FinalizeContext) {
    let this = unsafe { cell.cast::<HostObject>().as_mut() };
    if let Some(mut proxy) = this.proxy.take() {
        let released = proxy.malloc_size();
        proxy.finalize();
        drop(proxy);
        ctx.release_native(released);
    }
}

unsafe fn host_malloc_size(cell: NonNull<GcCell>) -> usize {
    let this = unsafe { cell.cast::<HostObject>().as_ref() };
    this.proxy.as_ref().map_or(0, |proxy| proxy.malloc_size())
}

static HOST_OBJECT_VTABLE: VTable = VTable::new(
    CellKind::HostObject,
    heap_align_size(std::mem::size_of::<HostObject>()) as u32,
)
.with_finalizer(host_finalize)
.with_malloc_size(host_malloc_size);

unsafe impl CellLayout for HostObject {
    const VTABLE: &'static VTable = &HOST_OBJECT_VTABLE;

    fn build_metadata(builder: &mut MetadataBuilder) {
        builder.add_pointer(offset_of!(HostObject, prototype), "prototype");
    }
}
