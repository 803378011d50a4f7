//! End-to-end collection over graphs of runtime objects.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ember_gc::trace::CountingAcceptor;
use ember_gc::{CellKind, Heap, HeapConfig, HeapError, Value};
use ember_runtime::{
    new_heap, ArrayStorage, Decoration, DecoratedObject, Domain, HostObject, HostObjectProxy,
    PlainObject, RuntimeError,
};

// =============================================================================
// Helpers
// =============================================================================

struct Counted(Arc<AtomicUsize>);

impl Drop for Counted {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

impl Decoration for Counted {
    fn malloc_size(&self) -> usize {
        64
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

struct Constant(i32);

impl HostObjectProxy for Constant {
    fn get(&mut self, _name: u32) -> Value {
        Value::int32(self.0)
    }

    fn set(&mut self, _name: u32, _value: Value) -> bool {
        false
    }

    fn property_names(&self) -> Vec<u32> {
        Vec::new()
    }
}

fn heap() -> Heap {
    new_heap(HeapConfig::for_testing()).unwrap()
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn test_mixed_graph_survives_repeated_collections() {
    let mut heap = heap();
    let dropped = Arc::new(AtomicUsize::new(0));

    let proto = PlainObject::create(&mut heap, None).unwrap();
    let mut root_obj = PlainObject::create(&mut heap, Some(proto.as_cell())).unwrap();
    for i in 0..20 {
        // Garbage interleaved with the live graph.
        PlainObject::create(&mut heap, None).unwrap();
        root_obj.push_slot(&mut heap, Value::int32(i)).unwrap();
    }

    let mut decorated =
        DecoratedObject::create(&mut heap, None, Box::new(Counted(Arc::clone(&dropped))), 2).unwrap();
    let host = HostObject::create(&mut heap, Some(proto.as_cell()), Box::new(Constant(5))).unwrap();
    decorated
        .set_additional_slot(&heap, 0, Value::object(host.as_cell()))
        .unwrap();
    root_obj
        .set_slot(&heap, 0, Value::object(decorated.as_cell()))
        .unwrap();
    DecoratedObject::create(&mut heap, None, Box::new(Counted(Arc::clone(&dropped))), 0).unwrap();

    let root = heap.add_root(root_obj.as_cell());
    for round in 0..3 {
        let result = heap.collect();
        if round == 0 {
            assert!(result.cells_freed >= 21);
            assert_eq!(result.cells_finalized, 1);
            assert_eq!(result.native_bytes_released, 64);
        } else {
            assert_eq!(result.cells_freed, 0);
        }
        heap.check_well_formed().unwrap();
    }
    assert_eq!(dropped.load(Ordering::SeqCst), 1);

    let obj = heap.root_as::<PlainObject>(root).unwrap();
    assert_eq!(obj.slot_count(), 24);
    assert_eq!(obj.get_slot(23), Some(Value::int32(19)));

    let decorated_cell = obj.get_slot(0).and_then(Value::as_object).unwrap();
    let decorated = unsafe { ember_gc::CellRef::<DecoratedObject>::try_from_cell(decorated_cell) }.unwrap();
    let host_cell = decorated.get_additional_slot(0).and_then(Value::as_object).unwrap();
    let mut host = unsafe { ember_gc::CellRef::<HostObject>::try_from_cell(host_cell) }.unwrap();
    assert_eq!(host.get(3), Value::int32(5));
    assert_eq!(host.prototype(), obj.prototype());
}

#[test]
fn test_spilled_storage_is_compacted() {
    let mut heap = heap();
    let mut obj = PlainObject::create(&mut heap, None).unwrap();
    for i in 0..5 {
        obj.push_slot(&mut heap, Value::int32(i)).unwrap();
    }
    // Five spilled slots live in a storage of capacity eight.
    assert_eq!(obj.properties().unwrap().capacity(), 8);
    let root = heap.add_root(obj.as_cell());

    let result = heap.collect();
    // The outgrown capacity-four storage is garbage.
    assert_eq!(result.cells_freed, 1);
    assert_eq!(result.bytes_compacted, 3 * 8);

    let obj = heap.root_as::<PlainObject>(root).unwrap();
    let props = obj.properties().unwrap();
    assert_eq!(props.capacity(), 5);
    assert_eq!(obj.get_slot(8), Some(Value::int32(4)));

    // Growing a compacted storage reallocates it again.
    let mut obj = obj;
    obj.push_slot(&mut heap, Value::int32(5)).unwrap();
    assert_eq!(obj.properties().unwrap().capacity(), 10);
}

#[test]
fn test_domain_keeps_module_records_alive() {
    let mut heap = heap();
    let domain = Domain::create(&mut heap).unwrap();
    let mut lock = heap.weak_ref_lock();
    let module = Domain::add_runtime_module(domain, &mut lock, 1);
    drop(lock);
    Domain::import_cjs_module_table(domain, &mut heap, module, &[(10, 0), (11, 1), (12, 2)], &[])
        .unwrap();

    let exports = PlainObject::create(&mut heap, None).unwrap();
    let mut domain = domain;
    domain
        .set_cjs_module_exports(&heap, 1, Value::object(exports.as_cell()))
        .unwrap();
    let root = heap.add_root(domain.as_cell());

    heap.collect();
    heap.check_well_formed().unwrap();

    let domain = heap.root_as::<Domain>(root).unwrap();
    let exports = domain.cjs_module_exports(1).and_then(Value::as_object).unwrap();
    assert!(unsafe { exports.as_ref() }.is_valid_kind(CellKind::PlainObject));
    assert_eq!(domain.cjs_module_id(12), Some(2));
    assert_eq!(domain.cjs_module_function_index(2), Some(2));
    assert!(domain.throwing_require().is_some());

    let lock = heap.weak_ref_lock();
    assert_eq!(domain.runtime_module(module).unwrap().domain(&lock), Some(domain));
}

#[test]
fn test_barriers_track_stores_into_existing_cells() {
    let mut heap = heap();
    let mut storage = ArrayStorage::create(&mut heap, 4).unwrap();
    let target = PlainObject::create(&mut heap, None).unwrap();

    let mut counter = CountingAcceptor::new();
    heap.scan_dirty_cards(&mut counter);

    storage.push(&heap, Value::object(target.as_cell())).unwrap();
    let mut counter = CountingAcceptor::new();
    heap.scan_dirty_cards(&mut counter);
    assert!(counter.values >= 1);
}

#[test]
fn test_exhaustion_surfaces_as_heap_error() {
    let config = HeapConfig {
        max_segments: 1,
        ..HeapConfig::for_testing()
    };
    let mut heap = new_heap(config).unwrap();
    let err = loop {
        match ArrayStorage::create(&mut heap, 500) {
            Ok(_) => continue,
            Err(err) => break err,
        }
    };
    assert!(matches!(err, RuntimeError::Heap(HeapError::OutOfMemory { segments: 1, .. })));

    // Everything was garbage, so a collection makes room again.
    heap.collect();
    assert!(ArrayStorage::create(&mut heap, 500).is_ok());
}
