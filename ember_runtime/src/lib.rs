//! Heap cell kinds for the Ember JavaScript runtime.
//!
//! This crate provides:
//! - `ArrayStorage`, the variable-size value store backing object properties
//! - `PlainObject` with inline and spilled property slots
//! - `DecoratedObject` and `HostObject` for embedder-owned native state
//! - `Domain`, owning runtime modules and the CommonJS module table
//! - Barriered store helpers and the shared cell registry
//!
//! # Usage
//!
//! ```ignore
//! use ember_gc::{HeapConfig, Value};
//! use ember_runtime::{new_heap, PlainObject};
//!
//! let mut heap = new_heap(HeapConfig::default())?;
//! let mut obj = PlainObject::create(&mut heap, None)?;
//! obj.push_slot(&mut heap, Value::int32(1))?;
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod barrier;
pub mod error;
pub mod object;
pub mod registry;
pub mod types;

// Re-export commonly used items
pub use error::{RuntimeError, RuntimeResult};
pub use object::{
    Decoration, DecoratedObject, Domain, HostObject, HostObjectProxy, PlainObject, RuntimeModule,
};
pub use registry::{build_registry, new_heap, runtime_registry};
pub use types::ArrayStorage;
