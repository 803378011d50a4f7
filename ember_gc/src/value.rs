//! Tagged 64-bit values stored in value slots.
//!
//! The low three bits hold a tag. Tag 0 with a nonzero payload is an
//! untagged cell pointer, so heap alignment keeps pointers representable
//! without any shifting:
//!
//! ```text
//! tag 0  object   [ cell address                     | 000 ]   (0 == empty)
//! tag 1  int32    [ i32 payload << 32 |              | 001 ]
//! tag 2  bool     [ b << 3                           | 010 ]
//! tag 3  undefined                                   | 011
//! tag 4  null                                        | 100
//! tag 5  native   [ u32 payload << 32 |              | 101 ]
//! ```
//!
//! The all-zero word is the empty value, which is also what zeroed
//! segment memory reads as.

use std::fmt;
use std::ptr::NonNull;

use crate::cell::{GcCell, HEAP_ALIGN};

const TAG_MASK: u64 = 0b111;
const TAG_OBJECT: u64 = 0;
const TAG_INT32: u64 = 1;
const TAG_BOOL: u64 = 2;
const TAG_UNDEFINED: u64 = 3;
const TAG_NULL: u64 = 4;
const TAG_NATIVE: u64 = 5;

const _: () = assert!(HEAP_ALIGN as u64 > TAG_MASK);

/// A tagged value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Value(u64);

impl Value {
    /// The empty value.
    pub const EMPTY: Value = Value(0);
    /// `undefined`.
    pub const UNDEFINED: Value = Value(TAG_UNDEFINED);
    /// `null`.
    pub const NULL: Value = Value(TAG_NULL);

    /// A 32-bit integer.
    #[inline]
    pub const fn int32(n: i32) -> Self {
        Value(((n as u32 as u64) << 32) | TAG_INT32)
    }

    /// A boolean.
    #[inline]
    pub const fn bool(b: bool) -> Self {
        Value(((b as u64) << 3) | TAG_BOOL)
    }

    /// An opaque 32-bit native payload.
    #[inline]
    pub const fn native_u32(n: u32) -> Self {
        Value(((n as u64) << 32) | TAG_NATIVE)
    }

    /// A reference to a heap cell.
    #[inline]
    pub fn object(cell: NonNull<GcCell>) -> Self {
        let raw = cell.as_ptr() as usize as u64;
        debug_assert_eq!(raw & TAG_MASK, 0, "cell address is not heap aligned");
        Value(raw)
    }

    /// The raw encoding.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    const fn tag(self) -> u64 {
        self.0 & TAG_MASK
    }

    /// Whether this is the empty value.
    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether this references a heap cell.
    #[inline]
    pub const fn is_object(self) -> bool {
        self.0 != 0 && self.tag() == TAG_OBJECT
    }

    /// Whether this is `undefined`.
    #[inline]
    pub const fn is_undefined(self) -> bool {
        self.0 == TAG_UNDEFINED
    }

    /// Whether this is `null`.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == TAG_NULL
    }

    /// The referenced cell, if this is an object.
    #[inline]
    pub fn as_object(self) -> Option<NonNull<GcCell>> {
        if self.is_object() {
            NonNull::new(self.0 as usize as *mut GcCell)
        } else {
            None
        }
    }

    /// The integer payload, if this is an int32.
    #[inline]
    pub const fn as_int32(self) -> Option<i32> {
        if self.tag() == TAG_INT32 {
            Some((self.0 >> 32) as u32 as i32)
        } else {
            None
        }
    }

    /// The boolean payload, if this is a bool.
    #[inline]
    pub const fn as_bool(self) -> Option<bool> {
        if self.tag() == TAG_BOOL {
            Some(self.0 >> 3 != 0)
        } else {
            None
        }
    }

    /// The native payload, if this is a native value.
    #[inline]
    pub const fn as_native_u32(self) -> Option<u32> {
        if self.tag() == TAG_NATIVE {
            Some((self.0 >> 32) as u32)
        } else {
            None
        }
    }

    /// The same object value pointing at `cell`'s new location.
    #[inline]
    pub fn update_pointer(self, cell: NonNull<GcCell>) -> Self {
        debug_assert!(self.is_object(), "update_pointer on a non-object value");
        Value::object(cell)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("Empty");
        }
        match self.tag() {
            TAG_OBJECT => write!(f, "Object({:#x})", self.0),
            TAG_INT32 => write!(f, "Int32({})", (self.0 >> 32) as u32 as i32),
            TAG_BOOL => write!(f, "Bool({})", self.0 >> 3 != 0),
            TAG_UNDEFINED => f.write_str("Undefined"),
            TAG_NULL => f.write_str("Null"),
            TAG_NATIVE => write!(f, "Native({})", self.0 >> 32),
            _ => write!(f, "Value({:#x})", self.0),
        }
    }
}
