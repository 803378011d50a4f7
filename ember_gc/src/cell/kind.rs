//! The closed set of heap cell kinds.

use std::fmt;

/// Identifies the layout and behavior of a heap cell.
///
/// The discriminant is stored in the top byte of every cell header and
/// indexes the [`CellRegistry`](super::CellRegistry), so new kinds must be
/// appended and `COUNT`/`ALL` kept in sync.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CellKind {
    /// Variable-size backing store of tagged values.
    ArrayStorage = 0,
    /// Ordinary object with a fixed block of direct property slots.
    PlainObject = 1,
    /// Object carrying an opaque native decoration.
    DecoratedObject = 2,
    /// Object whose properties are served by an embedder proxy.
    HostObject = 3,
    /// Module-loading domain shared by a group of runtime modules.
    Domain = 4,
}

impl CellKind {
    /// Number of kinds.
    pub const COUNT: usize = 5;

    /// Every kind, in discriminant order.
    pub const ALL: [CellKind; Self::COUNT] = [
        CellKind::ArrayStorage,
        CellKind::PlainObject,
        CellKind::DecoratedObject,
        CellKind::HostObject,
        CellKind::Domain,
    ];

    /// Decode a discriminant read from a cell header.
    #[inline]
    pub const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(CellKind::ArrayStorage),
            1 => Some(CellKind::PlainObject),
            2 => Some(CellKind::DecoratedObject),
            3 => Some(CellKind::HostObject),
            4 => Some(CellKind::Domain),
            _ => None,
        }
    }

    /// Dense index into per-kind tables.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Human-readable name used in diagnostics.
    pub const fn name(self) -> &'static str {
        match self {
            CellKind::ArrayStorage => "ArrayStorage",
            CellKind::PlainObject => "PlainObject",
            CellKind::DecoratedObject => "DecoratedObject",
            CellKind::HostObject => "HostObject",
            CellKind::Domain => "Domain",
        }
    }
}

impl fmt::Display for CellKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
