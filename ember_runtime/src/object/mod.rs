//! Object cell kinds.
//!
//! | Kind              | Size     | Native state              |
//! |-------------------|----------|---------------------------|
//! | `PlainObject`     | fixed    | none                      |
//! | `DecoratedObject` | variable | boxed [`Decoration`]      |
//! | `HostObject`      | fixed    | boxed [`HostObjectProxy`] |
//! | `Domain`          | fixed    | module table, modules     |

mod decorated;
mod domain;
mod host;
mod plain;

pub use decorated::{Decoration, DecoratedObject, MAX_ADDITIONAL_SLOTS};
pub use domain::{
    Domain, RuntimeModule, CACHED_EXPORTS_OFFSET, CJS_MODULE_SIZE, FUNCTION_INDEX_OFFSET, MODULE_OFFSET,
    RUNTIME_MODULE_OFFSET,
};
pub use host::{HostObject, HostObjectProxy};
pub use plain::{PlainObject, DIRECT_SLOTS};
