//! Non-object storage kinds.

mod array_storage;

pub use array_storage::ArrayStorage;
