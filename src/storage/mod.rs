mod local;
mod memory;
mod models;

pub use local::{
    ListFilter, ListQuery, LocalEntity, LocalStorage, OrderDirection, Result, StorageError,
};
pub use memory::{MemoryStorage, Snapshot};
pub use models::*;
