//! Outbound half of note synchronization: collects locally modified tags,
//! saved searches, notebooks and notes and sends them to the remote note
//! service, one entity at a time.

pub mod storage;
pub mod sync;

pub use storage::{LocalStorage, MemoryStorage};
pub use sync::{
    NoteStore, SendChangesConfig, SendLocalChangesHandle, SendLocalChangesManager,
    SyncNotification,
};
