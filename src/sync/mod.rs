pub mod auth;
pub mod collector;
pub mod config;
pub mod notebooks;
pub mod policy;
pub mod remote;
pub mod sequencer;

mod handle;
mod manager;

pub use auth::{AuthToken, AuthTokenCache, TokenStatus};
pub use config::{ConfigError, SendChangesConfig};
pub use handle::{SendLocalChangesHandle, SyncNotification};
pub use manager::{SendLocalChangesManager, SessionSnapshot, SessionState};
pub use remote::{CreateResponse, NoteStore, RemoteError, RemoteResult, UpdateResponse, UploadRequest};
pub use sequencer::{SyncCursor, UPLOAD_ORDER};

#[cfg(test)]
mod tests;
