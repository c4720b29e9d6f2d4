use async_trait::async_trait;
use thiserror::Error;

use crate::storage::{Note, Notebook, SavedSearch, Tag};

/// Structured failure returned by the remote note service
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    #[error("Rate limit reached, retry after {retry_after_secs} seconds")]
    RateLimitReached { retry_after_secs: i32 },
    #[error("Authentication token expired")]
    AuthExpired,
    #[error("Data conflict with the service")]
    DataConflict,
    #[error("{0}")]
    Other(String),
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Identifiers the service assigned to a newly created entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateResponse {
    pub guid: String,
    pub update_sequence_num: i32,
}

/// Sequence number the service assigned to an accepted modification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateResponse {
    pub update_sequence_num: i32,
}

/// A create or update call addressed to the service
#[derive(Debug)]
pub struct UploadRequest<'a, T> {
    pub entity: &'a T,
    /// Empty for the owning account
    pub auth_token: &'a str,
}

impl<'a, T> UploadRequest<'a, T> {
    pub fn new(entity: &'a T, auth_token: &'a str) -> Self {
        Self { entity, auth_token }
    }
}

/// Client of the remote note service.
///
/// Calls are awaited one at a time by the outbound engine; an implementation
/// may block on the network or drive its own callbacks underneath.
#[async_trait]
pub trait NoteStore: Send + Sync {
    async fn create_tag(&self, request: UploadRequest<'_, Tag>) -> RemoteResult<CreateResponse>;
    async fn update_tag(&self, request: UploadRequest<'_, Tag>) -> RemoteResult<UpdateResponse>;

    async fn create_saved_search(
        &self,
        request: UploadRequest<'_, SavedSearch>,
    ) -> RemoteResult<CreateResponse>;
    async fn update_saved_search(
        &self,
        request: UploadRequest<'_, SavedSearch>,
    ) -> RemoteResult<UpdateResponse>;

    async fn create_notebook(
        &self,
        request: UploadRequest<'_, Notebook>,
    ) -> RemoteResult<CreateResponse>;
    async fn update_notebook(
        &self,
        request: UploadRequest<'_, Notebook>,
    ) -> RemoteResult<UpdateResponse>;

    async fn create_note(&self, request: UploadRequest<'_, Note>) -> RemoteResult<CreateResponse>;
    async fn update_note(&self, request: UploadRequest<'_, Note>) -> RemoteResult<UpdateResponse>;
}
