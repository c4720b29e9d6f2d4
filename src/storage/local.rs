use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::models::{LinkedAccount, Note, Notebook, SavedSearch, Tag};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Which entities a listing selects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFilter {
    /// Only entities created or modified since the last sync
    pub dirty: bool,
    /// Exclude entities that belong to local-only notebooks
    pub non_local: bool,
}

impl ListFilter {
    /// New or modified entities that are eligible for upload
    pub const DIRTY_NON_LOCAL: Self = Self {
        dirty: true,
        non_local: true,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OrderDirection {
    #[default]
    Ascending,
    Descending,
}

/// Parameters of a listing request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub filter: ListFilter,
    pub direction: OrderDirection,
    /// Restrict to one linked account; `None` selects the owning account
    pub linked_account: Option<String>,
}

impl ListQuery {
    pub fn dirty(linked_account: Option<String>) -> Self {
        Self {
            filter: ListFilter::DIRTY_NON_LOCAL,
            direction: OrderDirection::Ascending,
            linked_account,
        }
    }
}

/// Any entity the outbound pass writes back into local storage
#[derive(Debug, Clone, PartialEq)]
pub enum LocalEntity {
    Tag(Tag),
    SavedSearch(SavedSearch),
    Notebook(Notebook),
    Note(Note),
}

/// The local note store, consumed as an asynchronous request/response service
#[async_trait]
pub trait LocalStorage: Send + Sync {
    async fn list_tags(&self, query: &ListQuery) -> Result<Vec<Tag>>;

    async fn list_saved_searches(&self, query: &ListQuery) -> Result<Vec<SavedSearch>>;

    async fn list_notebooks(&self, query: &ListQuery) -> Result<Vec<Notebook>>;

    async fn list_notes(&self, query: &ListQuery) -> Result<Vec<Note>>;

    async fn list_linked_accounts(&self) -> Result<Vec<LinkedAccount>>;

    async fn find_notebook_by_guid(&self, guid: &str) -> Result<Notebook>;

    /// Persist an entity, matched by its local id
    async fn update(&self, entity: LocalEntity) -> Result<()>;
}
