use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kinds of entities pushed by an outbound pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    Tag,
    SavedSearch,
    Notebook,
    Note,
}

impl EntityKind {
    /// Human readable name used in log lines and failure messages
    pub fn label(&self) -> &'static str {
        match self {
            Self::Tag => "tag",
            Self::SavedSearch => "saved search",
            Self::Notebook => "notebook",
            Self::Note => "note",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Synchronization bookkeeping shared by every syncable entity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncMeta {
    /// Local identifier, always present
    pub local_id: Uuid,
    /// Remote identifier, set once the entity was accepted by the service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guid: Option<String>,
    /// Owning linked account; `None` means the user's own account
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_account: Option<String>,
    #[serde(default)]
    pub dirty: bool,
    /// Entity lives in a local-only notebook and is never uploaded
    #[serde(default)]
    pub local_only: bool,
    /// Update sequence number assigned by the service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_sequence_num: Option<i32>,
}

impl SyncMeta {
    /// Metadata for an entity that was created locally and never synced
    pub fn new_local() -> Self {
        Self {
            local_id: Uuid::new_v4(),
            guid: None,
            linked_account: None,
            dirty: true,
            local_only: false,
            update_sequence_num: None,
        }
    }

    /// Metadata for a previously synced entity that was modified locally
    pub fn modified(guid: impl Into<String>, update_sequence_num: i32) -> Self {
        Self {
            local_id: Uuid::new_v4(),
            guid: Some(guid.into()),
            linked_account: None,
            dirty: true,
            local_only: false,
            update_sequence_num: Some(update_sequence_num),
        }
    }

    pub fn in_linked_account(mut self, linked_account: impl Into<String>) -> Self {
        self.linked_account = Some(linked_account.into());
        self
    }

    /// An entity without a remote identifier is being created
    pub fn is_new(&self) -> bool {
        self.guid.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    #[serde(flatten)]
    pub meta: SyncMeta,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_guid: Option<String>,
}

impl Tag {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            meta: SyncMeta::new_local(),
            name: name.into(),
            parent_guid: None,
        }
    }

    pub fn with_meta(mut self, meta: SyncMeta) -> Self {
        self.meta = meta;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SavedSearch {
    #[serde(flatten)]
    pub meta: SyncMeta,
    pub name: String,
    pub query: String,
}

impl SavedSearch {
    pub fn new(name: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            meta: SyncMeta::new_local(),
            name: name.into(),
            query: query.into(),
        }
    }

    pub fn with_meta(mut self, meta: SyncMeta) -> Self {
        self.meta = meta;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Notebook {
    #[serde(flatten)]
    pub meta: SyncMeta,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default)]
    pub default_notebook: bool,
}

impl Notebook {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            meta: SyncMeta::new_local(),
            name: name.into(),
            stack: None,
            default_notebook: false,
        }
    }

    pub fn with_meta(mut self, meta: SyncMeta) -> Self {
        self.meta = meta;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    #[serde(flatten)]
    pub meta: SyncMeta,
    pub title: String,
    #[serde(default)]
    pub content: String,
    /// Remote id of the owning notebook
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notebook_guid: Option<String>,
    /// Local id of the owning notebook, used until it has a remote id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notebook_local_id: Option<Uuid>,
    #[serde(default)]
    pub tag_guids: Vec<String>,
    /// Local ids of tags which had no remote id when the note was tagged
    #[serde(default)]
    pub tag_local_ids: Vec<Uuid>,
}

impl Note {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            meta: SyncMeta::new_local(),
            title: title.into(),
            content: String::new(),
            notebook_guid: None,
            notebook_local_id: None,
            tag_guids: Vec::new(),
            tag_local_ids: Vec::new(),
        }
    }

    pub fn with_meta(mut self, meta: SyncMeta) -> Self {
        self.meta = meta;
        self
    }

    /// Place the note into a notebook, by remote id when it has one
    pub fn in_notebook(mut self, notebook: &Notebook) -> Self {
        self.notebook_guid = notebook.meta.guid.clone();
        self.notebook_local_id = Some(notebook.meta.local_id);
        self
    }

    pub fn tagged(mut self, tag: &Tag) -> Self {
        match &tag.meta.guid {
            Some(guid) => self.tag_guids.push(guid.clone()),
            None => self.tag_local_ids.push(tag.meta.local_id),
        }
        self
    }
}

/// A notebook shared with the owning account by another account
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct LinkedAccount {
    /// Empty when local storage holds a record without one
    #[serde(default)]
    pub guid: String,
    #[serde(default)]
    pub share_key: String,
}

impl LinkedAccount {
    pub fn new(guid: impl Into<String>, share_key: impl Into<String>) -> Self {
        Self {
            guid: guid.into(),
            share_key: share_key.into(),
        }
    }
}
