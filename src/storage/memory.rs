use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::local::{ListQuery, LocalEntity, LocalStorage, OrderDirection, Result, StorageError};
use super::models::{LinkedAccount, Note, Notebook, SavedSearch, SyncMeta, Tag};

/// Serializable contents of a [`MemoryStorage`]
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub saved_searches: Vec<SavedSearch>,
    #[serde(default)]
    pub notebooks: Vec<Notebook>,
    #[serde(default)]
    pub notes: Vec<Note>,
    #[serde(default)]
    pub linked_accounts: Vec<LinkedAccount>,
}

impl Snapshot {
    /// Load from file
    pub fn load(path: &Path) -> std::result::Result<Self, std::io::Error> {
        let data = std::fs::read_to_string(path)?;
        serde_json::from_str(&data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save to file
    pub fn save(&self, path: &Path) -> std::result::Result<(), std::io::Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)
    }
}

/// In-memory local storage, backing the CLI and the tests
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: Mutex<Snapshot>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            inner: Mutex::new(snapshot),
        }
    }

    /// Copy of the current contents
    pub fn snapshot(&self) -> Result<Snapshot> {
        Ok(self.lock()?.clone())
    }

    pub fn insert(&self, entity: LocalEntity) -> Result<()> {
        let mut data = self.lock()?;
        match entity {
            LocalEntity::Tag(tag) => upsert(&mut data.tags, tag, |t| &t.meta),
            LocalEntity::SavedSearch(search) => {
                upsert(&mut data.saved_searches, search, |s| &s.meta)
            }
            LocalEntity::Notebook(notebook) => upsert(&mut data.notebooks, notebook, |n| &n.meta),
            LocalEntity::Note(note) => upsert(&mut data.notes, note, |n| &n.meta),
        }
        Ok(())
    }

    pub fn add_linked_account(&self, account: LinkedAccount) -> Result<()> {
        self.lock()?.linked_accounts.push(account);
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Snapshot>> {
        self.inner
            .lock()
            .map_err(|_| StorageError::Backend("memory storage lock poisoned".to_string()))
    }
}

fn upsert<T>(items: &mut Vec<T>, item: T, meta: impl Fn(&T) -> &SyncMeta) {
    let local_id = meta(&item).local_id;
    match items.iter_mut().find(|existing| meta(existing).local_id == local_id) {
        Some(existing) => *existing = item,
        None => items.push(item),
    }
}

fn selects(query: &ListQuery, meta: &SyncMeta) -> bool {
    if query.filter.dirty && !meta.dirty {
        return false;
    }
    if query.filter.non_local && meta.local_only {
        return false;
    }
    meta.linked_account == query.linked_account
}

fn select<T: Clone>(items: &[T], query: &ListQuery, meta: impl Fn(&T) -> &SyncMeta) -> Vec<T> {
    let mut selected: Vec<T> = items
        .iter()
        .filter(|item| selects(query, meta(item)))
        .cloned()
        .collect();
    if query.direction == OrderDirection::Descending {
        selected.reverse();
    }
    selected
}

#[async_trait]
impl LocalStorage for MemoryStorage {
    async fn list_tags(&self, query: &ListQuery) -> Result<Vec<Tag>> {
        Ok(select(&self.lock()?.tags, query, |t| &t.meta))
    }

    async fn list_saved_searches(&self, query: &ListQuery) -> Result<Vec<SavedSearch>> {
        Ok(select(&self.lock()?.saved_searches, query, |s| &s.meta))
    }

    async fn list_notebooks(&self, query: &ListQuery) -> Result<Vec<Notebook>> {
        Ok(select(&self.lock()?.notebooks, query, |n| &n.meta))
    }

    async fn list_notes(&self, query: &ListQuery) -> Result<Vec<Note>> {
        Ok(select(&self.lock()?.notes, query, |n| &n.meta))
    }

    async fn list_linked_accounts(&self) -> Result<Vec<LinkedAccount>> {
        Ok(self.lock()?.linked_accounts.clone())
    }

    async fn find_notebook_by_guid(&self, guid: &str) -> Result<Notebook> {
        self.lock()?
            .notebooks
            .iter()
            .find(|n| n.meta.guid.as_deref() == Some(guid))
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("notebook with guid {}", guid)))
    }

    async fn update(&self, entity: LocalEntity) -> Result<()> {
        self.insert(entity)
    }
}
