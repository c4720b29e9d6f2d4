//! Upload of dirty entities, one at a time and kind by kind.

use std::collections::VecDeque;

use async_trait::async_trait;

use crate::storage::{EntityKind, LocalEntity, Note, Notebook, SavedSearch, SyncMeta, Tag};

use super::collector::DirtyEntitySet;
use super::notebooks::NotebookResolver;
use super::remote::{
    CreateResponse, NoteStore, RemoteError, RemoteResult, UpdateResponse, UploadRequest,
};

/// Upload order; notes reference notebooks and tags by remote id
pub const UPLOAD_ORDER: [EntityKind; 4] = [
    EntityKind::Tag,
    EntityKind::SavedSearch,
    EntityKind::Notebook,
    EntityKind::Note,
];

/// An entity kind the sequencer knows how to push
#[async_trait]
pub trait Syncable: Clone + Send + Sync + std::fmt::Debug + 'static {
    const KIND: EntityKind;

    fn meta(&self) -> &SyncMeta;

    fn meta_mut(&mut self) -> &mut SyncMeta;

    /// The pending queue holding entities of this kind
    fn pending(set: &mut DirtyEntitySet) -> &mut VecDeque<Self>;

    fn into_local(self) -> LocalEntity;

    async fn create(&self, store: &dyn NoteStore, auth_token: &str)
        -> RemoteResult<CreateResponse>;

    async fn update(&self, store: &dyn NoteStore, auth_token: &str)
        -> RemoteResult<UpdateResponse>;

    /// Linked account whose token authorizes the upload, `None` for the
    /// owning account
    fn auth_scope<'a>(&'a self, _notebooks: &'a NotebookResolver) -> Result<Option<&'a str>, String> {
        Ok(self.meta().linked_account.as_deref())
    }

    /// Hand the identifiers assigned by the service to entities still waiting
    fn propagate(&self, _pending: &mut DirtyEntitySet, _notebooks: &mut NotebookResolver) {}
}

/// Send one entity and record what the service assigned to it.
///
/// The entity is left untouched when the call fails.
pub async fn upload<E: Syncable>(
    store: &dyn NoteStore,
    entity: &mut E,
    auth_token: &str,
) -> Result<i32, RemoteError> {
    let update_sequence_num = if entity.meta().is_new() {
        log::trace!("Sending new {}: {:?}", E::KIND, entity);
        let response = entity.create(store, auth_token).await?;
        entity.meta_mut().guid = Some(response.guid);
        response.update_sequence_num
    } else {
        log::trace!("Sending modified {}: {:?}", E::KIND, entity);
        entity.update(store, auth_token).await?.update_sequence_num
    };

    let meta = entity.meta_mut();
    meta.update_sequence_num = Some(update_sequence_num);
    meta.dirty = false;
    Ok(update_sequence_num)
}

/// What recording an assigned sequence number did to the cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorUpdate {
    Advanced,
    /// First gap of the pass
    DriftDetected,
    /// Consistency was already lost earlier in the pass
    Unchecked,
}

/// Highest update sequence number the local copy is in sync with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncCursor {
    value: i32,
    must_repeat_inbound_sync: bool,
}

impl SyncCursor {
    pub fn new(value: i32) -> Self {
        Self {
            value,
            must_repeat_inbound_sync: false,
        }
    }

    pub fn value(&self) -> i32 {
        self.value
    }

    pub fn set_value(&mut self, value: i32) {
        self.value = value;
    }

    pub fn must_repeat_inbound_sync(&self) -> bool {
        self.must_repeat_inbound_sync
    }

    pub fn record(&mut self, update_sequence_num: i32) -> CursorUpdate {
        if self.must_repeat_inbound_sync {
            return CursorUpdate::Unchecked;
        }
        // No update count follows i32::MAX, so anything reported there is drift
        let expected = self.value.checked_add(1);
        if expected == Some(update_sequence_num) {
            self.value = update_sequence_num;
            log::trace!("In sync with the service; last update count = {}", self.value);
            CursorUpdate::Advanced
        } else {
            self.must_repeat_inbound_sync = true;
            log::debug!(
                "Not in sync with the service: expected update count after {}, got {}",
                self.value,
                update_sequence_num
            );
            CursorUpdate::DriftDetected
        }
    }
}

#[async_trait]
impl Syncable for Tag {
    const KIND: EntityKind = EntityKind::Tag;

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn pending(set: &mut DirtyEntitySet) -> &mut VecDeque<Self> {
        &mut set.tags
    }

    fn into_local(self) -> LocalEntity {
        LocalEntity::Tag(self)
    }

    async fn create(&self, store: &dyn NoteStore, auth_token: &str) -> RemoteResult<CreateResponse> {
        store.create_tag(UploadRequest::new(self, auth_token)).await
    }

    async fn update(&self, store: &dyn NoteStore, auth_token: &str) -> RemoteResult<UpdateResponse> {
        store.update_tag(UploadRequest::new(self, auth_token)).await
    }

    fn propagate(&self, pending: &mut DirtyEntitySet, _notebooks: &mut NotebookResolver) {
        let Some(guid) = self.meta.guid.as_ref() else {
            return;
        };
        for note in pending.notes.iter_mut() {
            let before = note.tag_local_ids.len();
            note.tag_local_ids.retain(|id| *id != self.meta.local_id);
            if note.tag_local_ids.len() != before && !note.tag_guids.contains(guid) {
                note.tag_guids.push(guid.clone());
            }
        }
    }
}

#[async_trait]
impl Syncable for SavedSearch {
    const KIND: EntityKind = EntityKind::SavedSearch;

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn pending(set: &mut DirtyEntitySet) -> &mut VecDeque<Self> {
        &mut set.saved_searches
    }

    fn into_local(self) -> LocalEntity {
        LocalEntity::SavedSearch(self)
    }

    async fn create(&self, store: &dyn NoteStore, auth_token: &str) -> RemoteResult<CreateResponse> {
        store.create_saved_search(UploadRequest::new(self, auth_token)).await
    }

    async fn update(&self, store: &dyn NoteStore, auth_token: &str) -> RemoteResult<UpdateResponse> {
        store.update_saved_search(UploadRequest::new(self, auth_token)).await
    }
}

#[async_trait]
impl Syncable for Notebook {
    const KIND: EntityKind = EntityKind::Notebook;

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn pending(set: &mut DirtyEntitySet) -> &mut VecDeque<Self> {
        &mut set.notebooks
    }

    fn into_local(self) -> LocalEntity {
        LocalEntity::Notebook(self)
    }

    async fn create(&self, store: &dyn NoteStore, auth_token: &str) -> RemoteResult<CreateResponse> {
        store.create_notebook(UploadRequest::new(self, auth_token)).await
    }

    async fn update(&self, store: &dyn NoteStore, auth_token: &str) -> RemoteResult<UpdateResponse> {
        store.update_notebook(UploadRequest::new(self, auth_token)).await
    }

    fn propagate(&self, pending: &mut DirtyEntitySet, notebooks: &mut NotebookResolver) {
        let Some(guid) = self.meta.guid.as_ref() else {
            return;
        };
        for note in pending.notes.iter_mut() {
            if note.notebook_guid.is_none() && note.notebook_local_id == Some(self.meta.local_id) {
                note.notebook_guid = Some(guid.clone());
            }
        }
        notebooks.remember(self.clone());
    }
}

#[async_trait]
impl Syncable for Note {
    const KIND: EntityKind = EntityKind::Note;

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn pending(set: &mut DirtyEntitySet) -> &mut VecDeque<Self> {
        &mut set.notes
    }

    fn into_local(self) -> LocalEntity {
        LocalEntity::Note(self)
    }

    async fn create(&self, store: &dyn NoteStore, auth_token: &str) -> RemoteResult<CreateResponse> {
        store.create_note(UploadRequest::new(self, auth_token)).await
    }

    async fn update(&self, store: &dyn NoteStore, auth_token: &str) -> RemoteResult<UpdateResponse> {
        store.update_note(UploadRequest::new(self, auth_token)).await
    }

    /// Notes are authorized through the account owning their notebook
    fn auth_scope<'a>(&'a self, notebooks: &'a NotebookResolver) -> Result<Option<&'a str>, String> {
        let Some(notebook_guid) = self.notebook_guid.as_deref() else {
            return Err(format!(
                "Can't send note {} to the service: its notebook has no guid",
                self.meta.local_id
            ));
        };
        let Some(notebook) = notebooks.get(notebook_guid) else {
            return Err(format!(
                "Internal error: notebook {} of note {} was not resolved",
                notebook_guid, self.meta.local_id
            ));
        };
        Ok(notebook
            .meta
            .linked_account
            .as_deref()
            .or(self.meta.linked_account.as_deref()))
    }
}
