use std::sync::atomic::{AtomicI32, Ordering};

use async_trait::async_trait;
use uuid::Uuid;

use nous_sync::storage::{Note, Notebook, SavedSearch, Tag};
use nous_sync::sync::{CreateResponse, NoteStore, RemoteResult, UpdateResponse, UploadRequest};

/// Accepts every upload and hands out consecutive update counts
pub struct LoopbackNoteStore {
    next_usn: AtomicI32,
}

impl LoopbackNoteStore {
    pub fn new(first_usn: i32) -> Self {
        Self {
            next_usn: AtomicI32::new(first_usn),
        }
    }

    fn created(&self, kind: &str, name: &str) -> RemoteResult<CreateResponse> {
        let guid = Uuid::new_v4().to_string();
        let update_sequence_num = self.next_usn.fetch_add(1, Ordering::SeqCst);
        log::debug!("Created {} '{}' as {} (usn {})", kind, name, guid, update_sequence_num);
        Ok(CreateResponse {
            guid,
            update_sequence_num,
        })
    }

    fn updated(&self, kind: &str, name: &str) -> RemoteResult<UpdateResponse> {
        let update_sequence_num = self.next_usn.fetch_add(1, Ordering::SeqCst);
        log::debug!("Updated {} '{}' (usn {})", kind, name, update_sequence_num);
        Ok(UpdateResponse {
            update_sequence_num,
        })
    }
}

#[async_trait]
impl NoteStore for LoopbackNoteStore {
    async fn create_tag(&self, request: UploadRequest<'_, Tag>) -> RemoteResult<CreateResponse> {
        self.created("tag", &request.entity.name)
    }

    async fn update_tag(&self, request: UploadRequest<'_, Tag>) -> RemoteResult<UpdateResponse> {
        self.updated("tag", &request.entity.name)
    }

    async fn create_saved_search(
        &self,
        request: UploadRequest<'_, SavedSearch>,
    ) -> RemoteResult<CreateResponse> {
        self.created("saved search", &request.entity.name)
    }

    async fn update_saved_search(
        &self,
        request: UploadRequest<'_, SavedSearch>,
    ) -> RemoteResult<UpdateResponse> {
        self.updated("saved search", &request.entity.name)
    }

    async fn create_notebook(
        &self,
        request: UploadRequest<'_, Notebook>,
    ) -> RemoteResult<CreateResponse> {
        self.created("notebook", &request.entity.name)
    }

    async fn update_notebook(
        &self,
        request: UploadRequest<'_, Notebook>,
    ) -> RemoteResult<UpdateResponse> {
        self.updated("notebook", &request.entity.name)
    }

    async fn create_note(&self, request: UploadRequest<'_, Note>) -> RemoteResult<CreateResponse> {
        self.created("note", &request.entity.title)
    }

    async fn update_note(&self, request: UploadRequest<'_, Note>) -> RemoteResult<UpdateResponse> {
        self.updated("note", &request.entity.title)
    }
}
