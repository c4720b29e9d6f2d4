//! End-to-end passes of the outbound engine against scripted collaborators.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;

use crate::storage::{
    EntityKind, LinkedAccount, ListQuery, LocalEntity, LocalStorage, MemoryStorage, Note,
    Notebook, SavedSearch, Snapshot, StorageError, SyncMeta, Tag,
};

use super::*;

// ===== Scripted note service =====

#[derive(Debug, Clone)]
struct Call {
    kind: EntityKind,
    create: bool,
    name: String,
    auth_token: String,
    at: Instant,
}

#[derive(Debug)]
enum Reply {
    /// Next consecutive update count
    Next,
    Usn(i32),
    Fail(RemoteError),
}

struct ScriptedNoteStore {
    next_usn: Mutex<i32>,
    script: Mutex<VecDeque<Reply>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedNoteStore {
    fn new(first_usn: i32) -> Arc<Self> {
        Self::scripted(first_usn, Vec::new())
    }

    fn scripted(first_usn: i32, replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            next_usn: Mutex::new(first_usn),
            script: Mutex::new(replies.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn names(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.name).collect()
    }

    fn reply(&self, kind: EntityKind, create: bool, name: &str, auth_token: &str) -> RemoteResult<i32> {
        self.calls.lock().unwrap().push(Call {
            kind,
            create,
            name: name.to_string(),
            auth_token: auth_token.to_string(),
            at: Instant::now(),
        });

        let reply = self.script.lock().unwrap().pop_front().unwrap_or(Reply::Next);
        let mut next_usn = self.next_usn.lock().unwrap();
        match reply {
            Reply::Next => {
                let usn = *next_usn;
                *next_usn += 1;
                Ok(usn)
            }
            Reply::Usn(usn) => {
                *next_usn = usn + 1;
                Ok(usn)
            }
            Reply::Fail(error) => Err(error),
        }
    }

    fn create(&self, kind: EntityKind, name: &str, auth_token: &str) -> RemoteResult<CreateResponse> {
        let update_sequence_num = self.reply(kind, true, name, auth_token)?;
        Ok(CreateResponse {
            guid: format!("{}-{}", kind.label().replace(' ', "-"), update_sequence_num),
            update_sequence_num,
        })
    }

    fn update(&self, kind: EntityKind, name: &str, auth_token: &str) -> RemoteResult<UpdateResponse> {
        let update_sequence_num = self.reply(kind, false, name, auth_token)?;
        Ok(UpdateResponse {
            update_sequence_num,
        })
    }
}

#[async_trait]
impl NoteStore for ScriptedNoteStore {
    async fn create_tag(&self, request: UploadRequest<'_, Tag>) -> RemoteResult<CreateResponse> {
        self.create(EntityKind::Tag, &request.entity.name, request.auth_token)
    }

    async fn update_tag(&self, request: UploadRequest<'_, Tag>) -> RemoteResult<UpdateResponse> {
        self.update(EntityKind::Tag, &request.entity.name, request.auth_token)
    }

    async fn create_saved_search(
        &self,
        request: UploadRequest<'_, SavedSearch>,
    ) -> RemoteResult<CreateResponse> {
        self.create(EntityKind::SavedSearch, &request.entity.name, request.auth_token)
    }

    async fn update_saved_search(
        &self,
        request: UploadRequest<'_, SavedSearch>,
    ) -> RemoteResult<UpdateResponse> {
        self.update(EntityKind::SavedSearch, &request.entity.name, request.auth_token)
    }

    async fn create_notebook(
        &self,
        request: UploadRequest<'_, Notebook>,
    ) -> RemoteResult<CreateResponse> {
        self.create(EntityKind::Notebook, &request.entity.name, request.auth_token)
    }

    async fn update_notebook(
        &self,
        request: UploadRequest<'_, Notebook>,
    ) -> RemoteResult<UpdateResponse> {
        self.update(EntityKind::Notebook, &request.entity.name, request.auth_token)
    }

    async fn create_note(&self, request: UploadRequest<'_, Note>) -> RemoteResult<CreateResponse> {
        self.create(EntityKind::Note, &request.entity.title, request.auth_token)
    }

    async fn update_note(&self, request: UploadRequest<'_, Note>) -> RemoteResult<UpdateResponse> {
        self.update(EntityKind::Note, &request.entity.title, request.auth_token)
    }
}

// ===== Instrumented local storage =====

/// Memory storage whose requests wait for permits and can be made to fail
struct TestStorage {
    inner: MemoryStorage,
    gate: Semaphore,
    /// Extra gate for updates only
    update_gate: Semaphore,
    find_calls: AtomicUsize,
    failing_listing: Mutex<Option<EntityKind>>,
    failing_updates: AtomicBool,
}

impl TestStorage {
    fn build(snapshot: Snapshot, permits: usize, update_permits: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStorage::from_snapshot(snapshot),
            gate: Semaphore::new(permits),
            update_gate: Semaphore::new(update_permits),
            find_calls: AtomicUsize::new(0),
            failing_listing: Mutex::new(None),
            failing_updates: AtomicBool::new(false),
        })
    }

    fn new(snapshot: Snapshot) -> Arc<Self> {
        Self::build(snapshot, Semaphore::MAX_PERMITS, Semaphore::MAX_PERMITS)
    }

    /// Requests block until [`TestStorage::open`] is called
    fn gated(snapshot: Snapshot) -> Arc<Self> {
        Self::build(snapshot, 0, Semaphore::MAX_PERMITS)
    }

    /// Listings and lookups run; updates block until [`TestStorage::release_updates`]
    fn holding_updates(snapshot: Snapshot) -> Arc<Self> {
        Self::build(snapshot, Semaphore::MAX_PERMITS, 0)
    }

    fn open(&self) {
        self.gate.add_permits(1_000);
    }

    fn release_updates(&self) {
        self.update_gate.add_permits(1_000);
    }

    fn fail_listing(&self, kind: EntityKind) {
        *self.failing_listing.lock().unwrap() = Some(kind);
    }

    fn fail_updates(&self) {
        self.failing_updates.store(true, Ordering::SeqCst);
    }

    fn find_calls(&self) -> usize {
        self.find_calls.load(Ordering::SeqCst)
    }

    fn contents(&self) -> Snapshot {
        self.inner.snapshot().unwrap()
    }

    async fn pass(&self) -> crate::storage::Result<()> {
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        permit.forget();
        Ok(())
    }

    fn check_listing(&self, kind: EntityKind) -> crate::storage::Result<()> {
        if *self.failing_listing.lock().unwrap() == Some(kind) {
            return Err(StorageError::Backend("disk on fire".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LocalStorage for TestStorage {
    async fn list_tags(&self, query: &ListQuery) -> crate::storage::Result<Vec<Tag>> {
        self.pass().await?;
        self.check_listing(EntityKind::Tag)?;
        self.inner.list_tags(query).await
    }

    async fn list_saved_searches(&self, query: &ListQuery) -> crate::storage::Result<Vec<SavedSearch>> {
        self.pass().await?;
        self.check_listing(EntityKind::SavedSearch)?;
        self.inner.list_saved_searches(query).await
    }

    async fn list_notebooks(&self, query: &ListQuery) -> crate::storage::Result<Vec<Notebook>> {
        self.pass().await?;
        self.check_listing(EntityKind::Notebook)?;
        self.inner.list_notebooks(query).await
    }

    async fn list_notes(&self, query: &ListQuery) -> crate::storage::Result<Vec<Note>> {
        self.pass().await?;
        self.check_listing(EntityKind::Note)?;
        self.inner.list_notes(query).await
    }

    async fn list_linked_accounts(&self) -> crate::storage::Result<Vec<LinkedAccount>> {
        self.pass().await?;
        self.inner.list_linked_accounts().await
    }

    async fn find_notebook_by_guid(&self, guid: &str) -> crate::storage::Result<Notebook> {
        self.pass().await?;
        self.find_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.find_notebook_by_guid(guid).await
    }

    async fn update(&self, entity: LocalEntity) -> crate::storage::Result<()> {
        self.pass().await?;
        let permit = self
            .update_gate
            .acquire()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        permit.forget();
        if self.failing_updates.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("read-only file system".to_string()));
        }
        self.inner.update(entity).await
    }
}

// ===== Helpers =====

type Notifications = mpsc::UnboundedReceiver<SyncNotification>;

fn spawn_engine(
    storage: &Arc<TestStorage>,
    note_store: &Arc<ScriptedNoteStore>,
) -> (SendLocalChangesHandle, Notifications) {
    spawn_engine_with(storage, note_store, SendChangesConfig::default())
}

fn spawn_engine_with(
    storage: &Arc<TestStorage>,
    note_store: &Arc<ScriptedNoteStore>,
    config: SendChangesConfig,
) -> (SendLocalChangesHandle, Notifications) {
    let _ = env_logger::builder().is_test(true).try_init();
    SendLocalChangesManager::spawn(storage.clone(), note_store.clone(), config)
}

/// Poll the engine until its state satisfies `wanted`
async fn wait_for_state(
    handle: &SendLocalChangesHandle,
    wanted: impl Fn(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            let snapshot = handle.snapshot().await.expect("engine shut down");
            if wanted(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for engine state")
}

async fn next(notifications: &mut Notifications) -> SyncNotification {
    tokio::time::timeout(Duration::from_secs(60), notifications.recv())
        .await
        .expect("timed out waiting for a notification")
        .expect("engine shut down")
}

/// Everything up to and including the terminal notification
async fn until_terminal(notifications: &mut Notifications) -> Vec<SyncNotification> {
    let mut received = Vec::new();
    loop {
        let notification = next(notifications).await;
        let done = notification.is_terminal();
        received.push(notification);
        if done {
            return received;
        }
    }
}

/// Everything up to and including the first notification matching `wanted`
async fn until(
    notifications: &mut Notifications,
    wanted: impl Fn(&SyncNotification) -> bool,
) -> Vec<SyncNotification> {
    let mut received = Vec::new();
    loop {
        let notification = next(notifications).await;
        let done = wanted(&notification);
        received.push(notification);
        if done {
            return received;
        }
    }
}

async fn assert_quiet(notifications: &mut Notifications) {
    let result = tokio::time::timeout(Duration::from_secs(1), notifications.recv()).await;
    assert!(result.is_err(), "unexpected notification: {:?}", result);
}

fn tokens_for(accounts: &[&str], prefix: &str, lifetime: chrono::Duration) -> HashMap<String, AuthToken> {
    accounts
        .iter()
        .map(|guid| {
            let token = AuthToken::new(format!("{}-{}", prefix, guid), Utc::now() + lifetime);
            (guid.to_string(), token)
        })
        .collect()
}

fn count(received: &[SyncNotification], wanted: impl Fn(&SyncNotification) -> bool) -> usize {
    received.iter().filter(|n| wanted(n)).count()
}

fn synced_notebook(guid: &str) -> Notebook {
    let mut notebook = Notebook::new(format!("notebook {}", guid)).with_meta(SyncMeta::modified(guid, 3));
    notebook.meta.dirty = false;
    notebook
}

// ===== Passes =====

#[tokio::test(start_paused = true)]
async fn test_two_tags_advance_cursor_to_last_count() {
    let tag_a = Tag::new("A");
    let tag_b = Tag::new("B").with_meta(SyncMeta::modified("42", 5));
    let storage = TestStorage::new(Snapshot {
        tags: vec![tag_a.clone(), tag_b],
        ..Default::default()
    });
    let note_store = ScriptedNoteStore::new(11);

    let (handle, mut notifications) = spawn_engine(&storage, &note_store);
    handle.start(10);

    let received = until_terminal(&mut notifications).await;
    assert_eq!(
        received,
        vec![
            SyncNotification::ReceivedOwnAccountDirtyObjects,
            SyncNotification::ReceivedAllDirtyObjects,
            SyncNotification::Finished { cursor: 12 },
        ]
    );

    let calls = note_store.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].create);
    assert!(!calls[1].create);
    assert!(calls.iter().all(|c| c.auth_token.is_empty()));

    let stored = storage.contents();
    let a = stored.tags.iter().find(|t| t.meta.local_id == tag_a.meta.local_id).unwrap();
    assert_eq!(a.meta.guid.as_deref(), Some("tag-11"));
    assert_eq!(a.meta.update_sequence_num, Some(11));
    assert!(!a.meta.dirty);
    assert!(stored.tags.iter().all(|t| !t.meta.dirty));
}

#[tokio::test(start_paused = true)]
async fn test_nothing_dirty_finishes_at_start_cursor() {
    let storage = TestStorage::new(Snapshot::default());
    let note_store = ScriptedNoteStore::new(1);

    let (handle, mut notifications) = spawn_engine(&storage, &note_store);
    handle.start(7);

    let received = until_terminal(&mut notifications).await;
    assert_eq!(received.last(), Some(&SyncNotification::Finished { cursor: 7 }));
    assert!(note_store.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_kinds_are_uploaded_in_dependency_order() {
    let existing = synced_notebook("nb-1");
    let storage = TestStorage::new(Snapshot {
        notes: vec![Note::new("note").in_notebook(&existing)],
        notebooks: vec![existing, Notebook::new("notebook")],
        saved_searches: vec![SavedSearch::new("search", "tag:x")],
        tags: vec![Tag::new("tag")],
        ..Default::default()
    });
    let note_store = ScriptedNoteStore::new(1);

    let (handle, mut notifications) = spawn_engine(&storage, &note_store);
    handle.start(0);
    until_terminal(&mut notifications).await;

    let kinds: Vec<EntityKind> = note_store.calls().iter().map(|c| c.kind).collect();
    assert_eq!(
        kinds,
        vec![
            EntityKind::Tag,
            EntityKind::SavedSearch,
            EntityKind::Notebook,
            EntityKind::Note,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_count_gap_is_signaled_once() {
    let storage = TestStorage::new(Snapshot {
        tags: vec![Tag::new("a"), Tag::new("b"), Tag::new("c")],
        ..Default::default()
    });
    let note_store = ScriptedNoteStore::scripted(
        11,
        vec![Reply::Usn(11), Reply::Usn(15), Reply::Usn(16)],
    );

    let (handle, mut notifications) = spawn_engine(&storage, &note_store);
    handle.start(10);

    let received = until_terminal(&mut notifications).await;
    assert_eq!(
        count(&received, |n| *n == SyncNotification::MustRepeatInboundSync),
        1
    );
    assert_eq!(received.last(), Some(&SyncNotification::Finished { cursor: 11 }));
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_retries_same_entity_after_delay() {
    let storage = TestStorage::new(Snapshot {
        tags: vec![Tag::new("first"), Tag::new("second")],
        ..Default::default()
    });
    let note_store = ScriptedNoteStore::scripted(
        11,
        vec![Reply::Fail(RemoteError::RateLimitReached { retry_after_secs: 5 })],
    );

    let (handle, mut notifications) = spawn_engine(&storage, &note_store);
    handle.start(10);

    until(&mut notifications, |n| {
        *n == SyncNotification::RateLimitExceeded { seconds: 5 }
    })
    .await;
    assert!(handle.rate_limit_is_active().await);

    let received = until_terminal(&mut notifications).await;
    assert_eq!(received.last(), Some(&SyncNotification::Finished { cursor: 12 }));
    assert!(!handle.rate_limit_is_active().await);

    let calls = note_store.calls();
    assert_eq!(note_store.names(), vec!["first", "first", "second"]);
    assert!(calls[1].at - calls[0].at >= Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn test_negative_rate_limit_fails_pass() {
    let storage = TestStorage::new(Snapshot {
        tags: vec![Tag::new("a")],
        ..Default::default()
    });
    let note_store = ScriptedNoteStore::scripted(
        11,
        vec![Reply::Fail(RemoteError::RateLimitReached { retry_after_secs: -3 })],
    );

    let (handle, mut notifications) = spawn_engine(&storage, &note_store);
    handle.start(10);

    let received = until_terminal(&mut notifications).await;
    let Some(SyncNotification::Failure { message, cursor }) = received.last() else {
        panic!("expected failure, got {:?}", received);
    };
    assert!(message.contains("negative: -3"));
    assert_eq!(*cursor, 10);
}

#[tokio::test(start_paused = true)]
async fn test_linked_account_tokens_are_requested_as_one_batch() {
    let storage = TestStorage::new(Snapshot {
        tags: vec![
            Tag::new("own"),
            Tag::new("shared 1").with_meta(SyncMeta::new_local().in_linked_account("L1")),
            Tag::new("shared 2").with_meta(SyncMeta::new_local().in_linked_account("L2")),
        ],
        linked_accounts: vec![LinkedAccount::new("L1", "k1"), LinkedAccount::new("L2", "k2")],
        ..Default::default()
    });
    let note_store = ScriptedNoteStore::new(1);

    let (handle, mut notifications) = spawn_engine(&storage, &note_store);
    handle.start(0);

    let received = until(&mut notifications, |n| {
        matches!(n, SyncNotification::RequestLinkedAccountTokens { .. })
    })
    .await;
    let Some(SyncNotification::RequestLinkedAccountTokens { accounts }) = received.last() else {
        unreachable!();
    };
    let guids: Vec<&str> = accounts.iter().map(|a| a.guid.as_str()).collect();
    assert_eq!(guids, vec!["L1", "L2"]);
    assert!(note_store.calls().is_empty());

    handle.set_linked_account_tokens(tokens_for(&["L1", "L2"], "token", chrono::Duration::days(1)));
    let received = until_terminal(&mut notifications).await;
    assert_eq!(received.last(), Some(&SyncNotification::Finished { cursor: 3 }));
    assert_eq!(
        count(&received, |n| matches!(n, SyncNotification::RequestLinkedAccountTokens { .. })),
        0
    );

    let tokens: Vec<String> = note_store.calls().into_iter().map(|c| c.auth_token).collect();
    assert_eq!(tokens, vec!["", "token-L1", "token-L2"]);
}

#[tokio::test(start_paused = true)]
async fn test_expiring_token_is_refreshed_before_use() {
    let storage = TestStorage::new(Snapshot {
        tags: vec![Tag::new("shared").with_meta(SyncMeta::new_local().in_linked_account("L1"))],
        linked_accounts: vec![LinkedAccount::new("L1", "k1")],
        ..Default::default()
    });
    let note_store = ScriptedNoteStore::new(1);

    let (handle, mut notifications) = spawn_engine(&storage, &note_store);
    handle.set_linked_account_tokens(tokens_for(&["L1"], "stale", chrono::Duration::hours(1)));
    handle.start(0);

    until(&mut notifications, |n| {
        matches!(n, SyncNotification::RequestLinkedAccountTokens { .. })
    })
    .await;
    handle.set_linked_account_tokens(tokens_for(&["L1"], "fresh", chrono::Duration::days(1)));

    let received = until_terminal(&mut notifications).await;
    assert_eq!(received.last(), Some(&SyncNotification::Finished { cursor: 1 }));
    assert_eq!(note_store.calls()[0].auth_token, "fresh-L1");
}

#[tokio::test(start_paused = true)]
async fn test_linked_account_auth_expiry_refreshes_all_tokens() {
    let storage = TestStorage::new(Snapshot {
        tags: vec![Tag::new("shared").with_meta(SyncMeta::new_local().in_linked_account("L1"))],
        linked_accounts: vec![LinkedAccount::new("L1", "k1")],
        ..Default::default()
    });
    let note_store = ScriptedNoteStore::scripted(1, vec![Reply::Fail(RemoteError::AuthExpired)]);

    let (handle, mut notifications) = spawn_engine(&storage, &note_store);
    handle.set_linked_account_tokens(tokens_for(&["L1"], "old", chrono::Duration::days(1)));
    handle.start(0);

    until(&mut notifications, |n| {
        matches!(n, SyncNotification::RequestLinkedAccountTokens { .. })
    })
    .await;
    handle.set_linked_account_tokens(tokens_for(&["L1"], "new", chrono::Duration::days(1)));

    let received = until_terminal(&mut notifications).await;
    assert_eq!(received.last(), Some(&SyncNotification::Finished { cursor: 1 }));

    let tokens: Vec<String> = note_store.calls().into_iter().map(|c| c.auth_token).collect();
    assert_eq!(tokens, vec!["old-L1", "new-L1"]);
}

#[tokio::test(start_paused = true)]
async fn test_incomplete_token_batch_fails_pass() {
    let storage = TestStorage::new(Snapshot {
        tags: vec![Tag::new("own")],
        linked_accounts: vec![LinkedAccount::new("L1", "k1"), LinkedAccount::new("L2", "k2")],
        ..Default::default()
    });
    let note_store = ScriptedNoteStore::new(1);

    let (handle, mut notifications) = spawn_engine(&storage, &note_store);
    handle.start(0);

    until(&mut notifications, |n| {
        matches!(n, SyncNotification::RequestLinkedAccountTokens { .. })
    })
    .await;
    handle.set_linked_account_tokens(tokens_for(&["L1"], "token", chrono::Duration::days(1)));

    let received = until_terminal(&mut notifications).await;
    assert!(matches!(received.last(), Some(SyncNotification::Failure { .. })));
    assert!(note_store.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_refreshed_token_inside_margin_fails_pass() {
    let storage = TestStorage::new(Snapshot {
        tags: vec![Tag::new("shared").with_meta(SyncMeta::new_local().in_linked_account("L1"))],
        linked_accounts: vec![LinkedAccount::new("L1", "k1")],
        ..Default::default()
    });
    let note_store = ScriptedNoteStore::new(1);

    let (handle, mut notifications) = spawn_engine(&storage, &note_store);
    handle.start(0);

    until(&mut notifications, |n| {
        matches!(n, SyncNotification::RequestLinkedAccountTokens { .. })
    })
    .await;
    handle.set_linked_account_tokens(tokens_for(&["L1"], "short", chrono::Duration::hours(1)));

    let received = until_terminal(&mut notifications).await;
    let Some(SyncNotification::Failure { message, cursor }) = received.last() else {
        panic!("expected failure, got {:?}", received);
    };
    assert!(message.contains("L1"));
    assert_eq!(*cursor, 0);
    assert_eq!(
        count(&received, |n| matches!(n, SyncNotification::RequestLinkedAccountTokens { .. })),
        0
    );
    assert!(note_store.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_owning_account_auth_expiry_pauses_until_resumed() {
    let storage = TestStorage::new(Snapshot {
        tags: vec![Tag::new("a")],
        ..Default::default()
    });
    let note_store = ScriptedNoteStore::scripted(11, vec![Reply::Fail(RemoteError::AuthExpired)]);

    let (handle, mut notifications) = spawn_engine(&storage, &note_store);
    handle.start(10);

    let received = until(&mut notifications, |n| {
        *n == SyncNotification::RequestOwningAccountAuthorization
    })
    .await;
    assert!(received.contains(&SyncNotification::Paused {
        pending_authorization: true
    }));
    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Paused);
    assert_eq!(snapshot.pending_entities, 1);

    handle.resume();
    let received = until_terminal(&mut notifications).await;
    assert_eq!(received.last(), Some(&SyncNotification::Finished { cursor: 11 }));
    assert_eq!(note_store.names(), vec!["a", "a"]);
}

#[tokio::test(start_paused = true)]
async fn test_conflict_pauses_without_further_uploads() {
    let storage = TestStorage::new(Snapshot {
        tags: vec![Tag::new("a"), Tag::new("b")],
        ..Default::default()
    });
    let note_store = ScriptedNoteStore::scripted(11, vec![Reply::Fail(RemoteError::DataConflict)]);

    let (handle, mut notifications) = spawn_engine(&storage, &note_store);
    handle.start(10);

    let received = until(&mut notifications, |n| matches!(n, SyncNotification::Paused { .. })).await;
    assert_eq!(
        &received[received.len() - 2..],
        &[
            SyncNotification::ConflictDetected,
            SyncNotification::Paused {
                pending_authorization: false
            },
        ]
    );

    assert_quiet(&mut notifications).await;
    assert_eq!(note_store.calls().len(), 1);
    assert_eq!(handle.snapshot().await.unwrap().state, SessionState::Paused);
}

#[tokio::test(start_paused = true)]
async fn test_start_while_paused_resumes_with_new_cursor() {
    let storage = TestStorage::new(Snapshot {
        tags: vec![Tag::new("a")],
        ..Default::default()
    });
    let note_store = ScriptedNoteStore::scripted(11, vec![Reply::Fail(RemoteError::DataConflict)]);

    let (handle, mut notifications) = spawn_engine(&storage, &note_store);
    handle.start(10);
    until(&mut notifications, |n| matches!(n, SyncNotification::Paused { .. })).await;

    // An inbound pass moved the cursor meanwhile
    *note_store.next_usn.lock().unwrap() = 21;
    handle.start(20);

    let received = until_terminal(&mut notifications).await;
    assert_eq!(received, vec![SyncNotification::Finished { cursor: 21 }]);
}

#[tokio::test(start_paused = true)]
async fn test_notes_in_one_notebook_need_one_lookup() {
    let notebook = synced_notebook("nb-1");
    let storage = TestStorage::new(Snapshot {
        notes: vec![
            Note::new("one").in_notebook(&notebook),
            Note::new("two").in_notebook(&notebook),
            Note::new("three").in_notebook(&notebook),
        ],
        notebooks: vec![notebook],
        ..Default::default()
    });
    let note_store = ScriptedNoteStore::new(1);

    let (handle, mut notifications) = spawn_engine(&storage, &note_store);
    handle.start(0);

    let received = until_terminal(&mut notifications).await;
    assert_eq!(received.last(), Some(&SyncNotification::Finished { cursor: 3 }));
    assert_eq!(storage.find_calls(), 1);
    assert_eq!(note_store.names(), vec!["one", "two", "three"]);
}

#[tokio::test(start_paused = true)]
async fn test_note_in_shared_notebook_uses_linked_account_token() {
    let mut shared = synced_notebook("nb-shared");
    shared.meta.linked_account = Some("L1".to_string());
    let storage = TestStorage::new(Snapshot {
        notes: vec![Note::new("shared note")
            .in_notebook(&shared)
            .with_meta(SyncMeta::new_local().in_linked_account("L1"))],
        notebooks: vec![shared],
        linked_accounts: vec![LinkedAccount::new("L1", "k1")],
        ..Default::default()
    });
    let note_store = ScriptedNoteStore::new(1);

    let (handle, mut notifications) = spawn_engine(&storage, &note_store);
    handle.set_linked_account_tokens(tokens_for(&["L1"], "token", chrono::Duration::days(1)));
    handle.start(0);

    let received = until_terminal(&mut notifications).await;
    assert_eq!(received.last(), Some(&SyncNotification::Finished { cursor: 1 }));
    assert_eq!(note_store.calls()[0].auth_token, "token-L1");
}

#[tokio::test(start_paused = true)]
async fn test_assigned_ids_reach_notes_sent_later() {
    let tag = Tag::new("travel");
    let notebook = Notebook::new("journal");
    let note = Note::new("trip").in_notebook(&notebook).tagged(&tag);
    let note_id = note.meta.local_id;
    let storage = TestStorage::new(Snapshot {
        tags: vec![tag],
        notebooks: vec![notebook],
        notes: vec![note],
        ..Default::default()
    });
    let note_store = ScriptedNoteStore::new(1);

    let (handle, mut notifications) = spawn_engine(&storage, &note_store);
    handle.start(0);

    let received = until_terminal(&mut notifications).await;
    assert_eq!(received.last(), Some(&SyncNotification::Finished { cursor: 3 }));
    assert_eq!(storage.find_calls(), 0);

    let stored = storage.contents();
    let note = stored.notes.iter().find(|n| n.meta.local_id == note_id).unwrap();
    assert_eq!(note.notebook_guid.as_deref(), Some("notebook-2"));
    assert_eq!(note.tag_guids, vec!["tag-1".to_string()]);
    assert!(note.tag_local_ids.is_empty());
    assert_eq!(note.meta.guid.as_deref(), Some("note-3"));
}

#[tokio::test(start_paused = true)]
async fn test_remote_failure_reports_operation_and_cursor() {
    let storage = TestStorage::new(Snapshot {
        notebooks: vec![Notebook::new("ok"), Notebook::new("rejected")],
        ..Default::default()
    });
    let note_store = ScriptedNoteStore::scripted(
        11,
        vec![Reply::Next, Reply::Fail(RemoteError::Other("quota exceeded".to_string()))],
    );

    let (handle, mut notifications) = spawn_engine(&storage, &note_store);
    handle.start(10);

    let received = until_terminal(&mut notifications).await;
    assert_eq!(
        received.last(),
        Some(&SyncNotification::Failure {
            message: "Can't send new and/or modified notebooks to the service: quota exceeded"
                .to_string(),
            cursor: 11,
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_listing_failure_fails_pass() {
    let storage = TestStorage::new(Snapshot {
        tags: vec![Tag::new("a")],
        ..Default::default()
    });
    storage.fail_listing(EntityKind::Notebook);
    let note_store = ScriptedNoteStore::new(1);

    let (handle, mut notifications) = spawn_engine(&storage, &note_store);
    handle.start(4);

    let received = until_terminal(&mut notifications).await;
    let Some(SyncNotification::Failure { message, cursor }) = received.last() else {
        panic!("expected failure, got {:?}", received);
    };
    assert!(message.starts_with("Error listing dirty notebooks from local storage"));
    assert_eq!(*cursor, 4);
    assert!(note_store.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_missing_notebook_of_note_fails_pass() {
    let gone = synced_notebook("nb-gone");
    let storage = TestStorage::new(Snapshot {
        notes: vec![Note::new("lost").in_notebook(&gone)],
        ..Default::default()
    });
    let note_store = ScriptedNoteStore::new(1);

    let (handle, mut notifications) = spawn_engine(&storage, &note_store);
    handle.start(2);

    let received = until_terminal(&mut notifications).await;
    let Some(SyncNotification::Failure { message, cursor }) = received.last() else {
        panic!("expected failure, got {:?}", received);
    };
    assert!(message.starts_with("Can't find notebook nb-gone in local storage"));
    assert_eq!(*cursor, 2);
    assert_eq!(storage.find_calls(), 1);
    assert!(note_store.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_local_update_failure_fails_pass() {
    let storage = TestStorage::new(Snapshot {
        tags: vec![Tag::new("a"), Tag::new("b")],
        ..Default::default()
    });
    storage.fail_updates();
    let note_store = ScriptedNoteStore::new(11);

    let (handle, mut notifications) = spawn_engine(&storage, &note_store);
    handle.start(10);

    let received = until_terminal(&mut notifications).await;
    let Some(SyncNotification::Failure { message, cursor }) = received.last() else {
        panic!("expected failure, got {:?}", received);
    };
    assert!(message.starts_with("Couldn't update tag in local storage"));
    assert!(message.contains("read-only file system"));
    assert!(*cursor >= 11);
    assert!(storage.contents().tags.iter().all(|t| t.meta.dirty));
}

#[tokio::test(start_paused = true)]
async fn test_linked_account_without_guid_fails_pass() {
    let storage = TestStorage::new(Snapshot {
        linked_accounts: vec![LinkedAccount::new("", "k")],
        ..Default::default()
    });
    let note_store = ScriptedNoteStore::new(1);

    let (handle, mut notifications) = spawn_engine(&storage, &note_store);
    handle.start(0);

    let received = until_terminal(&mut notifications).await;
    assert_eq!(
        received.last(),
        Some(&SyncNotification::Failure {
            message: "Found linked account without guid set in local storage".to_string(),
            cursor: 0,
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_stop_waits_for_in_flight_requests() {
    let storage = TestStorage::gated(Snapshot {
        tags: vec![Tag::new("a")],
        ..Default::default()
    });
    let note_store = ScriptedNoteStore::new(1);

    let (handle, mut notifications) = spawn_engine(&storage, &note_store);
    handle.start(5);
    handle.stop();

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Stopping);
    assert_eq!(snapshot.pending_requests, 5);
    assert!(handle.has_pending_requests().await);

    storage.open();
    let received = until_terminal(&mut notifications).await;
    assert_eq!(
        received,
        vec![
            SyncNotification::Stopped,
            SyncNotification::Finished { cursor: 5 },
        ]
    );
    assert!(note_store.calls().is_empty());
    assert!(!handle.has_pending_requests().await);
}

#[tokio::test(start_paused = true)]
async fn test_stop_is_kept_when_mailbox_is_full() {
    let storage = TestStorage::new(Snapshot {
        tags: vec![Tag::new("a")],
        ..Default::default()
    });
    let note_store = ScriptedNoteStore::new(1);
    let config = SendChangesConfig {
        mailbox_capacity: 1,
        ..Default::default()
    };

    let (handle, mut notifications) = spawn_engine_with(&storage, &note_store, config);
    handle.start(0);
    handle.stop();

    let received = until_terminal(&mut notifications).await;
    assert_eq!(
        received,
        vec![
            SyncNotification::Stopped,
            SyncNotification::Finished { cursor: 0 },
        ]
    );
    assert!(note_store.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stop_waits_for_pending_update() {
    let tag = Tag::new("a");
    let tag_id = tag.meta.local_id;
    let storage = TestStorage::holding_updates(Snapshot {
        tags: vec![tag],
        ..Default::default()
    });
    let note_store = ScriptedNoteStore::new(11);

    let (handle, mut notifications) = spawn_engine(&storage, &note_store);
    handle.start(10);
    until(&mut notifications, |n| *n == SyncNotification::ReceivedAllDirtyObjects).await;

    wait_for_state(&handle, |s| s.pending_entities == 0 && s.pending_requests == 1).await;
    assert_eq!(note_store.calls().len(), 1);

    handle.stop();
    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Stopping);
    assert_eq!(snapshot.pending_requests, 1);
    assert_quiet(&mut notifications).await;

    storage.release_updates();
    let received = until_terminal(&mut notifications).await;
    assert_eq!(
        received,
        vec![
            SyncNotification::Stopped,
            SyncNotification::Finished { cursor: 11 },
        ]
    );

    let stored = storage.contents();
    let tag = stored.tags.iter().find(|t| t.meta.local_id == tag_id).unwrap();
    assert_eq!(tag.meta.update_sequence_num, Some(11));
    assert!(!tag.meta.dirty);
}

#[tokio::test(start_paused = true)]
async fn test_stop_when_idle_reports_stopped() {
    let storage = TestStorage::new(Snapshot::default());
    let note_store = ScriptedNoteStore::new(1);

    let (handle, mut notifications) = spawn_engine(&storage, &note_store);
    handle.stop();

    assert_eq!(next(&mut notifications).await, SyncNotification::Stopped);
    assert_quiet(&mut notifications).await;
}

#[tokio::test(start_paused = true)]
async fn test_pause_during_collection_holds_results_until_resume() {
    let storage = TestStorage::gated(Snapshot {
        tags: vec![Tag::new("a")],
        ..Default::default()
    });
    let note_store = ScriptedNoteStore::new(1);

    let (handle, mut notifications) = spawn_engine(&storage, &note_store);
    handle.start(0);
    handle.pause();

    assert_eq!(
        next(&mut notifications).await,
        SyncNotification::Paused {
            pending_authorization: false
        }
    );
    storage.open();
    assert_quiet(&mut notifications).await;
    assert!(!handle.has_pending_requests().await);

    handle.resume();
    let received = until_terminal(&mut notifications).await;
    assert_eq!(
        received,
        vec![
            SyncNotification::ReceivedOwnAccountDirtyObjects,
            SyncNotification::ReceivedAllDirtyObjects,
            SyncNotification::Finished { cursor: 1 },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_local_only_entities_are_not_sent() {
    let mut private = Tag::new("private");
    private.meta.local_only = true;
    let storage = TestStorage::new(Snapshot {
        tags: vec![private, Tag::new("public")],
        ..Default::default()
    });
    let note_store = ScriptedNoteStore::new(1);

    let (handle, mut notifications) = spawn_engine(&storage, &note_store);
    handle.start(0);
    until_terminal(&mut notifications).await;

    assert_eq!(note_store.names(), vec!["public"]);
}

#[tokio::test(start_paused = true)]
async fn test_dropping_every_handle_shuts_engine_down() {
    let storage = TestStorage::new(Snapshot::default());
    let note_store = ScriptedNoteStore::new(1);

    let (handle, mut notifications) = spawn_engine(&storage, &note_store);
    drop(handle);

    let closed = tokio::time::timeout(Duration::from_secs(60), notifications.recv()).await;
    assert!(matches!(closed, Ok(None)));
}
