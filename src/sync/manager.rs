use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::storage::{EntityKind, LocalEntity, LocalStorage, Note, Notebook, SavedSearch, StorageError, Tag};

use super::auth::{AuthToken, AuthTokenCache, TokenStatus};
use super::collector::{run_listing, CollectStep, Collector, DirtyEntitySet, Listed, ListingRequest};
use super::config::SendChangesConfig;
use super::handle::{SendLocalChangesHandle, SyncNotification};
use super::notebooks::{FindNotebookRequest, NotebookResolver};
use super::policy::{self, RateLimitTimers, Verdict};
use super::remote::{NoteStore, RemoteError};
use super::sequencer::{self, CursorUpdate, SyncCursor, Syncable, UPLOAD_ORDER};

/// Externally visible state of a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Idle,
    CollectingOwnAccount,
    CollectingLinkedAccounts,
    Uploading,
    Paused,
    Stopping,
    Finished,
}

/// Point-in-time view of the engine, for callers and tests
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub cursor: i32,
    pub must_repeat_inbound_sync: bool,
    pub rate_limit_active: bool,
    pub pending_requests: usize,
    pub pending_entities: usize,
}

/// Caller requests, delivered in order on an unbounded channel
#[derive(Debug)]
pub(crate) enum Command {
    Start { cursor: i32 },
    Pause,
    Resume,
    Stop,
    LinkedAccountTokens(HashMap<String, AuthToken>),
    Snapshot(oneshot::Sender<SessionSnapshot>),
}

/// Completions of work the engine started, delivered through its mailbox
#[derive(Debug)]
pub(crate) enum EngineEvent {
    Listed {
        request_id: Uuid,
        result: Result<Listed, StorageError>,
    },
    NotebookFound {
        request_id: Uuid,
        result: Result<Notebook, StorageError>,
    },
    Persisted {
        request_id: Uuid,
        result: Result<(), StorageError>,
    },
    RateLimitElapsed {
        kind: EntityKind,
        timer_id: Uuid,
    },
}

/// Progress of the pass, independent of pause/stop requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    CollectingOwnAccount,
    CollectingLinkedAccounts,
    Uploading,
    Finished,
}

/// Outbound synchronization engine.
///
/// Runs as a single task that owns all pass state. Local storage requests
/// are spawned and report back through the mailbox; remote calls are
/// awaited in place so only one entity is in flight at a time. The run loop
/// ends once every handle is dropped.
pub struct SendLocalChangesManager {
    storage: Arc<dyn LocalStorage>,
    note_store: Arc<dyn NoteStore>,
    mailbox: mpsc::Sender<EngineEvent>,
    notifications: mpsc::UnboundedSender<SyncNotification>,

    phase: Phase,
    paused: bool,
    stopping: bool,
    /// An upload step should run once the mailbox is drained
    uploading: bool,
    /// Kind of the last uploaded batch; tokens are checked when it changes
    current_batch: Option<EntityKind>,

    cursor: SyncCursor,
    collector: Collector,
    pending: DirtyEntitySet,
    notebooks: NotebookResolver,
    persist_requests: HashMap<Uuid, EntityKind>,
    rate_limits: RateLimitTimers,
    /// Kept across passes
    tokens: AuthTokenCache,
}

impl SendLocalChangesManager {
    /// Start the engine on the current tokio runtime
    pub fn spawn(
        storage: Arc<dyn LocalStorage>,
        note_store: Arc<dyn NoteStore>,
        config: SendChangesConfig,
    ) -> (SendLocalChangesHandle, mpsc::UnboundedReceiver<SyncNotification>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (mailbox_tx, mailbox_rx) = mpsc::channel(config.mailbox_capacity.max(1));
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();

        let manager = Self {
            storage,
            note_store,
            mailbox: mailbox_tx,
            notifications: notify_tx,
            phase: Phase::Idle,
            paused: false,
            stopping: false,
            uploading: false,
            current_batch: None,
            cursor: SyncCursor::default(),
            collector: Collector::new(),
            pending: DirtyEntitySet::default(),
            notebooks: NotebookResolver::new(),
            persist_requests: HashMap::new(),
            rate_limits: RateLimitTimers::new(),
            tokens: AuthTokenCache::new(config.token_expiry_margin()),
        };

        tokio::spawn(manager.run(command_rx, mailbox_rx));

        (SendLocalChangesHandle::new(command_tx), notify_rx)
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut mailbox: mpsc::Receiver<EngineEvent>,
    ) {
        log::debug!("Outbound sync engine started");

        loop {
            if self.upload_step_due() {
                match commands.try_recv() {
                    Ok(command) => {
                        self.handle_command(command);
                        continue;
                    }
                    Err(mpsc::error::TryRecvError::Disconnected) => break,
                    Err(mpsc::error::TryRecvError::Empty) => {}
                }
                match mailbox.try_recv() {
                    Ok(event) => self.handle_event(event),
                    Err(_) => self.upload_step().await,
                }
                continue;
            }

            // The manager keeps a mailbox sender, so only the command
            // channel can close
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = mailbox.recv() => self.handle_event(event),
            }
        }

        self.rate_limits.cancel_all();
        log::debug!("Outbound sync engine shut down");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { cursor } => self.start(cursor),
            Command::Pause => self.pause(),
            Command::Resume => self.resume(),
            Command::Stop => self.stop(),
            Command::LinkedAccountTokens(tokens) => self.on_linked_account_tokens(tokens),
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Listed { request_id, result } => self.on_listed(request_id, result),
            EngineEvent::NotebookFound { request_id, result } => {
                self.on_notebook_found(request_id, result)
            }
            EngineEvent::Persisted { request_id, result } => self.on_persisted(request_id, result),
            EngineEvent::RateLimitElapsed { kind, timer_id } => {
                self.on_rate_limit_elapsed(kind, timer_id)
            }
        }
    }

    // ===== Session control =====

    fn start(&mut self, cursor: i32) {
        log::debug!("Starting to send local changes: last update count = {}", cursor);

        if self.stopping {
            log::warn!("Ignoring start request while the previous pass is stopping");
            return;
        }

        if self.paused && self.is_active() {
            self.cursor.set_value(cursor);
            self.resume();
            return;
        }

        if self.is_active() {
            log::info!("Restarting a pass that was still in progress");
        }

        self.clear();
        self.cursor = SyncCursor::new(cursor);
        self.tokens.begin_pass();
        self.begin_collection();
    }

    fn pause(&mut self) {
        if !self.is_active() || self.stopping {
            log::debug!("Nothing to pause");
            return;
        }
        log::debug!("Pausing sending of local changes");
        self.paused = true;
        self.notify(SyncNotification::Paused {
            pending_authorization: false,
        });
    }

    fn resume(&mut self) {
        if !self.paused || self.stopping {
            return;
        }
        log::debug!("Resuming sending of local changes");
        self.paused = false;

        if !self.is_active() {
            return;
        }
        if self.collector.received_all() {
            self.phase = Phase::Uploading;
            self.send_local_changes();
        } else if self.collector.is_started() {
            self.advance_collection();
        } else {
            self.begin_collection();
        }
    }

    fn stop(&mut self) {
        log::debug!("Stop requested");
        if !self.is_active() {
            self.notify(SyncNotification::Stopped);
            return;
        }
        self.stopping = true;
        self.uploading = false;
        self.rate_limits.cancel_all();
        self.check_stopped();
    }

    /// Finalize a stop once the last tracked request has drained
    fn check_stopped(&mut self) {
        if !self.stopping || self.has_pending_requests() {
            return;
        }
        log::debug!("No pending requests left, finishing the stopped pass");
        let cursor = self.cursor.value();
        self.notify(SyncNotification::Stopped);
        self.notify(SyncNotification::Finished { cursor });
        self.clear();
        self.phase = Phase::Finished;
    }

    fn fail(&mut self, message: String) {
        log::warn!("Sending local changes failed: {}", message);
        let cursor = self.cursor.value();
        self.notify(SyncNotification::Failure { message, cursor });
        self.clear();
        self.phase = Phase::Finished;
    }

    fn clear(&mut self) {
        self.phase = Phase::Idle;
        self.paused = false;
        self.stopping = false;
        self.uploading = false;
        self.current_batch = None;
        self.collector.clear();
        self.pending.clear();
        self.notebooks.clear();
        self.persist_requests.clear();
        self.rate_limits.cancel_all();
    }

    fn is_active(&self) -> bool {
        !matches!(self.phase, Phase::Idle | Phase::Finished)
    }

    fn has_pending_requests(&self) -> bool {
        self.collector.has_pending_requests()
            || self.notebooks.has_pending_requests()
            || !self.persist_requests.is_empty()
    }

    fn state(&self) -> SessionState {
        if self.stopping {
            return SessionState::Stopping;
        }
        if self.paused {
            return SessionState::Paused;
        }
        match self.phase {
            Phase::Idle => SessionState::Idle,
            Phase::CollectingOwnAccount => SessionState::CollectingOwnAccount,
            Phase::CollectingLinkedAccounts => SessionState::CollectingLinkedAccounts,
            Phase::Uploading => SessionState::Uploading,
            Phase::Finished => SessionState::Finished,
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state(),
            cursor: self.cursor.value(),
            must_repeat_inbound_sync: self.cursor.must_repeat_inbound_sync(),
            rate_limit_active: self.rate_limits.is_active(),
            pending_requests: self.collector.pending_count()
                + usize::from(self.notebooks.has_pending_requests())
                + self.persist_requests.len(),
            pending_entities: self.pending.len(),
        }
    }

    fn notify(&self, notification: SyncNotification) {
        log::trace!("Notification: {:?}", notification);
        let _ = self.notifications.send(notification);
    }

    /// Run a local storage call as its own task and post the reply back
    fn dispatch<F>(&self, request: F)
    where
        F: std::future::Future<Output = EngineEvent> + Send + 'static,
    {
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            let event = request.await;
            let _ = mailbox.send(event).await;
        });
    }

    // ===== Collection =====

    fn begin_collection(&mut self) {
        self.phase = Phase::CollectingOwnAccount;
        let requests = self.collector.begin();
        self.dispatch_listings(requests);
    }

    fn dispatch_listings(&self, requests: Vec<ListingRequest>) {
        for request in requests {
            let storage = Arc::clone(&self.storage);
            self.dispatch(async move {
                let result = run_listing(storage.as_ref(), &request).await;
                EngineEvent::Listed {
                    request_id: request.request_id,
                    result,
                }
            });
        }
    }

    fn on_listed(&mut self, request_id: Uuid, result: Result<Listed, StorageError>) {
        let Some((listing, linked_account)) = self.collector.complete(request_id) else {
            log::trace!("Ignoring listing reply for untracked request {}", request_id);
            return;
        };
        log::trace!(
            "Listing of {:?} completed for account {:?}, request id = {}",
            listing,
            linked_account,
            request_id
        );

        if self.stopping {
            self.check_stopped();
            return;
        }

        match result {
            Err(error) => {
                self.fail(listing.failure_message(&error));
                return;
            }
            Ok(Listed::Tags(tags)) => self.pending.tags.extend(tags),
            Ok(Listed::SavedSearches(searches)) => self.pending.saved_searches.extend(searches),
            Ok(Listed::Notebooks(notebooks)) => self.pending.notebooks.extend(notebooks),
            Ok(Listed::Notes(notes)) => self.pending.notes.extend(notes),
            Ok(Listed::LinkedAccounts(accounts)) => {
                if let Err(message) = self.collector.set_linked_accounts(accounts) {
                    self.fail(message);
                    return;
                }
            }
        }

        if !self.paused {
            self.advance_collection();
        }
    }

    fn advance_collection(&mut self) {
        loop {
            match self.collector.next_step() {
                CollectStep::Waiting => return,
                CollectStep::OwnAccountCollected => {
                    self.phase = Phase::CollectingLinkedAccounts;
                    self.notify(SyncNotification::ReceivedOwnAccountDirtyObjects);
                }
                CollectStep::Issue(requests) => {
                    self.dispatch_listings(requests);
                    return;
                }
                CollectStep::AllCollected => {
                    log::debug!(
                        "All dirty objects collected: {} tags, {} saved searches, {} notebooks, {} notes",
                        self.pending.tags.len(),
                        self.pending.saved_searches.len(),
                        self.pending.notebooks.len(),
                        self.pending.notes.len()
                    );
                    self.phase = Phase::Uploading;
                    self.notify(SyncNotification::ReceivedAllDirtyObjects);
                    self.send_local_changes();
                    return;
                }
            }
        }
    }

    // ===== Upload =====

    /// (Re)enter the upload sequence; tokens are re-checked before the next batch
    fn send_local_changes(&mut self) {
        if self.paused || self.stopping || self.phase != Phase::Uploading {
            return;
        }
        self.current_batch = None;
        self.uploading = true;
    }

    fn upload_step_due(&self) -> bool {
        self.uploading
            && self.phase == Phase::Uploading
            && !self.paused
            && !self.stopping
            && !self.rate_limits.is_active()
            && !self.tokens.is_refresh_pending()
    }

    async fn upload_step(&mut self) {
        let next = UPLOAD_ORDER
            .into_iter()
            .find(|kind| !self.is_drained(*kind));

        let kind = match next {
            Some(EntityKind::Note) if !self.notebooks.is_resolved() => {
                self.find_notebooks_for_notes();
                return;
            }
            Some(kind) => kind,
            None => {
                self.uploading = false;
                self.check_completion();
                return;
            }
        };

        if self.current_batch != Some(kind) {
            if !self.ensure_linked_account_tokens() {
                return;
            }
            self.current_batch = Some(kind);
        }

        match kind {
            EntityKind::Tag => self.send_next::<Tag>().await,
            EntityKind::SavedSearch => self.send_next::<SavedSearch>().await,
            EntityKind::Notebook => self.send_next::<Notebook>().await,
            EntityKind::Note => self.send_next::<Note>().await,
        }
    }

    fn is_drained(&self, kind: EntityKind) -> bool {
        match kind {
            EntityKind::Tag => self.pending.tags.is_empty(),
            EntityKind::SavedSearch => self.pending.saved_searches.is_empty(),
            EntityKind::Notebook => self.pending.notebooks.is_empty(),
            EntityKind::Note => self.pending.notes.is_empty(),
        }
    }

    fn ensure_linked_account_tokens(&mut self) -> bool {
        match self.tokens.check(self.collector.linked_accounts(), Utc::now()) {
            TokenStatus::Valid => true,
            TokenStatus::RefreshNeeded => {
                self.request_linked_account_tokens();
                false
            }
            TokenStatus::Fatal(message) => {
                self.fail(message);
                false
            }
        }
    }

    fn request_linked_account_tokens(&mut self) {
        self.uploading = false;
        if self.tokens.request_refresh() {
            log::debug!("Requesting authentication tokens for all linked accounts");
            let accounts = self.collector.linked_accounts().to_vec();
            self.notify(SyncNotification::RequestLinkedAccountTokens { accounts });
        }
    }

    fn on_linked_account_tokens(&mut self, tokens: HashMap<String, AuthToken>) {
        self.tokens.replace_all(tokens);
        self.send_local_changes();
    }

    async fn send_next<E: Syncable>(&mut self) {
        let Some(front) = E::pending(&mut self.pending).front() else {
            return;
        };
        let mut entity = front.clone();

        let linked_account = match entity.auth_scope(&self.notebooks) {
            Ok(scope) => scope.map(str::to_string),
            Err(message) => {
                self.fail(message);
                return;
            }
        };

        let Some(auth_token) = self
            .tokens
            .token_for(linked_account.as_deref())
            .map(str::to_string)
        else {
            self.fail(format!(
                "Internal error: no authentication token for linked account {} of {} {}",
                linked_account.unwrap_or_default(),
                E::KIND,
                entity.meta().local_id
            ));
            return;
        };

        let note_store = Arc::clone(&self.note_store);
        match sequencer::upload(note_store.as_ref(), &mut entity, &auth_token).await {
            Ok(update_sequence_num) => self.on_uploaded(entity, update_sequence_num),
            Err(error) => self.on_remote_error(E::KIND, error, linked_account),
        }
    }

    fn on_uploaded<E: Syncable>(&mut self, entity: E, update_sequence_num: i32) {
        match self.cursor.record(update_sequence_num) {
            CursorUpdate::Advanced | CursorUpdate::Unchecked => {}
            CursorUpdate::DriftDetected => {
                log::info!("The client is not in sync with the service, inbound sync must be repeated");
                self.notify(SyncNotification::MustRepeatInboundSync);
            }
        }

        E::pending(&mut self.pending).pop_front();
        entity.propagate(&mut self.pending, &mut self.notebooks);
        self.persist(E::KIND, entity.into_local());
    }

    fn persist(&mut self, kind: EntityKind, entity: LocalEntity) {
        let request_id = Uuid::new_v4();
        self.persist_requests.insert(request_id, kind);
        let storage = Arc::clone(&self.storage);
        self.dispatch(async move {
            let result = storage.update(entity).await;
            EngineEvent::Persisted { request_id, result }
        });
    }

    fn on_persisted(&mut self, request_id: Uuid, result: Result<(), StorageError>) {
        let Some(kind) = self.persist_requests.remove(&request_id) else {
            return;
        };
        if self.stopping {
            self.check_stopped();
            return;
        }
        if let Err(error) = result {
            self.fail(format!("Couldn't update {} in local storage: {}", kind, error));
            return;
        }
        self.check_completion();
    }

    fn on_remote_error(&mut self, kind: EntityKind, error: RemoteError, linked_account: Option<String>) {
        match policy::interpret(error, kind, linked_account.as_deref()) {
            Verdict::RetryAfter(delay) => {
                let mailbox = self.mailbox.clone();
                self.rate_limits.arm(kind, |timer_id| {
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = mailbox
                            .send(EngineEvent::RateLimitElapsed { kind, timer_id })
                            .await;
                    })
                });
                log::info!("Rate limit reached while sending a {}, retrying in {:?}", kind, delay);
                self.notify(SyncNotification::RateLimitExceeded {
                    seconds: delay.as_secs(),
                });
            }
            Verdict::ReauthorizeOwningAccount => {
                log::info!("Got AUTH_EXPIRED error, pausing and requesting new authentication token");
                self.paused = true;
                self.notify(SyncNotification::Paused {
                    pending_authorization: true,
                });
                self.notify(SyncNotification::RequestOwningAccountAuthorization);
            }
            Verdict::RefreshLinkedAccountTokens => {
                log::info!(
                    "Authentication token of linked account {} expired",
                    linked_account.unwrap_or_default()
                );
                self.request_linked_account_tokens();
            }
            Verdict::Conflict => {
                log::info!(
                    "Encountered DATA_CONFLICT while sending a {}, inbound sync must run before sending local changes",
                    kind
                );
                self.notify(SyncNotification::ConflictDetected);
                self.pause();
            }
            Verdict::Abort(message) => self.fail(message),
        }
    }

    fn on_rate_limit_elapsed(&mut self, kind: EntityKind, timer_id: Uuid) {
        if self.rate_limits.fire(kind, timer_id) {
            log::debug!("Rate limit timer for {} uploads elapsed", kind);
            self.send_local_changes();
        }
    }

    // ===== Notebook resolution =====

    fn find_notebooks_for_notes(&mut self) {
        if !self.notebooks.has_pending_requests() {
            let requests = self.notebooks.resolve(self.pending.notes.iter());
            for FindNotebookRequest { request_id, guid } in requests {
                let storage = Arc::clone(&self.storage);
                self.dispatch(async move {
                    let result = storage.find_notebook_by_guid(&guid).await;
                    EngineEvent::NotebookFound { request_id, result }
                });
            }
        }
        if self.notebooks.has_pending_requests() {
            self.uploading = false;
        }
    }

    fn on_notebook_found(&mut self, request_id: Uuid, result: Result<Notebook, StorageError>) {
        let Some(guid) = self.notebooks.complete(request_id) else {
            return;
        };
        if self.stopping {
            self.check_stopped();
            return;
        }

        let accepted = result
            .map_err(|e| format!("Can't find notebook {} in local storage: {}", guid, e))
            .and_then(|notebook| self.notebooks.accept(notebook));
        if let Err(message) = accepted {
            self.fail(message);
            return;
        }

        if self.notebooks.is_resolved() {
            log::debug!("Resolved notebooks of all pending notes");
            self.send_local_changes();
        }
    }

    /// Finish the pass once everything is uploaded and persisted
    fn check_completion(&mut self) {
        if self.phase != Phase::Uploading || self.paused || self.stopping || self.uploading {
            return;
        }
        if !self.pending.is_empty() || self.has_pending_requests() {
            return;
        }
        let cursor = self.cursor.value();
        log::info!("Finished sending local changes, last update count = {}", cursor);
        self.notify(SyncNotification::Finished { cursor });
        self.clear();
        self.phase = Phase::Finished;
    }
}
