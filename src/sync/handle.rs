use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::storage::LinkedAccount;

use super::auth::AuthToken;
use super::manager::{Command, SessionSnapshot};

/// Messages the engine sends to its caller
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncNotification {
    /// The pass is suspended; `pending_authorization` when the owning
    /// account's credentials must be renewed before resuming
    #[serde(rename_all = "camelCase")]
    Paused { pending_authorization: bool },
    Stopped,
    /// Terminal success, carrying the highest consistent update count
    Finished { cursor: i32 },
    Failure { message: String, cursor: i32 },
    RateLimitExceeded { seconds: u64 },
    ConflictDetected,
    /// Sent at most once per pass
    MustRepeatInboundSync,
    /// Answer with [`SendLocalChangesHandle::set_linked_account_tokens`]
    RequestLinkedAccountTokens { accounts: Vec<LinkedAccount> },
    RequestOwningAccountAuthorization,
    ReceivedOwnAccountDirtyObjects,
    ReceivedAllDirtyObjects,
}

impl SyncNotification {
    /// Whether this notification ends the pass
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished { .. } | Self::Failure { .. })
    }
}

/// Handle for controlling a running engine.
///
/// Cheap to clone. Requests are queued without bound and delivered in order,
/// so they are never dropped while the engine is busy. The engine shuts down
/// once every handle is dropped.
#[derive(Debug, Clone)]
pub struct SendLocalChangesHandle {
    sender: mpsc::UnboundedSender<Command>,
}

impl SendLocalChangesHandle {
    pub(crate) fn new(sender: mpsc::UnboundedSender<Command>) -> Self {
        Self { sender }
    }

    /// Begin a pass from the last update count known to be in sync
    pub fn start(&self, cursor: i32) {
        self.send(Command::Start { cursor });
    }

    pub fn pause(&self) {
        self.send(Command::Pause);
    }

    pub fn resume(&self) {
        self.send(Command::Resume);
    }

    /// Stop cooperatively; `Stopped` is sent once in-flight requests drain
    pub fn stop(&self) {
        self.send(Command::Stop);
    }

    /// Deliver a complete batch of linked-account tokens, keyed by account guid
    pub fn set_linked_account_tokens(&self, tokens: HashMap<String, AuthToken>) {
        self.send(Command::LinkedAccountTokens(tokens));
    }

    /// Current engine state; `None` if the engine has shut down
    pub async fn snapshot(&self) -> Option<SessionSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.sender.send(Command::Snapshot(tx)).ok()?;
        rx.await.ok()
    }

    pub async fn rate_limit_is_active(&self) -> bool {
        self.snapshot()
            .await
            .map(|s| s.rate_limit_active)
            .unwrap_or(false)
    }

    pub async fn has_pending_requests(&self) -> bool {
        self.snapshot()
            .await
            .map(|s| s.pending_requests > 0)
            .unwrap_or(false)
    }

    fn send(&self, command: Command) {
        if self.sender.send(command).is_err() {
            log::warn!("Outbound sync engine has shut down, request dropped");
        }
    }
}
