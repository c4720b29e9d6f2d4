//! Interpretation of remote call failures.

use std::collections::HashMap;
use std::time::Duration;

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::storage::EntityKind;

use super::remote::RemoteError;

/// What the engine does after a remote call failed
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Wait, then resubmit the same entity
    RetryAfter(Duration),
    /// Pause until the caller supplies new owning-account credentials
    ReauthorizeOwningAccount,
    /// Refresh the tokens of all linked accounts as one batch
    RefreshLinkedAccountTokens,
    /// Pause; an inbound pass must run before retrying
    Conflict,
    Abort(String),
}

/// Map a remote failure for `kind` to the action the engine takes.
///
/// `linked_account` is the account whose token was presented, `None` for the
/// owning account.
pub fn interpret(error: RemoteError, kind: EntityKind, linked_account: Option<&str>) -> Verdict {
    match error {
        RemoteError::RateLimitReached { retry_after_secs } if retry_after_secs < 0 => {
            Verdict::Abort(format!(
                "Caught RATE_LIMIT_REACHED exception but the number of seconds to wait is negative: {}",
                retry_after_secs
            ))
        }
        RemoteError::RateLimitReached { retry_after_secs } => {
            Verdict::RetryAfter(Duration::from_secs(retry_after_secs as u64))
        }
        RemoteError::AuthExpired => match linked_account {
            None => Verdict::ReauthorizeOwningAccount,
            Some(_) => Verdict::RefreshLinkedAccountTokens,
        },
        RemoteError::DataConflict => Verdict::Conflict,
        RemoteError::Other(message) => Verdict::Abort(format!(
            "Can't send new and/or modified {} to the service: {}",
            plural(kind),
            message
        )),
    }
}

fn plural(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Tag => "tags",
        EntityKind::SavedSearch => "saved searches",
        EntityKind::Notebook => "notebooks",
        EntityKind::Note => "notes",
    }
}

/// One-shot backoff timers, at most one per entity kind
#[derive(Debug, Default)]
pub struct RateLimitTimers {
    timers: HashMap<EntityKind, (Uuid, JoinHandle<()>)>,
}

impl RateLimitTimers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        !self.timers.is_empty()
    }

    /// Start a timer for `kind`; `spawn` receives the timer id and must
    /// start the task that reports its expiry.
    pub fn arm(&mut self, kind: EntityKind, spawn: impl FnOnce(Uuid) -> JoinHandle<()>) -> Uuid {
        let timer_id = Uuid::new_v4();
        let handle = spawn(timer_id);
        if let Some((_, previous)) = self.timers.insert(kind, (timer_id, handle)) {
            previous.abort();
        }
        timer_id
    }

    /// Consume an expiry; `false` when the timer was superseded or cancelled
    pub fn fire(&mut self, kind: EntityKind, timer_id: Uuid) -> bool {
        match self.timers.get(&kind) {
            Some((id, _)) if *id == timer_id => {
                self.timers.remove(&kind);
                true
            }
            _ => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, (_, handle)) in self.timers.drain() {
            handle.abort();
        }
    }
}
