//! Authentication tokens of linked accounts.
//!
//! The cache outlives individual passes. It is only ever replaced as a whole,
//! so an upload never mixes tokens from two refreshes.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::LinkedAccount;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl AuthToken {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    /// Whether the token expires within `margin` of `now`
    pub fn expires_within(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        self.expires_at - now < margin
    }
}

/// Outcome of checking the cache against the linked accounts of a pass
#[derive(Debug, Clone, PartialEq)]
pub enum TokenStatus {
    /// Every linked account has a usable token
    Valid,
    /// A batch refresh for all linked accounts is required
    RefreshNeeded,
    Fatal(String),
}

#[derive(Debug)]
pub struct AuthTokenCache {
    tokens: HashMap<String, AuthToken>,
    margin: Duration,
    refresh_pending: bool,
    /// Set when a batch arrived after the last refresh request
    fresh_batch: bool,
}

impl AuthTokenCache {
    pub fn new(margin: Duration) -> Self {
        Self {
            tokens: HashMap::new(),
            margin,
            refresh_pending: false,
            fresh_batch: false,
        }
    }

    /// Token to present for an account; the owning account uses an empty one
    pub fn token_for(&self, linked_account: Option<&str>) -> Option<&str> {
        match linked_account {
            None => Some(""),
            Some(guid) => self.tokens.get(guid).map(|t| t.token.as_str()),
        }
    }

    pub fn is_refresh_pending(&self) -> bool {
        self.refresh_pending
    }

    /// Record that a batch refresh is wanted.
    ///
    /// Returns `false` when one is already outstanding, in which case no new
    /// request should be sent.
    pub fn request_refresh(&mut self) -> bool {
        if self.refresh_pending {
            return false;
        }
        self.refresh_pending = true;
        self.fresh_batch = false;
        true
    }

    /// Replace the whole cache with a delivered batch
    pub fn replace_all(&mut self, tokens: HashMap<String, AuthToken>) {
        log::debug!("Received authentication tokens for {} linked accounts", tokens.len());
        self.tokens = tokens;
        self.refresh_pending = false;
        self.fresh_batch = true;
    }

    /// Forget per-pass refresh bookkeeping; cached tokens are kept
    pub fn begin_pass(&mut self) {
        self.refresh_pending = false;
        self.fresh_batch = false;
    }

    /// Check the tokens of every linked account before a batch of uploads.
    ///
    /// A token inside the expiry margin is never used. When it arrived with
    /// the batch just delivered, asking again would loop, so the pass fails.
    pub fn check(&mut self, accounts: &[LinkedAccount], now: DateTime<Utc>) -> TokenStatus {
        for account in accounts {
            if account.guid.is_empty() {
                return TokenStatus::Fatal(
                    "Internal error: found empty linked account guid within the list of linked accounts"
                        .to_string(),
                );
            }

            let Some(token) = self.tokens.get(&account.guid) else {
                if self.fresh_batch {
                    return TokenStatus::Fatal(format!(
                        "Authentication token for linked account {} was not delivered",
                        account.guid
                    ));
                }
                log::debug!(
                    "No authentication token for linked account {}, requesting tokens for all linked accounts",
                    account.guid
                );
                return TokenStatus::RefreshNeeded;
            };

            if token.expires_within(self.margin, now) {
                if self.fresh_batch {
                    return TokenStatus::Fatal(format!(
                        "Internal error: freshly delivered authentication token for linked account {} expires at {}, within the safety margin",
                        account.guid, token.expires_at
                    ));
                }
                log::debug!(
                    "Authentication token for linked account {} is too close to expiration ({}), requesting new tokens",
                    account.guid,
                    token.expires_at
                );
                return TokenStatus::RefreshNeeded;
            }
        }

        // Later batches go through the normal refresh path again
        self.fresh_batch = false;
        TokenStatus::Valid
    }
}
