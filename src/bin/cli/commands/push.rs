use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{Duration, Utc};

use nous_sync::storage::{MemoryStorage, Snapshot};
use nous_sync::sync::{AuthToken, SendChangesConfig, SendLocalChangesManager, SyncNotification};

use crate::loopback::LoopbackNoteStore;
use crate::render::terminal::render_notification;
use crate::OutputFormat;

pub struct PushOptions {
    pub snapshot: PathBuf,
    pub cursor: i32,
    pub first_usn: i32,
    pub dry_run: bool,
}

impl PushOptions {
    /// The loopback service continues right after `cursor` unless told otherwise
    pub fn new(snapshot: PathBuf, cursor: i32, first_usn: Option<i32>, dry_run: bool) -> Result<Self> {
        let first_usn = match first_usn {
            Some(first_usn) => first_usn,
            None => cursor.checked_add(1).ok_or_else(|| {
                anyhow!("--cursor {} has no next update count, pass --first-usn", cursor)
            })?,
        };
        Ok(Self {
            snapshot,
            cursor,
            first_usn,
            dry_run,
        })
    }
}

/// How a pass that reached `Finished` ended
#[derive(Debug, PartialEq)]
enum Outcome {
    Completed,
    /// Stopped on our side before every change was sent
    Interrupted(&'static str),
}

fn conclude(notifications: &[SyncNotification]) -> Result<Outcome> {
    match notifications.last() {
        Some(SyncNotification::Finished { .. }) => {}
        Some(SyncNotification::Failure { message, .. }) => bail!("Push failed: {}", message),
        _ => bail!("Sync engine exited before finishing the pass"),
    }

    for notification in notifications {
        match notification {
            SyncNotification::ConflictDetected => {
                return Ok(Outcome::Interrupted(
                    "conflict with the service, run an inbound sync first",
                ))
            }
            SyncNotification::RequestOwningAccountAuthorization => {
                return Ok(Outcome::Interrupted("owning account authorization expired"))
            }
            _ => {}
        }
    }
    Ok(Outcome::Completed)
}

pub fn run(
    options: &PushOptions,
    config: SendChangesConfig,
    format: &OutputFormat,
    use_color: bool,
) -> Result<()> {
    let snapshot = Snapshot::load(&options.snapshot)
        .with_context(|| format!("Failed to read snapshot {}", options.snapshot.display()))?;
    let storage = Arc::new(MemoryStorage::from_snapshot(snapshot));
    let note_store = Arc::new(LoopbackNoteStore::new(options.first_usn));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    let notifications = runtime.block_on(async {
        let (handle, mut receiver) =
            SendLocalChangesManager::spawn(storage.clone(), note_store, config);
        handle.start(options.cursor);

        let mut received = Vec::new();
        while let Some(notification) = receiver.recv().await {
            if let OutputFormat::Plain = format {
                println!("{}", render_notification(&notification, use_color));
            }

            match &notification {
                SyncNotification::RequestLinkedAccountTokens { accounts } => {
                    // The loopback service accepts any token
                    let expires_at = Utc::now() + Duration::days(365);
                    let tokens: HashMap<String, AuthToken> = accounts
                        .iter()
                        .map(|a| {
                            let token = AuthToken::new(format!("loopback-{}", a.guid), expires_at);
                            (a.guid.clone(), token)
                        })
                        .collect();
                    handle.set_linked_account_tokens(tokens);
                }
                SyncNotification::RequestOwningAccountAuthorization
                | SyncNotification::ConflictDetected => handle.stop(),
                _ => {}
            }

            let done = notification.is_terminal();
            received.push(notification);
            if done {
                break;
            }
        }
        received
    });

    if let OutputFormat::Json = format {
        println!("{}", serde_json::to_string_pretty(&notifications)?);
    }

    let outcome = conclude(&notifications)?;

    // Entities sent before an interruption keep their new guids and counts
    if options.dry_run {
        log::info!("Dry run, not writing {}", options.snapshot.display());
    } else {
        let snapshot = storage
            .snapshot()
            .context("Failed to read back local storage")?;
        snapshot
            .save(&options.snapshot)
            .with_context(|| format!("Failed to write snapshot {}", options.snapshot.display()))?;
    }

    match outcome {
        Outcome::Completed => Ok(()),
        Outcome::Interrupted(reason) => bail!("Push interrupted: {}", reason),
    }
}
