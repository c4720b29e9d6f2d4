use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::storage::{Note, Notebook};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindNotebookRequest {
    pub request_id: Uuid,
    pub guid: String,
}

/// Resolution of notes' notebooks through local storage before notes are sent
#[derive(Debug, Default)]
pub struct NotebookResolver {
    cache: HashMap<String, Notebook>,
    outstanding: HashMap<Uuid, String>,
    started: bool,
}

impl NotebookResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop cached notebooks too; they go stale between passes
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn get(&self, guid: &str) -> Option<&Notebook> {
        self.cache.get(guid)
    }

    /// Cache a notebook known to the service, e.g. one just uploaded
    pub fn remember(&mut self, notebook: Notebook) {
        if let Some(guid) = notebook.meta.guid.clone() {
            self.cache.insert(guid, notebook);
        }
    }

    /// All lookups issued for this pass have completed
    pub fn is_resolved(&self) -> bool {
        self.started && self.outstanding.is_empty()
    }

    pub fn has_pending_requests(&self) -> bool {
        !self.outstanding.is_empty()
    }

    /// Issue one lookup per distinct notebook guid that is neither cached
    /// nor already being looked up
    pub fn resolve<'a>(&mut self, notes: impl IntoIterator<Item = &'a Note>) -> Vec<FindNotebookRequest> {
        self.started = true;

        let in_flight: HashSet<&String> = self.outstanding.values().collect();
        let mut wanted: Vec<String> = Vec::new();
        for note in notes {
            let Some(guid) = note.notebook_guid.as_ref() else {
                continue;
            };
            if self.cache.contains_key(guid) || in_flight.contains(guid) || wanted.contains(guid) {
                continue;
            }
            wanted.push(guid.clone());
        }

        wanted
            .into_iter()
            .map(|guid| {
                let request_id = Uuid::new_v4();
                log::trace!(
                    "Find notebook request for guid {}, request id = {}",
                    guid,
                    request_id
                );
                self.outstanding.insert(request_id, guid.clone());
                FindNotebookRequest { request_id, guid }
            })
            .collect()
    }

    /// Stop tracking a lookup; `None` when the id was not issued here
    pub fn complete(&mut self, request_id: Uuid) -> Option<String> {
        self.outstanding.remove(&request_id)
    }

    /// Store a found notebook.
    ///
    /// A notebook without a remote id cannot have been found by one and is
    /// an internal error.
    pub fn accept(&mut self, notebook: Notebook) -> Result<(), String> {
        if notebook.meta.guid.is_none() {
            log::warn!("Found notebook without guid: {:?}", notebook);
            return Err("Internal error: found notebook without guid within notebooks requested from local storage by guid".to_string());
        }
        self.remember(notebook);
        Ok(())
    }
}
