//! Entity snapshot collection.
//!
//! Lists dirty entities of the owning account first, then of each linked
//! account in turn. Every listing carries its own correlation id and only
//! completions for ids issued here are accepted.

use std::collections::{HashMap, VecDeque};

use uuid::Uuid;

use crate::storage::{
    EntityKind, LinkedAccount, ListQuery, LocalStorage, Note, Notebook, SavedSearch, StorageError,
    Tag,
};

/// What a listing request asks local storage for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Listing {
    Dirty(EntityKind),
    LinkedAccounts,
}

impl Listing {
    fn describe(&self) -> &'static str {
        match self {
            Self::Dirty(EntityKind::Tag) => "dirty tags",
            Self::Dirty(EntityKind::SavedSearch) => "dirty saved searches",
            Self::Dirty(EntityKind::Notebook) => "dirty notebooks",
            Self::Dirty(EntityKind::Note) => "dirty notes",
            Self::LinkedAccounts => "linked accounts",
        }
    }

    /// Failure message for a listing that local storage could not serve
    pub fn failure_message(&self, error: &StorageError) -> String {
        format!("Error listing {} from local storage: {}", self.describe(), error)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListingRequest {
    pub request_id: Uuid,
    pub listing: Listing,
    pub query: ListQuery,
}

/// Result of a served listing
#[derive(Debug, Clone, PartialEq)]
pub enum Listed {
    Tags(Vec<Tag>),
    SavedSearches(Vec<SavedSearch>),
    Notebooks(Vec<Notebook>),
    Notes(Vec<Note>),
    LinkedAccounts(Vec<LinkedAccount>),
}

/// Serve one listing request against local storage
pub async fn run_listing(
    storage: &dyn LocalStorage,
    request: &ListingRequest,
) -> Result<Listed, StorageError> {
    let query = &request.query;
    match request.listing {
        Listing::Dirty(EntityKind::Tag) => storage.list_tags(query).await.map(Listed::Tags),
        Listing::Dirty(EntityKind::SavedSearch) => storage
            .list_saved_searches(query)
            .await
            .map(Listed::SavedSearches),
        Listing::Dirty(EntityKind::Notebook) => {
            storage.list_notebooks(query).await.map(Listed::Notebooks)
        }
        Listing::Dirty(EntityKind::Note) => storage.list_notes(query).await.map(Listed::Notes),
        Listing::LinkedAccounts => storage
            .list_linked_accounts()
            .await
            .map(Listed::LinkedAccounts),
    }
}

/// Entities waiting for upload, per kind, in listing order
#[derive(Debug, Default)]
pub struct DirtyEntitySet {
    pub tags: VecDeque<Tag>,
    pub saved_searches: VecDeque<SavedSearch>,
    pub notebooks: VecDeque<Notebook>,
    pub notes: VecDeque<Note>,
}

impl DirtyEntitySet {
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
            && self.saved_searches.is_empty()
            && self.notebooks.is_empty()
            && self.notes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tags.len() + self.saved_searches.len() + self.notebooks.len() + self.notes.len()
    }

    pub fn clear(&mut self) {
        self.tags.clear();
        self.saved_searches.clear();
        self.notebooks.clear();
        self.notes.clear();
    }
}

/// What the session should do after a listing completed
#[derive(Debug, PartialEq)]
pub enum CollectStep {
    /// Listings are still outstanding
    Waiting,
    /// The owning account (and the linked-account list) is fully listed
    OwnAccountCollected,
    /// Listings for the next linked account
    Issue(Vec<ListingRequest>),
    AllCollected,
}

#[derive(Debug, Default)]
pub struct Collector {
    /// Outstanding listings; `None` scope is the owning account
    outstanding: HashMap<Uuid, (Listing, Option<String>)>,
    linked_accounts: Vec<LinkedAccount>,
    next_linked: usize,
    started: bool,
    received_own: bool,
    received_all: bool,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn received_all(&self) -> bool {
        self.received_all
    }

    pub fn has_pending_requests(&self) -> bool {
        !self.outstanding.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.outstanding.len()
    }

    pub fn linked_accounts(&self) -> &[LinkedAccount] {
        &self.linked_accounts
    }

    /// Listings for the owning account, including the linked-account list
    pub fn begin(&mut self) -> Vec<ListingRequest> {
        self.started = true;
        let mut requests = self.listings_for(None);
        requests.push(self.issue(Listing::LinkedAccounts, None));
        requests
    }

    fn listings_for(&mut self, linked_account: Option<String>) -> Vec<ListingRequest> {
        let mut kinds = vec![EntityKind::Tag];
        // Linked accounts do not own saved searches
        if linked_account.is_none() {
            kinds.push(EntityKind::SavedSearch);
        }
        kinds.push(EntityKind::Notebook);
        kinds.push(EntityKind::Note);

        kinds
            .into_iter()
            .map(|kind| self.issue(Listing::Dirty(kind), linked_account.clone()))
            .collect()
    }

    fn issue(&mut self, listing: Listing, linked_account: Option<String>) -> ListingRequest {
        let request_id = Uuid::new_v4();
        let query = ListQuery::dirty(linked_account.clone());
        self.outstanding.insert(request_id, (listing, linked_account));
        log::trace!("Issued listing of {:?}, request id = {}", listing, request_id);
        ListingRequest {
            request_id,
            listing,
            query,
        }
    }

    /// Stop tracking a completed listing.
    ///
    /// Returns what was listed and for which account, or `None` when the id
    /// was not issued by this collector.
    pub fn complete(&mut self, request_id: Uuid) -> Option<(Listing, Option<String>)> {
        self.outstanding.remove(&request_id)
    }

    /// Record the linked accounts of this pass
    pub fn set_linked_accounts(&mut self, accounts: Vec<LinkedAccount>) -> Result<(), String> {
        if let Some(account) = accounts.iter().find(|a| a.guid.is_empty()) {
            log::warn!("Linked account without guid in local storage: {:?}", account);
            return Err("Found linked account without guid set in local storage".to_string());
        }
        self.linked_accounts = accounts;
        Ok(())
    }

    pub fn next_step(&mut self) -> CollectStep {
        if !self.started || self.has_pending_requests() {
            return CollectStep::Waiting;
        }

        if !self.received_own {
            self.received_own = true;
            log::trace!("Received all dirty objects from the owning account");
            return CollectStep::OwnAccountCollected;
        }

        if let Some(account) = self.linked_accounts.get(self.next_linked) {
            let guid = account.guid.clone();
            self.next_linked += 1;
            log::debug!(
                "Listing dirty objects of linked account {} ({}/{})",
                guid,
                self.next_linked,
                self.linked_accounts.len()
            );
            return CollectStep::Issue(self.listings_for(Some(guid)));
        }

        if !self.received_all {
            self.received_all = true;
            return CollectStep::AllCollected;
        }

        CollectStep::Waiting
    }
}
