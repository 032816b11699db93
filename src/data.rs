use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;

use crate::mastodon::{self, Interaction, ListingOptions, Timeline};

pub trait TimelineService: Send + Sync {
    fn load_timeline(&self, timeline: &Timeline) -> Result<Vec<mastodon::Status>>;
    fn load_account(&self, account_id: &str) -> Result<Vec<mastodon::Status>>;
    fn lookup_account(&self, acct: &str) -> Result<mastodon::Account>;
}

pub trait StatusService: Send + Sync {
    fn load_status(&self, id: &str) -> Result<mastodon::Status>;
}

pub trait InteractionService: Send + Sync {
    fn set(&self, status_id: &str, kind: Interaction, enabled: bool) -> Result<()>;
}

pub struct MastodonTimelineService {
    client: Arc<mastodon::Client>,
    limit: u32,
}

impl MastodonTimelineService {
    pub fn new(client: Arc<mastodon::Client>, limit: u32) -> Self {
        Self { client, limit }
    }
}

impl TimelineService for MastodonTimelineService {
    fn load_timeline(&self, timeline: &Timeline) -> Result<Vec<mastodon::Status>> {
        self.client
            .timeline(timeline, ListingOptions::with_limit(self.limit))
            .context("fetch timeline")
    }

    fn load_account(&self, account_id: &str) -> Result<Vec<mastodon::Status>> {
        self.client
            .account_timeline(account_id, ListingOptions::with_limit(self.limit))
            .context("fetch account timeline")
    }

    fn lookup_account(&self, acct: &str) -> Result<mastodon::Account> {
        self.client.lookup_account(acct).context("lookup account")
    }
}

pub struct MastodonStatusService {
    client: Arc<mastodon::Client>,
}

impl MastodonStatusService {
    pub fn new(client: Arc<mastodon::Client>) -> Self {
        Self { client }
    }
}

impl StatusService for MastodonStatusService {
    fn load_status(&self, id: &str) -> Result<mastodon::Status> {
        self.client.status(id)
    }
}

pub struct MastodonInteractionService {
    client: Arc<mastodon::Client>,
}

impl MastodonInteractionService {
    pub fn new(client: Arc<mastodon::Client>) -> Self {
        Self { client }
    }
}

impl InteractionService for MastodonInteractionService {
    fn set(&self, status_id: &str, kind: Interaction, enabled: bool) -> Result<()> {
        self.client.interact(status_id, kind, enabled)
    }
}

/// In-memory statuses keyed by id; ids listed as failing behave like
/// deleted or unreachable posts.
#[derive(Default)]
pub struct MockStatusService {
    statuses: HashMap<String, mastodon::Status>,
    failing: HashSet<String>,
    requests: Mutex<Vec<String>>,
}

impl MockStatusService {
    pub fn new(statuses: impl IntoIterator<Item = mastodon::Status>) -> Self {
        Self {
            statuses: statuses
                .into_iter()
                .map(|status| (status.id.clone(), status))
                .collect(),
            failing: HashSet::new(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(mut self, id: &str) -> Self {
        self.failing.insert(id.to_string());
        self
    }

    /// Ids requested so far, in call order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
}

impl StatusService for MockStatusService {
    fn load_status(&self, id: &str) -> Result<mastodon::Status> {
        self.requests.lock().push(id.to_string());
        if self.failing.contains(id) {
            return Err(mastodon::ApiError::NotFound.into());
        }
        self.statuses
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("mock: status {id} unavailable"))
    }
}

#[derive(Default)]
pub struct MockTimelineService {
    pub statuses: Vec<mastodon::Status>,
    pub accounts: Vec<mastodon::Account>,
    /// Message returned as a server error payload instead of statuses.
    pub error: Option<String>,
}

impl TimelineService for MockTimelineService {
    fn load_timeline(&self, _timeline: &Timeline) -> Result<Vec<mastodon::Status>> {
        if let Some(message) = &self.error {
            return Err(mastodon::ApiError::Server(message.clone()).into());
        }
        Ok(self.statuses.clone())
    }

    fn load_account(&self, account_id: &str) -> Result<Vec<mastodon::Status>> {
        Ok(self
            .statuses
            .iter()
            .filter(|status| status.account.id == account_id)
            .cloned()
            .collect())
    }

    fn lookup_account(&self, acct: &str) -> Result<mastodon::Account> {
        let acct = acct.trim_start_matches('@');
        self.accounts
            .iter()
            .find(|account| account.acct == acct || account.username == acct)
            .cloned()
            .ok_or_else(|| mastodon::ApiError::NotFound.into())
    }
}

/// Records every call; ids in `rejected` fail.
#[derive(Default)]
pub struct MockInteractionService {
    pub rejected: HashSet<String>,
    calls: Mutex<Vec<(String, Interaction, bool)>>,
}

impl MockInteractionService {
    pub fn rejecting(id: &str) -> Self {
        Self {
            rejected: [id.to_string()].into_iter().collect(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(String, Interaction, bool)> {
        self.calls.lock().clone()
    }
}

impl InteractionService for MockInteractionService {
    fn set(&self, status_id: &str, kind: Interaction, enabled: bool) -> Result<()> {
        self.calls
            .lock()
            .push((status_id.to_string(), kind, enabled));
        if self.rejected.contains(status_id) {
            return Err(mastodon::ApiError::Http {
                status: 422,
                body: "rejected".into(),
            }
            .into());
        }
        Ok(())
    }
}
