//! Background sync of offline journal entries.
//!
//! The worker side issues one replay request per sync event and reports the
//! result. Scheduling, retries and backoff belong to [`SyncRegistry`], which
//! plays the host's part.

use std::time::{Duration, Instant};

use hashbrown::HashMap;
use soulscroll_common::RetryConfig;
use soulscroll_net::{CredentialsMode, Fetcher, Request};
use tracing::{debug, info, warn};
use url::Url;

use crate::{Result, ServiceWorkerError};

/// POST the replay endpoint with credentials. Any transport error or non-2xx
/// status is returned so the host reschedules.
pub async fn replay_offline_entries(fetcher: &dyn Fetcher, tag: &str, endpoint: Url) -> Result<()> {
    info!(tag, endpoint = %endpoint, "Replaying offline journal entries");
    let request = Request::post(endpoint, None).credentials(CredentialsMode::Include);

    let outcome = match fetcher.fetch(request).await {
        Ok(response) => response.error_for_status().map(|_| ()),
        Err(e) => Err(e),
    };

    outcome.map_err(|source| {
        warn!(tag, error = %source, "Sync replay failed");
        ServiceWorkerError::SyncFailed {
            tag: tag.to_string(),
            source,
        }
    })
}

/// A registered sync tag.
#[derive(Debug, Clone)]
pub struct SyncTask {
    pub tag: String,
    /// Attempts made so far.
    pub attempts: u32,
    /// Earliest time the next attempt may run.
    pub not_before: Option<Instant>,
    /// Claimed by a dispatch that has not recorded its outcome yet.
    pub in_flight: bool,
}

/// What happened to a tag after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDisposition {
    /// Done; the tag is gone.
    Completed,
    /// Will run again after this delay.
    RetryAfter(Duration),
    /// Out of attempts; the tag is gone.
    Abandoned,
}

/// Host-side registry of pending sync tags.
#[derive(Debug)]
pub struct SyncRegistry {
    tasks: HashMap<String, SyncTask>,
    retry: RetryConfig,
}

impl Default for SyncRegistry {
    fn default() -> Self {
        Self::new(RetryConfig::background_sync())
    }
}

impl SyncRegistry {
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            tasks: HashMap::new(),
            retry,
        }
    }

    /// Register a tag. Re-registering resets its attempts but leaves an
    /// in-flight claim in place.
    pub fn register(&mut self, tag: &str) {
        debug!(tag, "Sync registered");
        let task = self.tasks.entry(tag.to_string()).or_insert_with(|| SyncTask {
            tag: tag.to_string(),
            attempts: 0,
            not_before: None,
            in_flight: false,
        });
        task.attempts = 0;
        task.not_before = None;
    }

    /// All registered tags, sorted.
    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.tasks.keys().cloned().collect();
        tags.sort();
        tags
    }

    /// Claim every idle tag whose backoff has elapsed at `now`.
    ///
    /// A claimed tag is skipped by later calls until its outcome is passed
    /// to [`record`](Self::record).
    pub fn claim_ready(&mut self, now: Instant) -> Vec<String> {
        let mut tags: Vec<String> = self
            .tasks
            .values_mut()
            .filter(|t| !t.in_flight && t.not_before.map_or(true, |at| at <= now))
            .map(|t| {
                t.in_flight = true;
                t.tag.clone()
            })
            .collect();
        tags.sort();
        tags
    }

    /// Connectivity came back: everything pending may run immediately.
    pub fn online(&mut self) {
        for task in self.tasks.values_mut() {
            task.not_before = None;
        }
    }

    /// Record the outcome of a claimed attempt.
    ///
    /// Returns `None` when `tag` holds no claim.
    pub fn record(&mut self, tag: &str, succeeded: bool, now: Instant) -> Option<SyncDisposition> {
        let task = self.tasks.get_mut(tag).filter(|t| t.in_flight)?;
        task.in_flight = false;

        if succeeded {
            self.tasks.remove(tag);
            return Some(SyncDisposition::Completed);
        }

        task.attempts += 1;
        if !self.retry.allows_another(task.attempts) {
            warn!(tag, attempts = task.attempts, "Sync abandoned");
            self.tasks.remove(tag);
            return Some(SyncDisposition::Abandoned);
        }

        let delay = self.retry.delay_for_attempt(task.attempts + 1);
        task.not_before = Some(now + delay);
        debug!(tag, attempts = task.attempts, ?delay, "Sync rescheduled");
        Some(SyncDisposition::RetryAfter(delay))
    }
}
