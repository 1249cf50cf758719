use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::FetchError;
use crate::host_backend::HostBackend;
use crate::release_feed::ReleaseFeed;
use crate::version::{self, TagOrder};

/// Result of one successful comparison between the remote tags and the
/// checked-out version. Replaced wholesale, never edited in place.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PollSnapshot {
    pub current_version: String,
    pub latest_tag: Option<String>,
    pub update_available: bool,
    /// Most recent first.
    pub available_tags: Vec<String>,
    pub last_checked: DateTime<Utc>,
}

/// Keeps a cached answer to "is a newer release available".
///
/// Reads never wait for a fetch: the cache lock is only held to clone or swap
/// the snapshot. Fetches triggered through [`VersionPoller::force_check`] are
/// fire-and-forget; their effect shows up in [`VersionPoller::data`] once they
/// complete, and when two fetches overlap the one finishing last wins.
pub struct VersionPoller {
    feed: ReleaseFeed,
    backend: Arc<dyn HostBackend>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    tag_order: TagOrder,
    cache: RwLock<Option<PollSnapshot>>,
}

impl VersionPoller {
    pub fn new(
        feed: ReleaseFeed,
        backend: Arc<dyn HostBackend>,
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
        tag_order: TagOrder,
    ) -> Self {
        Self {
            feed,
            backend,
            clock,
            poll_interval,
            tag_order,
            cache: RwLock::new(None),
        }
    }

    /// Fetch and compare, replacing the cache on success. The previous
    /// snapshot is left alone on error.
    pub async fn refresh(&self) -> Result<PollSnapshot, FetchError> {
        let tags = self.feed.fetch_tags().await?;
        let tags = version::order_tags(tags, self.tag_order);
        let current = version::current_version(self.backend.as_ref()).await;
        let latest = tags.first().cloned();
        let update_available = version::update_available(&current, latest.as_deref());

        let snapshot = PollSnapshot {
            current_version: current,
            latest_tag: latest,
            update_available,
            available_tags: tags,
            last_checked: self.clock.now(),
        };
        self.store(snapshot.clone());

        info!(
            "update check current={} latest={} update_available={}",
            snapshot.current_version,
            snapshot.latest_tag.as_deref().unwrap_or("-"),
            snapshot.update_available
        );
        Ok(snapshot)
    }

    /// [`VersionPoller::refresh`] with the error logged instead of returned.
    pub async fn fetch(&self) {
        if let Err(err) = self.refresh().await {
            warn!("update check failed code={} err={err}", err.code());
        }
    }

    /// Copy of the cached snapshot, `None` until a fetch has succeeded.
    pub fn data(&self) -> Option<PollSnapshot> {
        match self.cache.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn force_check(self: &Arc<Self>) {
        let poller = Arc::clone(self);
        debug!("update check forced");
        tokio::spawn(async move {
            poller.fetch().await;
        });
    }

    /// Fetch, sleep for the poll interval, repeat. Runs until the returned
    /// handle is aborted or the runtime shuts down.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let poller = Arc::clone(self);
        info!(
            "update poller started interval_secs={}",
            poller.poll_interval.as_secs()
        );
        tokio::spawn(async move {
            loop {
                poller.fetch().await;
                tokio::time::sleep(poller.poll_interval).await;
            }
        })
    }

    fn store(&self, snapshot: PollSnapshot) {
        match self.cache.write() {
            Ok(mut guard) => *guard = Some(snapshot),
            Err(poisoned) => *poisoned.into_inner() = Some(snapshot),
        }
    }
}
