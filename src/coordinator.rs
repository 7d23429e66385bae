//! Query orchestration over the cache store
//!
//! `RefreshCoordinator` decides, for each requested key, whether to serve
//! from memory, fetch from upstream, or report the key as unavailable:
//!
//! - Fresh and frozen entries are served without any upstream call.
//! - A stale latest entry is served immediately while a background refresh
//!   runs; a stale historical entry is re-fetched before answering, falling
//!   back to the stale copy if the fetch fails.
//! - A date in the missing set is answered locally until its backoff expires.
//!
//! Fetches are single-flight per key: each runs on its own task and callers
//! share that task's result, so a caller that gives up never strands the
//! fetch. The in-flight map's lock is never held across I/O. A semaphore caps
//! simultaneous upstream fetches across keys.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use futures::future;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::activity::{self, ActivitySignal, ActivityTracker};
use crate::cache::{CacheEntry, CacheKey, CacheStore, Freshness, FreshnessPolicy, MissingBackoff};
use crate::clock::{Clock, SystemClock};
use crate::config::{bounded_duration, Config};
use crate::data::{FetchError, RegionSummary, UpstreamBatch, UpstreamSource};
use crate::error::QueryError;

type FlightResult = Result<Arc<CacheEntry>, QueryError>;
type Flight = Shared<BoxFuture<'static, FlightResult>>;

/// A running fetch task and the handle its callers share
struct InFlight {
    shared: Flight,
    abort: AbortHandle,
}

/// How a call to `flight` was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlightStart {
    /// A new fetch task was spawned
    Started,
    /// A fetch for the key was already running
    Joined,
    /// A fetch finished since the caller read the store; no fetch needed
    Settled,
}

/// Data returned to the request layer, with freshness metadata
#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
    pub key: CacheKey,
    pub data: Arc<Vec<RegionSummary>>,
    /// Calendar date the data describes
    pub data_date: NaiveDate,
    /// When the data was fetched from upstream
    pub as_of: DateTime<Utc>,
    pub served_from_cache: bool,
    pub freshness: Freshness,
    /// A background refresh was scheduled by this query
    pub refreshing: bool,
}

/// Entry counts by state, for health reporting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatus {
    pub fresh: usize,
    pub stale: usize,
    pub frozen: usize,
    pub missing: usize,
    pub in_flight: usize,
}

/// What a background refresh request did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackgroundRefresh {
    /// A new refresh task was spawned
    Started,
    /// A fetch for the key was already in flight
    AlreadyRunning,
    /// The latest entry is still fresh
    UpToDate,
    /// No recent activity; nothing was done
    Suspended,
}

struct Inner {
    store: CacheStore,
    policy: FreshnessPolicy,
    backoff: MissingBackoff,
    upstream: Arc<dyn UpstreamSource>,
    clock: Arc<dyn Clock>,
    /// Presence seen through queries and heartbeats
    activity: ActivityTracker,
    /// Presence reported by an outside heartbeat source
    external_activity: Option<Arc<dyn ActivitySignal>>,
    inactivity_window: ChronoDuration,
    historical_start: NaiveDate,
    fetch_timeout: Duration,
    permits: Semaphore,
    inflight: Mutex<HashMap<CacheKey, InFlight>>,
    background: Mutex<JoinSet<()>>,
}

/// Builds a `RefreshCoordinator` from configuration
pub struct CoordinatorBuilder {
    config: Config,
    upstream: Arc<dyn UpstreamSource>,
    clock: Arc<dyn Clock>,
    activity_signal: Option<Arc<dyn ActivitySignal>>,
    fetch_timeout: Duration,
}

impl CoordinatorBuilder {
    pub fn new(config: &Config, upstream: Arc<dyn UpstreamSource>) -> Self {
        Self {
            fetch_timeout: config.upstream.request_timeout(),
            config: config.clone(),
            upstream,
            clock: Arc::new(SystemClock),
            activity_signal: None,
        }
    }

    /// Uses `clock` for every freshness and backoff decision
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Adds an outside presence signal for gating background refresh
    pub fn activity_signal(mut self, signal: Arc<dyn ActivitySignal>) -> Self {
        self.activity_signal = Some(signal);
        self
    }

    /// Overrides the per-fetch timeout from the config
    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn build(self) -> RefreshCoordinator {
        let cache = &self.config.cache;
        let inner = Inner {
            store: CacheStore::new(),
            policy: FreshnessPolicy::from_config(cache),
            backoff: MissingBackoff::from_config(cache),
            upstream: self.upstream,
            clock: self.clock,
            activity: ActivityTracker::new(),
            external_activity: self.activity_signal,
            inactivity_window: bounded_duration(self.config.refresh.inactivity_window_secs, 1),
            historical_start: cache.historical_start,
            fetch_timeout: self.fetch_timeout,
            permits: Semaphore::new(self.config.upstream.max_concurrent_fetches.max(1)),
            inflight: Mutex::new(HashMap::new()),
            background: Mutex::new(JoinSet::new()),
        };

        RefreshCoordinator {
            inner: Arc::new(inner),
        }
    }
}

/// Serves queries from the cache, refreshing from upstream as needed
///
/// Cloning is cheap; clones share the same store and in-flight state.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    /// Creates a coordinator on the system clock
    pub fn new(config: &Config, upstream: Arc<dyn UpstreamSource>) -> Self {
        CoordinatorBuilder::new(config, upstream).build()
    }

    pub fn builder(config: &Config, upstream: Arc<dyn UpstreamSource>) -> CoordinatorBuilder {
        CoordinatorBuilder::new(config, upstream)
    }

    /// The underlying store
    pub fn store(&self) -> &CacheStore {
        &self.inner.store
    }

    /// Answers a query for `key`
    ///
    /// Every query counts as user activity.
    pub async fn query(&self, key: CacheKey) -> Result<QueryOutcome, QueryError> {
        let now = self.inner.clock.now();
        self.inner.activity.record(now);

        if let CacheKey::Date(date) = key {
            if date < self.inner.historical_start {
                debug!(%date, "Rejecting date before historical start");
                return Err(QueryError::OutOfRange {
                    date,
                    start: self.inner.historical_start,
                });
            }
        }

        if let Some(entry) = self.inner.store.get(&key) {
            return Ok(self.serve_cached(entry, now).await);
        }

        if let CacheKey::Date(date) = key {
            if let Some(record) = self.inner.store.missing_record(date) {
                if record.is_active(now) {
                    debug!(%date, "Date still in missing backoff");
                    return Err(QueryError::NotYetAvailable {
                        key,
                        retry_at: Some(record.next_recheck_at),
                    });
                }
                info!(%date, attempts = record.attempts, "Missing backoff elapsed, re-checking upstream");
            }
        }

        debug!(%key, "Cache miss");
        let (flight, start) = self.flight(key, None);
        let entry = flight.await?;
        Ok(self.outcome(&entry, start == FlightStart::Settled, false))
    }

    /// Serves a cached entry according to its freshness
    async fn serve_cached(&self, entry: Arc<CacheEntry>, now: DateTime<Utc>) -> QueryOutcome {
        match self.inner.policy.evaluate(&entry, now) {
            Freshness::Fresh | Freshness::Frozen => {
                debug!(key = %entry.key, "Cache hit");
                self.outcome(&entry, true, false)
            }
            Freshness::Stale if entry.key == CacheKey::Latest => {
                debug!("Serving stale latest entry while revalidating");
                let refreshing = self.spawn_refresh(CacheKey::Latest, Some(&entry))
                    != BackgroundRefresh::UpToDate;
                self.outcome(&entry, true, refreshing)
            }
            Freshness::Stale => {
                let (flight, start) = self.flight(entry.key, Some(&entry));
                match flight.await {
                    Ok(refreshed) => self.outcome(&refreshed, start == FlightStart::Settled, false),
                    Err(e) => {
                        warn!(key = %entry.key, error = %e, "Refresh failed, serving stale entry");
                        self.outcome(&entry, true, false)
                    }
                }
            }
        }
    }

    fn outcome(&self, entry: &CacheEntry, served_from_cache: bool, refreshing: bool) -> QueryOutcome {
        QueryOutcome {
            key: entry.key,
            data: Arc::clone(&entry.payload),
            data_date: entry.data_date,
            as_of: entry.fetched_at,
            served_from_cache,
            freshness: self.inner.policy.evaluate(entry, self.inner.clock.now()),
            refreshing,
        }
    }

    /// Returns the in-flight fetch for `key`, starting one if needed
    ///
    /// `seen` is the entry the caller read before deciding to fetch. The store
    /// is read again under the map lock, so a fetch that published in the
    /// meantime settles the call instead of starting a duplicate.
    fn flight(&self, key: CacheKey, seen: Option<&Arc<CacheEntry>>) -> (Flight, FlightStart) {
        let mut inflight = self.inner.inflight.lock();
        if let Some(existing) = inflight.get(&key) {
            debug!(%key, "Joining in-flight fetch");
            return (existing.shared.clone(), FlightStart::Joined);
        }

        if let Some(result) = self.settled(key, seen) {
            debug!(%key, "Fetch finished before this caller joined");
            return (future::ready(result).boxed().shared(), FlightStart::Settled);
        }

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let result = inner.fetch_and_publish(key).await;
            inner.inflight.lock().remove(&key);
            result
        });
        let abort = task.abort_handle();
        let shared = task
            .map(|joined| {
                joined.unwrap_or_else(|e| {
                    Err(QueryError::TransientUpstream(format!("Fetch task ended: {}", e)))
                })
            })
            .boxed()
            .shared();

        inflight.insert(
            key,
            InFlight {
                shared: shared.clone(),
                abort,
            },
        );
        (shared, FlightStart::Started)
    }

    /// Outcome already in the store that makes a new fetch for `key` pointless
    fn settled(&self, key: CacheKey, seen: Option<&Arc<CacheEntry>>) -> Option<FlightResult> {
        match (self.inner.store.get(&key), seen) {
            (Some(current), Some(seen)) if Arc::ptr_eq(&current, seen) => None,
            (Some(current), _) => Some(Ok(current)),
            (None, _) => {
                let record = self.inner.store.missing_record(key.date()?)?;
                record
                    .is_active(self.inner.clock.now())
                    .then_some(Err(QueryError::NotYetAvailable {
                        key,
                        retry_at: Some(record.next_recheck_at),
                    }))
            }
        }
    }

    /// Starts a fetch for `key` that nobody waits on
    fn spawn_refresh(&self, key: CacheKey, seen: Option<&Arc<CacheEntry>>) -> BackgroundRefresh {
        let (flight, start) = self.flight(key, seen);
        match start {
            FlightStart::Joined => BackgroundRefresh::AlreadyRunning,
            FlightStart::Settled => BackgroundRefresh::UpToDate,
            FlightStart::Started => {
                info!(%key, "Starting background refresh");
                let mut tasks = self.inner.background.lock();
                while tasks.try_join_next().is_some() {}
                tasks.spawn(async move {
                    let _ = flight.await;
                });
                BackgroundRefresh::Started
            }
        }
    }

    /// Proactively refreshes the latest entry if it is due and someone is around
    pub fn refresh_latest_if_due(&self) -> BackgroundRefresh {
        let now = self.inner.clock.now();
        if !self.is_active(now) {
            debug!("No recent activity, background refresh suspended");
            return BackgroundRefresh::Suspended;
        }

        match self.inner.store.get(&CacheKey::Latest) {
            Some(entry) if self.inner.policy.evaluate(&entry, now) == Freshness::Fresh => {
                BackgroundRefresh::UpToDate
            }
            seen => self.spawn_refresh(CacheKey::Latest, seen.as_ref()),
        }
    }

    /// Records a heartbeat from the client layer
    pub fn record_activity(&self, at: DateTime<Utc>) {
        self.inner.activity.record(at);
    }

    /// Records a heartbeat at the coordinator's current time
    pub fn record_activity_now(&self) {
        self.inner.activity.record(self.inner.clock.now());
    }

    /// Whether any presence was seen within the inactivity window
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        let external = self
            .inner
            .external_activity
            .as_ref()
            .and_then(|signal| signal.last_seen());
        let last_seen = self.inner.activity.last_seen().max(external);
        activity::is_active(last_seen, now, self.inner.inactivity_window)
    }

    /// Counts entries by state
    pub fn status(&self) -> CacheStatus {
        let now = self.inner.clock.now();
        let mut status = CacheStatus {
            missing: self.inner.store.missing_count(),
            in_flight: self.inner.inflight.lock().len(),
            ..CacheStatus::default()
        };

        for entry in self.inner.store.entries() {
            match self.inner.policy.evaluate(&entry, now) {
                Freshness::Fresh => status.fresh += 1,
                Freshness::Stale => status.stale += 1,
                Freshness::Frozen => status.frozen += 1,
            }
        }
        status
    }

    /// Forces the next query for `key` to go upstream
    pub fn invalidate(&self, key: CacheKey) -> bool {
        let removed = self.inner.store.invalidate(&key);
        info!(%key, removed, "Invalidated cache key");
        removed
    }

    /// Dates with a cached entry, newest first
    pub fn cached_dates(&self) -> Vec<NaiveDate> {
        self.inner
            .store
            .snapshot_keys()
            .into_iter()
            .filter_map(|key| key.date())
            .collect()
    }

    /// Waits for every background refresh started so far
    pub async fn join_background(&self) {
        let mut tasks = std::mem::take(&mut *self.inner.background.lock());
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Background refresh task failed");
            }
        }
    }

    /// Abandons outstanding fetches and stops new ones
    ///
    /// Nothing an abandoned fetch downloaded is published; callers still
    /// waiting on one get a transient error.
    pub async fn shutdown(&self) {
        self.inner.permits.close();
        let abandoned: Vec<InFlight> = self
            .inner
            .inflight
            .lock()
            .drain()
            .map(|(_, flight)| flight)
            .collect();
        for flight in &abandoned {
            flight.abort.abort();
        }

        let mut tasks = std::mem::take(&mut *self.inner.background.lock());
        tasks.shutdown().await;
        info!(outstanding = abandoned.len(), "Coordinator shut down");
    }
}

impl Inner {
    /// Fetches `key` and publishes the outcome into the store
    async fn fetch_and_publish(&self, key: CacheKey) -> FlightResult {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| QueryError::TransientUpstream("Coordinator is shutting down".into()))?;

        info!(%key, "Fetching from upstream");
        let started_at = self.clock.now();
        let fetched = tokio::time::timeout(self.fetch_timeout, self.upstream.fetch(key)).await;
        let now = self.clock.now();

        match fetched {
            Err(_) => {
                warn!(%key, timeout = ?self.fetch_timeout, "Upstream fetch timed out");
                Err(QueryError::TransientUpstream(format!(
                    "Timed out after {:?}",
                    self.fetch_timeout
                )))
            }
            Ok(Err(FetchError::Transient(message))) => {
                warn!(%key, error = %message, "Upstream fetch failed");
                Err(QueryError::TransientUpstream(message))
            }
            Ok(Err(FetchError::NotYetPublished)) => Err(self.record_not_published(key, now)),
            Ok(Ok(batch)) => Ok(self.publish(key, batch, started_at, now)),
        }
    }

    /// Puts a not-yet-published date into (or further into) backoff
    fn record_not_published(&self, key: CacheKey, now: DateTime<Utc>) -> QueryError {
        let retry_at = key.date().and_then(|date| {
            let previous = self.store.missing_record(date).map(|record| record.backoff);
            let backoff = self.backoff.next(previous);
            self.store
                .mark_missing(date, now, backoff)
                .map(|record| record.next_recheck_at)
        });

        info!(%key, ?retry_at, "Upstream has not published key yet");
        QueryError::NotYetAvailable { key, retry_at }
    }

    /// Publishes a fetched batch
    ///
    /// The latest batch also fills its own date. Other days carried by the
    /// batch are seeded without replacing entries newer than this fetch.
    fn publish(
        &self,
        key: CacheKey,
        batch: UpstreamBatch,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Arc<CacheEntry> {
        let UpstreamBatch {
            data_date,
            regions,
            other_days,
        } = batch;
        let payload = Arc::new(regions);
        let entry = self
            .store
            .put(CacheEntry::new(key, Arc::clone(&payload), data_date, now));

        if key == CacheKey::Latest {
            self.store.put(CacheEntry::new(
                CacheKey::Date(data_date),
                payload,
                data_date,
                now,
            ));
        }

        let mut seeded = 0;
        for (date, regions) in other_days {
            if date < self.historical_start {
                continue;
            }
            let seed = CacheEntry::new(CacheKey::Date(date), Arc::new(regions), date, now);
            if self.store.seed(seed, started_at) {
                seeded += 1;
            }
        }

        info!(
            %key,
            %data_date,
            regions = entry.payload.len(),
            seeded,
            "Published entry"
        );
        entry
    }
}
