//! # Query Planner
//!
//! Resolves [`AggregationRequest`]s through a result cache in front of the
//! record store.
//!
//! - Requests are normalized and hashed into a [`CacheKey`]; equivalent
//!   requests share one entry.
//! - Each key owns a [`Slot`] behind its own async mutex. The key map lock
//!   is only held to find or create a slot, and a slot lock is never held
//!   across store I/O.
//! - At most one computation per key runs at a time (single-flight). It is
//!   a [`Shared`] future; the slot keeps only a weak handle, so once every
//!   waiter has gone away the computation is dropped.
//! - Every ingested batch bumps the store generation and clears the cache.
//!   A computation that started under an older generation still answers
//!   its waiters but is never cached. Entries older than the TTL are never
//!   served.

use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared, WeakShared};
use futures_util::StreamExt;
use ja_core::{
    AggregationRequest, AggregationResult, Aggregator, AnalyticsError, CacheKey, EngineConfig,
    FilterSet, TimeWindow,
};
use ja_store::adapter::RecordCount;
use ja_store::{RawRecord, RecordAdapter};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

type Computation = BoxFuture<'static, Result<Computed, AnalyticsError>>;

/// Output of one computation, shared by all of its waiters.
#[derive(Debug, Clone)]
pub struct Computed {
    pub result: Arc<AggregationResult>,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Resolved {
    pub result: Arc<AggregationResult>,
    pub computed_at: DateTime<Utc>,
    pub cache_hit: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOutcome {
    pub accepted: usize,
    pub invalidated_entries: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub live: usize,
    /// Entries past their TTL or from an older generation, awaiting sweep.
    pub expired: usize,
    pub inflight: usize,
    pub hits: u64,
    pub misses: u64,
    pub computations: u64,
    pub invalidations: u64,
    pub generation: u64,
    pub ttl_secs: u64,
}

// =============================================================================
// Slots
// =============================================================================

struct CacheEntry {
    result: Arc<AggregationResult>,
    computed_at: DateTime<Utc>,
    stored_at: Instant,
    generation: u64,
}

impl CacheEntry {
    fn is_live(&self, generation: u64, ttl: Duration) -> bool {
        self.generation == generation && self.stored_at.elapsed() < ttl
    }
}

struct InFlight {
    generation: u64,
    handle: WeakShared<Computation>,
}

#[derive(Default)]
struct Slot {
    entry: Option<CacheEntry>,
    inflight: Option<InFlight>,
}

impl Slot {
    /// A still-running computation for `generation`, if any waiter keeps
    /// it alive.
    fn join(&self, generation: u64) -> Option<Shared<Computation>> {
        self.inflight
            .as_ref()
            .filter(|f| f.generation == generation)
            .and_then(|f| f.handle.upgrade())
    }

    fn is_idle(&self) -> bool {
        self.entry.is_none()
            && self
                .inflight
                .as_ref()
                .map_or(true, |f| f.handle.upgrade().is_none())
    }
}

// =============================================================================
// Planner
// =============================================================================

struct PlannerInner {
    adapter: RecordAdapter,
    engine: EngineConfig,
    ttl: Duration,
    generation: AtomicU64,
    slots: RwLock<HashMap<CacheKey, Arc<Mutex<Slot>>>>,
    /// Last observed store fingerprint.
    fingerprint: Mutex<Option<u64>>,
    hits: AtomicU64,
    misses: AtomicU64,
    computations: AtomicU64,
    invalidations: AtomicU64,
}

/// Cheap to clone; all clones share one cache.
#[derive(Clone)]
pub struct QueryPlanner {
    inner: Arc<PlannerInner>,
}

impl QueryPlanner {
    pub fn new(adapter: RecordAdapter, engine: EngineConfig, ttl: Duration) -> Self {
        Self {
            inner: Arc::new(PlannerInner {
                adapter,
                engine,
                ttl,
                generation: AtomicU64::new(0),
                slots: RwLock::new(HashMap::new()),
                fingerprint: Mutex::new(None),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                computations: AtomicU64::new(0),
                invalidations: AtomicU64::new(0),
            }),
        }
    }

    pub fn store_name(&self) -> &str {
        self.inner.adapter.store().name()
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Serve `request` from cache, or join / start its computation.
    pub async fn resolve(&self, request: &AggregationRequest) -> Result<Resolved, AnalyticsError> {
        let request = request.normalized()?;
        let key = request.cache_key()?;
        let slot = self.slot(&key).await;

        let computation = {
            let mut guard = slot.lock().await;
            let generation = self.generation();

            if let Some(entry) = guard.entry.as_ref().filter(|e| e.is_live(generation, self.inner.ttl)) {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Cache hit: {} [{}]", request.dimension, key);
                return Ok(Resolved {
                    result: entry.result.clone(),
                    computed_at: entry.computed_at,
                    cache_hit: true,
                });
            }
            guard.entry = None;
            self.inner.misses.fetch_add(1, Ordering::Relaxed);

            match guard.join(generation) {
                Some(running) => {
                    tracing::debug!("Joining in-flight computation [{}]", key);
                    running
                }
                None => {
                    tracing::debug!("Cache miss: {} [{}]", request.dimension, key);
                    let computation =
                        compute(self.inner.clone(), request, slot.clone(), generation)
                            .boxed()
                            .shared();
                    guard.inflight = computation
                        .downgrade()
                        .map(|handle| InFlight { generation, handle });
                    computation
                }
            }
        };

        let computed = computation.await?;
        Ok(Resolved {
            result: computed.result,
            computed_at: computed.computed_at,
            cache_hit: false,
        })
    }

    /// Bump the generation and drop every cached entry. Returns how many
    /// entries were dropped.
    pub async fn invalidate(&self) -> usize {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.invalidations.fetch_add(1, Ordering::Relaxed);
        let dropped = self.drain().await;
        tracing::info!(
            "Cache invalidated: generation {} ({} entries dropped)",
            generation,
            dropped
        );
        dropped
    }

    /// Drop every cached entry without touching the generation.
    pub async fn clear(&self) -> usize {
        let dropped = self.drain().await;
        tracing::info!("Cache cleared ({} entries dropped)", dropped);
        dropped
    }

    /// Evict expired entries and forget idle slots.
    pub async fn sweep_expired(&self) -> usize {
        let generation = self.generation();
        let ttl = self.inner.ttl;
        let mut evicted = 0;
        let mut slots = self.inner.slots.write().await;
        slots.retain(|_, slot| {
            // A locked slot is in use; leave it for the next sweep.
            let Ok(mut guard) = slot.try_lock() else {
                return true;
            };
            if guard.entry.as_ref().is_some_and(|e| !e.is_live(generation, ttl)) {
                guard.entry = None;
                evicted += 1;
            }
            !guard.is_idle()
        });
        if evicted > 0 {
            tracing::debug!("Sweeper evicted {} expired entries", evicted);
        }
        evicted
    }

    /// Compare the store fingerprint with the last one seen and invalidate
    /// when it moved. Returns whether an invalidation happened.
    pub async fn refresh_fingerprint(&self) -> Result<bool, AnalyticsError> {
        let current = self.inner.adapter.fingerprint().await?;
        let changed = {
            let mut known = self.inner.fingerprint.lock().await;
            let changed = matches!(*known, Some(previous) if previous != current);
            *known = Some(current);
            changed
        };
        if changed {
            tracing::info!("Store '{}' changed out of band", self.store_name());
            self.invalidate().await;
        }
        Ok(changed)
    }

    /// Append a batch to the store, then invalidate.
    pub async fn ingest(&self, batch: Vec<RawRecord>) -> Result<IngestOutcome, AnalyticsError> {
        let accepted = self.inner.adapter.ingest(batch).await?;
        let invalidated_entries = self.invalidate().await;
        // Remember the post-ingest fingerprint so the poller does not
        // invalidate a second time for this batch.
        if let Ok(current) = self.inner.adapter.fingerprint().await {
            *self.inner.fingerprint.lock().await = Some(current);
        }
        tracing::info!(
            "Ingested {} records into '{}'",
            accepted,
            self.store_name()
        );
        Ok(IngestOutcome {
            accepted,
            invalidated_entries,
        })
    }

    /// Record coverage for a window; bypasses the cache.
    pub async fn count(
        &self,
        filters: &FilterSet,
        window: &TimeWindow,
    ) -> Result<RecordCount, AnalyticsError> {
        window.validate()?;
        self.inner.adapter.count(filters, window).await
    }

    pub async fn stats(&self) -> CacheStats {
        let generation = self.generation();
        let slots: Vec<_> = self.inner.slots.read().await.values().cloned().collect();

        let (mut entries, mut live, mut inflight) = (0, 0, 0);
        for slot in slots {
            let guard = slot.lock().await;
            if let Some(entry) = &guard.entry {
                entries += 1;
                if entry.is_live(generation, self.inner.ttl) {
                    live += 1;
                }
            }
            if guard.join(generation).is_some() {
                inflight += 1;
            }
        }

        CacheStats {
            entries,
            live,
            expired: entries - live,
            inflight,
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            computations: self.inner.computations.load(Ordering::Relaxed),
            invalidations: self.inner.invalidations.load(Ordering::Relaxed),
            generation,
            ttl_secs: self.inner.ttl.as_secs(),
        }
    }

    async fn slot(&self, key: &CacheKey) -> Arc<Mutex<Slot>> {
        if let Some(slot) = self.inner.slots.read().await.get(key) {
            return slot.clone();
        }
        self.inner
            .slots
            .write()
            .await
            .entry(key.clone())
            .or_default()
            .clone()
    }

    /// Drop every entry. Slots with a live computation stay in the map so
    /// later requests keep joining it instead of starting a second one.
    async fn drain(&self) -> usize {
        let mut slots = self.inner.slots.write().await;
        let mut running = HashMap::new();
        let mut dropped = 0;
        for (key, slot) in slots.drain() {
            let busy = {
                let mut guard = slot.lock().await;
                if guard.entry.take().is_some() {
                    dropped += 1;
                }
                guard
                    .inflight
                    .as_ref()
                    .is_some_and(|f| f.handle.upgrade().is_some())
            };
            if busy {
                running.insert(key, slot);
            }
        }
        *slots = running;
        dropped
    }
}

// =============================================================================
// Computation
// =============================================================================

async fn compute(
    inner: Arc<PlannerInner>,
    request: AggregationRequest,
    slot: Arc<Mutex<Slot>>,
    generation: u64,
) -> Result<Computed, AnalyticsError> {
    inner.computations.fetch_add(1, Ordering::Relaxed);
    let started = Instant::now();
    let outcome = run_aggregation(&inner.adapter, &inner.engine, &request).await;

    let mut guard = slot.lock().await;
    if guard
        .inflight
        .as_ref()
        .is_some_and(|f| f.generation == generation)
    {
        guard.inflight = None;
    }

    match outcome {
        Ok(result) => {
            let computed = Computed {
                result: Arc::new(result),
                computed_at: Utc::now(),
            };
            if inner.generation.load(Ordering::SeqCst) == generation {
                guard.entry = Some(CacheEntry {
                    result: computed.result.clone(),
                    computed_at: computed.computed_at,
                    stored_at: Instant::now(),
                    generation,
                });
            } else {
                tracing::debug!(
                    "Not caching {} result from stale generation {}",
                    request.dimension,
                    generation
                );
            }
            tracing::debug!(
                "Computed {} over {} postings in {:?}",
                request.dimension,
                computed.result.total_count,
                started.elapsed()
            );
            Ok(computed)
        }
        Err(e) => {
            tracing::warn!("Computation of {} failed: {}", request.dimension, e);
            Err(e)
        }
    }
}

async fn run_aggregation(
    adapter: &RecordAdapter,
    engine: &EngineConfig,
    request: &AggregationRequest,
) -> Result<AggregationResult, AnalyticsError> {
    let mut aggregator = Aggregator::new(request, engine)?;
    let mut postings = adapter
        .fetch_records(&request.filters, &request.window)
        .await?;
    while let Some(posting) = postings.next().await {
        aggregator.push(&posting?);
    }
    let mut result = aggregator.finish();
    result.skipped_count = postings.skipped();
    Ok(result)
}
