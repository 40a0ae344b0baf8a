use crate::annotation::{AnnotationPatch, LinkState, Variant};
use crate::config::{LinkConfig, ResolverConfig};
use crate::error::SearchError;
use crate::metrics::UnilinkMetrics;
use crate::search::{exact_match, PageSearch};
use crate::state_manager::{update_mark_state_if, UpdateOutcome};
use crate::surface::EditorSurface;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;
use tokio::time::Instant;

/// One pending reference waiting for resolution.
#[derive(Debug, Clone)]
pub struct ResolverQueueItem {
    pub key: String,
    pub mark_id: String,
    pub variant: Variant,
    pub surface: Weak<EditorSurface>,
}

impl ResolverQueueItem {
    pub fn new(key: &str, mark_id: &str, variant: Variant, surface: Weak<EditorSurface>) -> Self {
        Self {
            key: key.to_string(),
            mark_id: mark_id.to_string(),
            variant,
            surface,
        }
    }
}

/// Result of resolving one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Cached(String),
    Found(String),
    Missing,
    Failed(SearchError),
}

impl Resolution {
    fn patch(&self, links: &LinkConfig) -> AnnotationPatch {
        match self {
            Resolution::Cached(id) | Resolution::Found(id) => {
                AnnotationPatch::resolved(id.clone(), links.href_for(id))
            }
            Resolution::Missing => AnnotationPatch::missing(),
            Resolution::Failed(_) => AnnotationPatch::error(),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedPage {
    page_id: String,
    stored: Instant,
}

/// Clears `running` and wakes waiters if a drain task unwinds, so
/// `wait_idle` and later enqueues are not stuck behind a dead task.
struct DrainGuard<'a> {
    queue: &'a ResolverQueue,
    armed: bool,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::error!("Resolver drain task ended with work in flight");
            self.queue.running.store(false, Ordering::Release);
            self.queue.idle.notify_waiters();
        }
    }
}

/// FIFO of pending references shared by every surface of one engine.
///
/// Draining runs as a single tokio task started on demand: batches of
/// `batch_size` items, each batch followed by `batch_delay`. Every write
/// goes through the state manager, keyed by markId, so items whose
/// annotation vanished or changed key meanwhile are dropped.
pub struct ResolverQueue {
    config: ResolverConfig,
    links: LinkConfig,
    search: Arc<dyn PageSearch>,
    metrics: Arc<UnilinkMetrics>,
    queue: Mutex<VecDeque<ResolverQueueItem>>,
    cache: DashMap<String, CachedPage>,
    running: AtomicBool,
    idle: Notify,
    self_ref: Weak<ResolverQueue>,
}

impl ResolverQueue {
    pub fn new(
        config: ResolverConfig,
        links: LinkConfig,
        search: Arc<dyn PageSearch>,
        metrics: Arc<UnilinkMetrics>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            config,
            links,
            search,
            metrics,
            queue: Mutex::new(VecDeque::new()),
            cache: DashMap::new(),
            running: AtomicBool::new(false),
            idle: Notify::new(),
            self_ref: self_ref.clone(),
        })
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn links(&self) -> &LinkConfig {
        &self.links
    }

    pub fn metrics(&self) -> &Arc<UnilinkMetrics> {
        &self.metrics
    }

    /// Append an item and make sure a drain task is running.
    pub fn enqueue(&self, item: ResolverQueueItem) {
        tracing::debug!("Queued resolution of {:?} ({})", item.key, item.mark_id);
        self.metrics.track_requeued(&item.mark_id);
        self.lock_queue().push_back(item);
        self.ensure_draining();
    }

    pub fn pending_len(&self) -> usize {
        self.lock_queue().len()
    }

    pub fn is_idle(&self) -> bool {
        !self.running.load(Ordering::SeqCst) && self.lock_queue().is_empty()
    }

    /// Wait until the queue is empty and no drain task is running. Items
    /// queued while no runtime was available start draining here.
    pub async fn wait_idle(&self) {
        if self.pending_len() > 0 {
            self.ensure_draining();
        }
        loop {
            let notified = self.idle.notified();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Drop queued work and cached keys. A drain task already running
    /// finishes its current item and exits.
    pub fn reset(&self) {
        let dropped: Vec<ResolverQueueItem> = self.lock_queue().drain(..).collect();
        for item in &dropped {
            self.metrics.forget(&item.mark_id);
        }
        self.cache.clear();
        tracing::debug!("Resolver reset, dropped {} queued item(s)", dropped.len());
    }

    // ---------------------------------------------------------------------
    // Cache
    // ---------------------------------------------------------------------

    pub fn cached_page(&self, key: &str) -> Option<String> {
        let entry = self.cache.get(key)?;
        if let Some(ttl) = self.config.cache_ttl() {
            if entry.stored.elapsed() > ttl {
                drop(entry);
                self.cache.remove(key);
                return None;
            }
        }
        Some(entry.page_id.clone())
    }

    pub fn cache_page(&self, key: &str, page_id: &str) {
        self.cache.insert(
            key.to_string(),
            CachedPage {
                page_id: page_id.to_string(),
                stored: Instant::now(),
            },
        );
    }

    /// Forget `key`, but only while it still points at `page_id` when one is
    /// given.
    pub fn invalidate(&self, key: &str, page_id: Option<&str>) {
        match page_id {
            Some(id) => {
                self.cache.remove_if(key, |_, cached| cached.page_id == id);
            }
            None => {
                self.cache.remove(key);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Draining
    // ---------------------------------------------------------------------

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<ResolverQueueItem>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_draining(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(this) = self.self_ref.upgrade() else {
            self.running.store(false, Ordering::Release);
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(this.drain());
            }
            Err(_) => {
                self.running.store(false, Ordering::Release);
                tracing::warn!(
                    "No async runtime; {} resolution(s) stay queued",
                    self.pending_len()
                );
            }
        }
    }

    fn next_batch(&self) -> Vec<ResolverQueueItem> {
        let mut queue = self.lock_queue();
        let n = self.config.batch_size.max(1).min(queue.len());
        queue.drain(..n).collect()
    }

    async fn drain(self: Arc<Self>) {
        let mut guard = DrainGuard {
            queue: &self,
            armed: true,
        };
        loop {
            let batch = self.next_batch();
            if batch.is_empty() {
                self.running.store(false, Ordering::Release);
                // An enqueue may have seen `running == true` after our empty
                // read; take the work back if nobody else did.
                if self.pending_len() > 0 && !self.running.swap(true, Ordering::AcqRel) {
                    continue;
                }
                guard.armed = false;
                self.idle.notify_waiters();
                return;
            }

            tracing::debug!("Resolving batch of {}", batch.len());
            for item in batch {
                self.process_item(item).await;
            }
            tokio::time::sleep(self.config.batch_delay()).await;
        }
    }

    async fn process_item(&self, item: ResolverQueueItem) {
        let resolution = self.resolve_key(&item.key).await;
        let patch = resolution.patch(&self.links);

        let Some(surface) = item.surface.upgrade() else {
            tracing::debug!("Surface closed before {} resolved", item.mark_id);
            self.metrics.forget(&item.mark_id);
            return;
        };

        // Only a pending annotation with the key we searched for takes the
        // result; anything else was edited, refreshed or reconciled meanwhile.
        let outcome = update_mark_state_if(&surface, &item.mark_id, &patch, |current| {
            current.key == item.key && current.state == LinkState::Pending
        });
        match outcome {
            UpdateOutcome::Updated => {}
            UpdateOutcome::NotFound => {
                tracing::debug!("Dropped result for deleted mark {}", item.mark_id);
                self.metrics.forget(&item.mark_id);
                return;
            }
            UpdateOutcome::Rejected => {
                tracing::debug!(
                    "Dropped stale result for {} (key {:?})",
                    item.mark_id,
                    item.key
                );
                // A still-pending mark belongs to a newer item, which keeps
                // the clock running.
                let still_pending = surface
                    .find_mark(&item.mark_id)
                    .is_some_and(|span| span.annotation.state == LinkState::Pending);
                if !still_pending {
                    self.metrics.forget(&item.mark_id);
                }
                return;
            }
        }

        match resolution {
            Resolution::Cached(_) | Resolution::Found(_) => {
                self.metrics.track_resolved(&item.mark_id)
            }
            Resolution::Missing => self.metrics.track_missing(&item.mark_id),
            Resolution::Failed(_) => self.metrics.track_error(&item.mark_id),
        }
    }

    /// Cache first, then search with retries; exact normalized-title match
    /// wins regardless of candidate order.
    pub async fn resolve_key(&self, key: &str) -> Resolution {
        if let Some(page_id) = self.cached_page(key) {
            self.metrics.track_cache_hit();
            return Resolution::Cached(page_id);
        }
        self.metrics.track_cache_miss();

        let candidates = match self.search_with_retry(key).await {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::error!("Search for {:?} failed after retries: {}", key, e);
                return Resolution::Failed(e);
            }
        };

        match exact_match(&candidates, key) {
            Some(candidate) => {
                self.cache_page(key, &candidate.id);
                Resolution::Found(candidate.id.clone())
            }
            None => Resolution::Missing,
        }
    }

    async fn search_with_retry(
        &self,
        key: &str,
    ) -> Result<Vec<crate::search::SearchCandidate>, SearchError> {
        let mut attempt = 0;
        loop {
            match self.search.search(key).await {
                Ok(candidates) => return Ok(candidates),
                Err(e) if attempt < self.config.max_retries => {
                    let delay = self.config.retry_delay(attempt);
                    tracing::warn!(
                        "Search for {:?} failed (attempt {}), retrying in {:?}: {}",
                        key,
                        attempt + 1,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
