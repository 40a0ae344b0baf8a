use crate::config::ReconcileConfig;
use crate::normalize::normalize;
use crate::resolver_queue::{Resolution, ResolverQueue};
use crate::state_manager::refresh_key;
use crate::surface::{EditorSurface, SurfaceId};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::task::JoinHandle;
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 256;

/// Page lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PageEvent {
    #[serde(rename_all = "camelCase")]
    Created {
        title: String,
        page_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Renamed {
        page_id: String,
        old_title: String,
        new_title: String,
    },
}

impl PageEvent {
    pub fn created(title: impl Into<String>, page_id: impl Into<String>) -> Self {
        PageEvent::Created {
            title: title.into(),
            page_id: Some(page_id.into()),
        }
    }

    /// Normalized key the event makes resolvable.
    pub fn key(&self) -> String {
        match self {
            PageEvent::Created { title, .. } => normalize(title),
            PageEvent::Renamed { new_title, .. } => normalize(new_title),
        }
    }
}

/// An event as carried across engines, tagged with the publishing engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageEventEnvelope {
    pub sender: Uuid,
    pub event: PageEvent,
}

/// Broadcast channel shared by the engines of one process, one per tab.
#[derive(Debug, Clone)]
pub struct PageEventChannel {
    tx: broadcast::Sender<PageEventEnvelope>,
}

impl Default for PageEventChannel {
    fn default() -> Self {
        Self::new(CHANNEL_CAPACITY)
    }
}

impl PageEventChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Returns how many listeners received the event.
    pub fn publish(&self, envelope: PageEventEnvelope) -> usize {
        self.tx.send(envelope).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PageEventEnvelope> {
        self.tx.subscribe()
    }
}

/// Open surfaces of one engine, held weakly.
#[derive(Default)]
pub struct SurfaceRegistry {
    surfaces: DashMap<SurfaceId, Weak<EditorSurface>>,
}

impl SurfaceRegistry {
    pub fn register(&self, surface: &Arc<EditorSurface>) {
        self.surfaces.insert(surface.id(), Arc::downgrade(surface));
    }

    pub fn unregister(&self, id: SurfaceId) {
        self.surfaces.remove(&id);
    }

    /// Surfaces still alive, in id order. Dropped ones are pruned.
    pub fn live(&self) -> Vec<Arc<EditorSurface>> {
        self.surfaces.retain(|_, weak| weak.strong_count() > 0);
        let mut live: Vec<Arc<EditorSurface>> = self
            .surfaces
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect();
        live.sort_by_key(|s| s.id());
        live
    }

    pub fn len(&self) -> usize {
        self.live().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Applies page events to every open surface of one engine, and relays them
/// to other engines through the shared channel.
pub struct ReconciliationCoordinator {
    id: Uuid,
    config: ReconcileConfig,
    resolver: Arc<ResolverQueue>,
    surfaces: Arc<SurfaceRegistry>,
    channel: PageEventChannel,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl ReconciliationCoordinator {
    pub fn new(
        config: ReconcileConfig,
        resolver: Arc<ResolverQueue>,
        surfaces: Arc<SurfaceRegistry>,
        channel: PageEventChannel,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            config,
            resolver,
            surfaces,
            channel,
            listener: Mutex::new(None),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn channel(&self) -> &PageEventChannel {
        &self.channel
    }

    /// A page event from this engine: apply it here synchronously, then
    /// broadcast it. Returns the number of references flipped locally.
    pub fn notify_local(&self, event: PageEvent) -> usize {
        let flipped = self.apply(&event);
        self.channel.publish(PageEventEnvelope {
            sender: self.id,
            event,
        });
        flipped
    }

    /// Apply one event to every open surface.
    pub fn apply(&self, event: &PageEvent) -> usize {
        match event {
            PageEvent::Created {
                title,
                page_id: Some(page_id),
            } => {
                let key = normalize(title);
                self.resolver.cache_page(&key, page_id);
                self.reconcile_key(&key, page_id)
            }
            PageEvent::Created {
                title,
                page_id: None,
            } => {
                // No id to link to; let the resolver look the title up again.
                let key = normalize(title);
                self.resolver.invalidate(&key, None);
                let requeued: usize = self
                    .surfaces
                    .live()
                    .iter()
                    .map(|surface| refresh_key(surface, &key))
                    .sum();
                tracing::info!("Page {:?} created, re-resolving {} reference(s)", key, requeued);
                0
            }
            PageEvent::Renamed {
                page_id,
                old_title,
                new_title,
            } => {
                self.resolver.invalidate(&normalize(old_title), Some(page_id));
                let key = normalize(new_title);
                self.resolver.cache_page(&key, page_id);
                self.reconcile_key(&key, page_id)
            }
        }
    }

    fn reconcile_key(&self, key: &str, page_id: &str) -> usize {
        let mut flipped = 0;
        for surface in self.surfaces.live() {
            let index = surface.index();
            index.rebuild_now(&surface);
            flipped += index.update_to_exists(&surface, key, page_id);
        }
        if flipped > 0 {
            self.resolver.metrics().track_reconciled(flipped);
        }
        flipped
    }

    /// Re-check every key still indexed as missing on any surface, cache
    /// first and then search, and flip the ones that now resolve.
    pub async fn reconcile_stale_keys(&self) -> usize {
        let mut keys: Vec<String> = Vec::new();
        for surface in self.surfaces.live() {
            surface.index().rebuild_now(&surface);
            keys.extend(surface.index().keys());
        }
        keys.sort();
        keys.dedup();

        let mut flipped = 0;
        for key in &keys {
            match self.resolver.resolve_key(key).await {
                Resolution::Cached(page_id) | Resolution::Found(page_id) => {
                    flipped += self.reconcile_key(key, &page_id);
                }
                Resolution::Missing => {}
                Resolution::Failed(e) => {
                    tracing::warn!("Stale key {:?} not rechecked: {}", key, e);
                }
            }
        }
        tracing::info!(
            "Rechecked {} stale key(s), reconciled {} reference(s)",
            keys.len(),
            flipped
        );
        flipped
    }

    /// Start applying events published by other engines. Returns `false`
    /// when no runtime is available or a listener already runs.
    pub fn spawn_listener(self: &Arc<Self>) -> bool {
        let mut slot = self.listener.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return false;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No async runtime; cross-engine page events are not applied");
            return false;
        };
        let rx = self.channel.subscribe();
        let weak = Arc::downgrade(self);
        let debounce = self.config.debounce();
        *slot = Some(handle.spawn(listen(weak, rx, debounce)));
        true
    }

    pub fn stop(&self) {
        if let Some(handle) = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }

    fn apply_remote(&self, batch: Vec<PageEventEnvelope>) -> usize {
        // Last event per key wins; keys keep first-seen order.
        let mut order: Vec<String> = Vec::new();
        let mut latest: HashMap<String, PageEvent> = HashMap::new();
        for envelope in batch {
            if envelope.sender == self.id {
                continue;
            }
            let key = envelope.event.key();
            if !latest.contains_key(&key) {
                order.push(key.clone());
            }
            latest.insert(key, envelope.event);
        }

        let mut flipped = 0;
        for key in order {
            if let Some(event) = latest.remove(&key) {
                flipped += self.apply(&event);
            }
        }
        flipped
    }
}

async fn listen(
    coordinator: Weak<ReconciliationCoordinator>,
    mut rx: broadcast::Receiver<PageEventEnvelope>,
    debounce: std::time::Duration,
) {
    loop {
        let mut lagged = false;
        let mut batch = Vec::new();
        match rx.recv().await {
            Ok(envelope) => batch.push(envelope),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!("Page event listener lagged by {} event(s)", skipped);
                lagged = true;
            }
            Err(RecvError::Closed) => return,
        }

        if !debounce.is_zero() {
            tokio::time::sleep(debounce).await;
        }
        loop {
            match rx.try_recv() {
                Ok(envelope) => batch.push(envelope),
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!("Page event listener lagged by {} event(s)", skipped);
                    lagged = true;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }

        let Some(coordinator) = coordinator.upgrade() else {
            return;
        };
        let flipped = coordinator.apply_remote(batch);
        if flipped > 0 {
            tracing::info!("Applied remote page events, reconciled {} reference(s)", flipped);
        }
        if lagged {
            // Missed events cannot be replayed; recheck what is still missing.
            coordinator.reconcile_stale_keys().await;
        }
    }
}
