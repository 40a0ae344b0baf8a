use crate::annotation::AnnotationPatch;
use crate::config::EngineConfig;
use crate::error::{Result, UnilinkError};
use crate::metrics::UnilinkMetrics;
use crate::reconciler::{PageEvent, PageEventChannel, ReconciliationCoordinator, SurfaceRegistry};
use crate::resolver_queue::ResolverQueue;
use crate::search::{PageCreator, PageRecord, PageSearch};
use crate::state_manager::update_mark_state;
use crate::surface::EditorSurface;
use std::sync::Arc;

/// One engine per tab: a shared resolver queue and cache, the open editing
/// surfaces, and the coordinator relaying page events.
pub struct Engine {
    config: EngineConfig,
    metrics: Arc<UnilinkMetrics>,
    resolver: Arc<ResolverQueue>,
    surfaces: Arc<SurfaceRegistry>,
    coordinator: Arc<ReconciliationCoordinator>,
}

impl Engine {
    pub fn new<S: PageSearch + 'static>(config: EngineConfig, search: S) -> Result<Self> {
        Self::with_channel(config, search, PageEventChannel::default())
    }

    /// Engine sharing `channel` with other engines, so page events published
    /// by any of them reach all.
    pub fn with_channel<S: PageSearch + 'static>(
        config: EngineConfig,
        search: S,
        channel: PageEventChannel,
    ) -> Result<Self> {
        Self::from_parts(config, Arc::new(search), channel)
    }

    pub fn from_parts(
        config: EngineConfig,
        search: Arc<dyn PageSearch>,
        channel: PageEventChannel,
    ) -> Result<Self> {
        config.validate()?;
        let metrics = Arc::new(UnilinkMetrics::new()?);
        let resolver = ResolverQueue::new(
            config.resolver.clone(),
            config.links.clone(),
            search,
            metrics.clone(),
        );
        let surfaces = Arc::new(SurfaceRegistry::default());
        let coordinator = ReconciliationCoordinator::new(
            config.reconcile.clone(),
            resolver.clone(),
            surfaces.clone(),
            channel,
        );
        Ok(Self {
            config,
            metrics,
            resolver,
            surfaces,
            coordinator,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn resolver(&self) -> &Arc<ResolverQueue> {
        &self.resolver
    }

    pub fn metrics(&self) -> &Arc<UnilinkMetrics> {
        &self.metrics
    }

    pub fn surfaces(&self) -> &SurfaceRegistry {
        &self.surfaces
    }

    pub fn coordinator(&self) -> &Arc<ReconciliationCoordinator> {
        &self.coordinator
    }

    /// New empty surface attached to this engine.
    pub fn open_surface(&self) -> Arc<EditorSurface> {
        let surface = EditorSurface::new(
            self.resolver.clone(),
            self.config.index.clone(),
            self.config.links.clone(),
        );
        self.surfaces.register(&surface);
        tracing::debug!("Opened surface {:?}", surface.id());
        surface
    }

    /// New surface loaded from a persisted fragment.
    pub fn load_surface(&self, html: &str) -> Result<Arc<EditorSurface>> {
        let surface = self.open_surface();
        if let Err(e) = surface.load_html(html) {
            self.surfaces.unregister(surface.id());
            return Err(e);
        }
        Ok(surface)
    }

    /// Detach a surface. Queued work for it is dropped when it resolves.
    pub fn close_surface(&self, surface: &EditorSurface) {
        self.surfaces.unregister(surface.id());
    }

    /// Page created in this tab. Returns the number of references flipped.
    pub fn page_created(&self, title: &str, page_id: &str) -> usize {
        self.coordinator.notify_local(PageEvent::created(title, page_id))
    }

    pub fn page_renamed(&self, page_id: &str, old_title: &str, new_title: &str) -> usize {
        self.coordinator.notify_local(PageEvent::Renamed {
            page_id: page_id.to_string(),
            old_title: old_title.to_string(),
            new_title: new_title.to_string(),
        })
    }

    /// Create the page a reference points at and link the reference to it.
    /// Other references with the same key, here and in other tabs, follow
    /// through reconciliation.
    pub async fn create_page_from_mark(
        &self,
        surface: &EditorSurface,
        mark_id: &str,
        creator: &dyn PageCreator,
    ) -> Result<PageRecord> {
        let annotation = surface
            .find_mark(mark_id)
            .map(|span| span.annotation)
            .ok_or_else(|| UnilinkError::UnknownMark(mark_id.to_string()))?;

        let record = creator.create_page(&annotation.raw).await?;
        tracing::info!("Created page {:?} as {}", record.title, record.id);
        self.metrics.track_page_created();

        let patch = AnnotationPatch::resolved(&record.id, self.config.links.href_for(&record.id))
            .with_created(true);
        if !update_mark_state(surface, mark_id, &patch) {
            tracing::warn!("Mark {} vanished while its page was created", mark_id);
        }
        self.resolver.cache_page(&annotation.key, &record.id);
        self.coordinator
            .notify_local(PageEvent::created(&annotation.raw, &record.id));
        Ok(record)
    }

    /// Apply page events published by other engines on the shared channel.
    pub fn start_cross_tab_sync(&self) -> bool {
        self.coordinator.spawn_listener()
    }

    pub fn stop_cross_tab_sync(&self) {
        self.coordinator.stop();
    }

    /// Wait until every queued resolution has been applied.
    pub async fn settle(&self) {
        self.resolver.wait_idle().await;
    }

    /// Drop queued resolutions, the cache and the counters.
    pub fn reset(&self) {
        self.resolver.reset();
        self.metrics.reset();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.coordinator.stop();
    }
}
