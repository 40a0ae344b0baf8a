use crate::annotation::Variant;
use crate::error::Result;
use dashmap::DashMap;
use prometheus::{Counter, Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use serde::Serialize;
use tokio::time::Instant;

/// Resolution counters for one engine, registered in a private registry so
/// several engines in one process never collide.
pub struct UnilinkMetrics {
    registry: Registry,
    created: IntCounterVec,
    resolved: IntCounter,
    missing: IntCounter,
    errors: IntCounter,
    cache_hits: IntCounter,
    cache_misses: IntCounter,
    pages_created: IntCounter,
    reconciled: IntCounter,
    resolution_seconds: Counter,
    resolutions_timed: IntCounter,
    started: DashMap<String, Instant>,
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub created_bracket: u64,
    pub created_tag: u64,
    pub resolved: u64,
    pub missing: u64,
    pub errors: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub pages_created: u64,
    pub reconciled: u64,
    pub cache_hit_rate: f64,
    pub average_resolution_ms: f64,
}

impl UnilinkMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let created = IntCounterVec::new(
            Opts::new("unilink_references_created_total", "References recognized"),
            &["variant"],
        )?;
        let resolved = IntCounter::new("unilink_resolved_total", "References resolved to a page")?;
        let missing = IntCounter::new("unilink_missing_total", "References with no matching page")?;
        let errors = IntCounter::new("unilink_errors_total", "Resolutions that exhausted retries")?;
        let cache_hits = IntCounter::new("unilink_cache_hits_total", "Resolutions served from cache")?;
        let cache_misses =
            IntCounter::new("unilink_cache_misses_total", "Resolutions that needed a search")?;
        let pages_created =
            IntCounter::new("unilink_pages_created_total", "Pages created from missing references")?;
        let reconciled = IntCounter::new(
            "unilink_reconciled_total",
            "Missing references flipped to exists by reconciliation",
        )?;
        let resolution_seconds = Counter::new(
            "unilink_resolution_seconds_total",
            "Time from enqueue to final state",
        )?;
        let resolutions_timed =
            IntCounter::new("unilink_resolutions_timed_total", "Resolutions with a start time")?;

        registry.register(Box::new(created.clone()))?;
        registry.register(Box::new(resolved.clone()))?;
        registry.register(Box::new(missing.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(cache_hits.clone()))?;
        registry.register(Box::new(cache_misses.clone()))?;
        registry.register(Box::new(pages_created.clone()))?;
        registry.register(Box::new(reconciled.clone()))?;
        registry.register(Box::new(resolution_seconds.clone()))?;
        registry.register(Box::new(resolutions_timed.clone()))?;

        Ok(Self {
            registry,
            created,
            resolved,
            missing,
            errors,
            cache_hits,
            cache_misses,
            pages_created,
            reconciled,
            resolution_seconds,
            resolutions_timed,
            started: DashMap::new(),
        })
    }

    /// A reference was recognized and handed to the queue.
    pub fn track_created(&self, mark_id: &str, variant: Variant) {
        self.created.with_label_values(&[variant.as_str()]).inc();
        self.started.insert(mark_id.to_string(), Instant::now());
    }

    /// Restart the clock for a reference that re-entered `pending`.
    pub fn track_requeued(&self, mark_id: &str) {
        self.started.insert(mark_id.to_string(), Instant::now());
    }

    pub fn track_resolved(&self, mark_id: &str) {
        self.resolved.inc();
        self.finish(mark_id);
    }

    pub fn track_missing(&self, mark_id: &str) {
        self.missing.inc();
        self.finish(mark_id);
    }

    pub fn track_error(&self, mark_id: &str) {
        self.errors.inc();
        self.finish(mark_id);
    }

    pub fn track_cache_hit(&self) {
        self.cache_hits.inc();
    }

    pub fn track_cache_miss(&self) {
        self.cache_misses.inc();
    }

    pub fn track_page_created(&self) {
        self.pages_created.inc();
    }

    pub fn track_reconciled(&self, count: usize) {
        self.reconciled.inc_by(count as u64);
    }

    /// Drop the clock of a reference whose result was discarded.
    pub fn forget(&self, mark_id: &str) {
        self.started.remove(mark_id);
    }

    /// References whose resolution clock is still running.
    pub fn in_flight(&self) -> usize {
        self.started.len()
    }

    fn finish(&self, mark_id: &str) {
        if let Some((_, started)) = self.started.remove(mark_id) {
            self.resolution_seconds
                .inc_by(started.elapsed().as_secs_f64());
            self.resolutions_timed.inc();
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        let cache_hits = self.cache_hits.get();
        let cache_misses = self.cache_misses.get();
        let lookups = cache_hits + cache_misses;
        let timed = self.resolutions_timed.get();
        MetricsSummary {
            created_bracket: self.created.with_label_values(&[Variant::Bracket.as_str()]).get(),
            created_tag: self.created.with_label_values(&[Variant::Tag.as_str()]).get(),
            resolved: self.resolved.get(),
            missing: self.missing.get(),
            errors: self.errors.get(),
            cache_hits,
            cache_misses,
            pages_created: self.pages_created.get(),
            reconciled: self.reconciled.get(),
            cache_hit_rate: if lookups == 0 {
                0.0
            } else {
                cache_hits as f64 / lookups as f64
            },
            average_resolution_ms: if timed == 0 {
                0.0
            } else {
                self.resolution_seconds.get() * 1000.0 / timed as f64
            },
        }
    }

    /// Prometheus text exposition of every counter.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let families = self.registry.gather();
        if let Err(e) = TextEncoder::new().encode(&families, &mut buf) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    pub fn reset(&self) {
        self.created.reset();
        self.resolved.reset();
        self.missing.reset();
        self.errors.reset();
        self.cache_hits.reset();
        self.cache_misses.reset();
        self.pages_created.reset();
        self.reconciled.reset();
        self.resolution_seconds.reset();
        self.resolutions_timed.reset();
        self.started.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn counts_by_variant() {
        let metrics = UnilinkMetrics::new().unwrap();
        metrics.track_created("a", Variant::Bracket);
        metrics.track_created("b", Variant::Bracket);
        metrics.track_created("c", Variant::Tag);
        let summary = metrics.summary();
        assert_eq!(summary.created_bracket, 2);
        assert_eq!(summary.created_tag, 1);
    }

    #[test]
    fn cache_hit_rate_over_lookups() {
        let metrics = UnilinkMetrics::new().unwrap();
        assert_eq!(metrics.summary().cache_hit_rate, 0.0);
        metrics.track_cache_hit();
        metrics.track_cache_miss();
        metrics.track_cache_miss();
        metrics.track_cache_hit();
        assert!((metrics.summary().cache_hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn measures_time_to_final_state() {
        let metrics = UnilinkMetrics::new().unwrap();
        metrics.track_created("m1", Variant::Bracket);
        tokio::time::sleep(Duration::from_millis(40)).await;
        metrics.track_resolved("m1");
        let summary = metrics.summary();
        assert_eq!(summary.resolved, 1);
        assert!(summary.average_resolution_ms >= 40.0);
        assert!(summary.average_resolution_ms < 41.0);
    }

    #[test]
    fn outcome_without_start_is_counted_but_not_timed() {
        let metrics = UnilinkMetrics::new().unwrap();
        metrics.track_missing("never-started");
        let summary = metrics.summary();
        assert_eq!(summary.missing, 1);
        assert_eq!(summary.average_resolution_ms, 0.0);
    }

    #[test]
    fn reset_zeroes_everything() {
        let metrics = UnilinkMetrics::new().unwrap();
        metrics.track_created("m", Variant::Tag);
        metrics.track_error("m");
        metrics.track_page_created();
        metrics.track_reconciled(3);
        metrics.reset();
        assert_eq!(metrics.summary(), MetricsSummary::default());
    }

    #[test]
    fn render_exposes_counter_names() {
        let metrics = UnilinkMetrics::new().unwrap();
        metrics.track_created("m", Variant::Bracket);
        metrics.track_resolved("m");
        let text = metrics.render();
        assert!(text.contains("unilink_references_created_total"));
        assert!(text.contains("unilink_resolved_total 1"));
    }

    #[test]
    fn engines_get_independent_registries() {
        let a = UnilinkMetrics::new().unwrap();
        let b = UnilinkMetrics::new().unwrap();
        a.track_cache_hit();
        assert_eq!(a.summary().cache_hits, 1);
        assert_eq!(b.summary().cache_hits, 0);
    }
}
