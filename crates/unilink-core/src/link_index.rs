use crate::annotation::{AnnotationPatch, LinkAnnotation, LinkState};
use crate::config::{IndexConfig, LinkConfig};
use crate::origin::Origin;
use crate::surface::{DocChange, DocumentObserver, EditorSurface};
use dashmap::DashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::time::Instant;

/// A `missing` annotation as seen by the last rebuild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub range: Range<usize>,
    pub mark_id: String,
    pub annotation: LinkAnnotation,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub keys: usize,
    pub entries: usize,
    pub rebuilds: u64,
}

/// Per-surface reverse map from normalized key to the `missing` annotations
/// carrying it.
///
/// Rebuilds are full rescans. A rebuild requested within
/// `min_rebuild_interval` of the previous one is deferred to a single
/// trailing rescan once the interval has passed.
pub struct ReferenceIndex {
    config: IndexConfig,
    links: LinkConfig,
    entries: DashMap<String, Vec<IndexEntry>>,
    last_rebuild: Mutex<Option<Instant>>,
    trailing: AtomicBool,
    rebuilds: AtomicU64,
}

impl ReferenceIndex {
    pub fn new(config: IndexConfig, links: LinkConfig) -> Self {
        Self {
            config,
            links,
            entries: DashMap::new(),
            last_rebuild: Mutex::new(None),
            trailing: AtomicBool::new(false),
            rebuilds: AtomicU64::new(0),
        }
    }

    /// Throttled rebuild. Returns `true` when the scan ran now.
    pub fn rebuild(&self, surface: &EditorSurface) -> bool {
        let interval = self.config.min_rebuild_interval();
        let remaining = {
            let last = self.last_rebuild.lock().unwrap_or_else(|e| e.into_inner());
            (*last)
                .and_then(|at| interval.checked_sub(at.elapsed()))
                .filter(|d| !d.is_zero())
        };
        match remaining {
            None => {
                self.rebuild_now(surface);
                true
            }
            Some(wait) => {
                self.schedule_trailing(surface, wait);
                false
            }
        }
    }

    fn schedule_trailing(&self, surface: &EditorSurface, wait: std::time::Duration) {
        if self.trailing.swap(true, Ordering::AcqRel) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            // The next change after the interval rebuilds instead.
            self.trailing.store(false, Ordering::Release);
            return;
        };
        let weak = surface.downgrade();
        handle.spawn(async move {
            tokio::time::sleep(wait).await;
            if let Some(surface) = weak.upgrade() {
                surface.index().rebuild_now(&surface);
            }
        });
    }

    /// Full rescan regardless of throttling.
    pub fn rebuild_now(&self, surface: &EditorSurface) {
        self.trailing.store(false, Ordering::Release);
        *self.last_rebuild.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        self.rebuilds.fetch_add(1, Ordering::Relaxed);

        self.entries.clear();
        for span in surface.annotations(None) {
            if span.annotation.state != LinkState::Missing {
                continue;
            }
            self.entries
                .entry(span.annotation.key.clone())
                .or_default()
                .push(IndexEntry {
                    range: span.range(),
                    mark_id: span.annotation.mark_id.clone(),
                    annotation: span.annotation,
                });
        }
        tracing::debug!(
            "Rebuilt reference index for surface {:?}: {} key(s)",
            surface.id(),
            self.entries.len()
        );
    }

    pub fn get_positions_by_key(&self, key: &str) -> Vec<IndexEntry> {
        self.entries
            .get(key)
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    pub fn get_positions_by_keys(&self, keys: &[&str]) -> Vec<(String, Vec<IndexEntry>)> {
        keys.iter()
            .filter_map(|key| {
                self.entries
                    .get(*key)
                    .map(|entries| (key.to_string(), entries.clone()))
            })
            .collect()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Flip every unresolved annotation with `key` to `exists` in one
    /// transaction, then drop the key. Returns the number flipped.
    pub fn update_to_exists(&self, surface: &EditorSurface, key: &str, target_id: &str) -> usize {
        let patch = AnnotationPatch::resolved(target_id, self.links.href_for(target_id));
        let flipped = surface.rewrite_marks(Origin::RECONCILE, |current| {
            let unresolved = matches!(current.state, LinkState::Missing | LinkState::Pending);
            if current.key != key || !unresolved || current.is_external() {
                return None;
            }
            let mut updated = current.clone();
            patch.apply(&mut updated);
            Some(updated)
        });
        self.entries.remove(key);
        if flipped > 0 {
            tracing::info!(
                "Reconciled {} reference(s) to {:?} as {}",
                flipped,
                key,
                target_id
            );
        }
        flipped
    }

    /// Drop the entry of a mark whose state changed.
    pub fn forget_mark(&self, mark_id: &str) {
        self.entries
            .iter_mut()
            .for_each(|mut entry| entry.value_mut().retain(|e| e.mark_id != mark_id));
        self.entries.retain(|_, entries| !entries.is_empty());
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            keys: self.entries.len(),
            entries: self.entries.iter().map(|e| e.value().len()).sum(),
            rebuilds: self.rebuilds.load(Ordering::Relaxed),
        }
    }
}

impl DocumentObserver for ReferenceIndex {
    fn on_change(&self, surface: &EditorSurface, change: &DocChange) {
        if change.origin == Origin::RECONCILE {
            return;
        }
        self.rebuild(surface);
    }
}
