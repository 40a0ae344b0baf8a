use crate::annotation::LinkAnnotation;
use crate::link_parser::{ReferenceSpan, VariantSpec};
use crate::resolver_queue::{ResolverQueue, ResolverQueueItem};
use crate::state_manager::generate_mark_id;
use crate::surface::{
    format_range, mark_attrs, scan_annotations, AnnotatedSpan, DocChange, DocumentObserver,
    EditorSurface,
};
use std::ops::Range;
use std::sync::Arc;
use yrs::GetString;

/// Keeps one variant's annotations in step with the delimiter-complete spans
/// of the document.
pub struct MarkSynchronizer {
    spec: &'static dyn VariantSpec,
    resolver: Arc<ResolverQueue>,
}

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassOutcome {
    /// The change carried this synchronizer's own origin.
    pub skipped: bool,
    pub applied: usize,
    pub updated: usize,
    pub extended: usize,
    pub removed: usize,
    pub committed: bool,
}

impl PassOutcome {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }
}

/// Mark operations computed from one snapshot, applied later in a single
/// transaction: all clears first, then all sets.
#[derive(Debug, Default)]
pub(crate) struct SyncPlan {
    clears: Vec<Range<usize>>,
    sets: Vec<(Range<usize>, LinkAnnotation)>,
    /// Annotations to resolve; `true` marks a newly recognized reference.
    enqueue: Vec<(LinkAnnotation, bool)>,
    outcome: PassOutcome,
}

impl SyncPlan {
    fn is_empty(&self) -> bool {
        self.clears.is_empty() && self.sets.is_empty()
    }
}

impl MarkSynchronizer {
    pub fn new(spec: &'static dyn VariantSpec, resolver: Arc<ResolverQueue>) -> Self {
        Self { spec, resolver }
    }

    pub fn spec(&self) -> &'static dyn VariantSpec {
        self.spec
    }

    /// Diff complete spans against existing annotations and commit the
    /// difference, if any, as one transaction tagged with this variant's
    /// origin.
    pub fn run_pass(&self, surface: &EditorSurface, change: &DocChange) -> PassOutcome {
        if change.origin == self.spec.origin() {
            return PassOutcome::skipped();
        }

        // Plan and apply under one write transaction so a state write from
        // the resolver cannot land between the snapshot and the commit.
        let spec = self.spec;
        let mut plan = SyncPlan::default();
        let changed = surface.edit_counted(spec.origin(), |txn, text| {
            let content = text.get_string(&*txn);
            let existing = scan_annotations(&*txn, text, Some(spec));
            plan = plan_pass(spec, &content, &existing);
            if plan.is_empty() {
                return 0;
            }
            for range in &plan.clears {
                format_range(txn, text, range, mark_attrs(spec, None));
            }
            for (range, annotation) in &plan.sets {
                format_range(txn, text, range, mark_attrs(spec, Some(annotation)));
            }
            plan.clears.len() + plan.sets.len()
        });

        if changed == 0 {
            return plan.outcome;
        }

        tracing::debug!(
            "{} sync: applied={} updated={} extended={} removed={}",
            spec.variant(),
            plan.outcome.applied,
            plan.outcome.updated,
            plan.outcome.extended,
            plan.outcome.removed
        );

        for (annotation, fresh) in &plan.enqueue {
            if *fresh {
                self.resolver
                    .metrics()
                    .track_created(&annotation.mark_id, annotation.variant);
            }
            self.resolver.enqueue(ResolverQueueItem::new(
                &annotation.key,
                &annotation.mark_id,
                annotation.variant,
                surface.downgrade(),
            ));
        }

        PassOutcome {
            committed: true,
            ..plan.outcome
        }
    }
}

impl DocumentObserver for MarkSynchronizer {
    fn on_change(&self, surface: &EditorSurface, change: &DocChange) {
        self.run_pass(surface, change);
    }
}

/// Compute the operations that bring `existing` (annotations of `spec`'s
/// variant) in line with the complete spans of `text`.
pub(crate) fn plan_pass(
    spec: &'static dyn VariantSpec,
    text: &str,
    existing: &[AnnotatedSpan],
) -> SyncPlan {
    let spans: Vec<ReferenceSpan> = spec.find_spans(text);
    let mut plan = SyncPlan::default();
    let mut consumed = vec![false; existing.len()];

    for span in &spans {
        let range = span.range();
        let overlapping: Vec<usize> = existing
            .iter()
            .enumerate()
            .filter(|(i, a)| !consumed[*i] && a.overlaps(&range))
            .map(|(i, _)| i)
            .collect();

        let Some(&primary) = overlapping.first() else {
            let annotation = spec.build_annotation(&span.raw, generate_mark_id());
            if !annotation.is_external() {
                plan.enqueue.push((annotation.clone(), true));
            }
            plan.sets.push((range, annotation));
            plan.outcome.applied += 1;
            continue;
        };

        let current = &existing[primary];
        let exact = overlapping.len() == 1 && current.segments == [range.clone()];
        if exact && current.annotation.raw == span.raw {
            consumed[primary] = true;
            continue;
        }

        for &i in &overlapping {
            consumed[i] = true;
            plan.clears.extend(existing[i].segments.iter().cloned());
        }

        let annotation = if current.annotation.raw == span.raw {
            plan.outcome.extended += 1;
            current.annotation.clone()
        } else {
            let mut rebuilt = spec.build_annotation(&span.raw, current.annotation.mark_id.clone());
            rebuilt.created = current.annotation.created;
            if !rebuilt.is_external() {
                plan.enqueue.push((rebuilt.clone(), false));
            }
            plan.outcome.updated += 1;
            rebuilt
        };
        plan.sets.push((range, annotation));
    }

    for (i, annotation) in existing.iter().enumerate() {
        if consumed[i] || annotation.annotation.created {
            continue;
        }
        plan.clears.extend(annotation.segments.iter().cloned());
        plan.outcome.removed += 1;
    }

    plan
}
