use crate::annotation::{LinkAnnotation, LinkState, Variant};
use crate::error::{Result, UnilinkError};
use crate::link_parser::{registry, ReferenceSpan};
use crate::origin::Origin;
use crate::resolver_queue::ResolverQueueItem;
use crate::state_manager::{self, generate_mark_id};
use crate::surface::{format_range, mark_attrs, scan_annotations, AnnotatedSpan, EditorSurface};
use std::ops::Range;
use yrs::{GetString, Text};

/// What activating (clicking) a reference should do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAction {
    Navigate(String),
    OpenExternal(String),
    OfferCreate { title: String },
    Pending,
    Retry,
}

impl EditorSurface {
    /// Insert a reference at `index` as a created annotation over its display
    /// text, without delimiters, and queue it. Returns its markId.
    pub fn insert_reference(&self, index: usize, variant: Variant, raw: &str) -> Result<String> {
        self.check_range(&(index..index))?;
        let mut annotation = variant.spec().build_annotation(raw, generate_mark_id());
        annotation.created = true;
        let display = annotation.text.clone();

        self.edit(Origin::COMMAND, |txn, text| {
            let attrs = mark_attrs(variant.spec(), Some(&annotation));
            text.insert_with_attributes(txn, index as u32, &display, attrs);
        });
        self.track_and_enqueue(&annotation);
        Ok(annotation.mark_id)
    }

    /// Turn existing text into a created annotation. A tag range may include
    /// its leading `#`.
    pub fn annotate_range(&self, range: Range<usize>, variant: Variant) -> Result<String> {
        self.check_range(&range)?;
        let content = self.text();
        let selected = &content[range.clone()];
        let raw = match variant {
            Variant::Tag => selected.strip_prefix('#').unwrap_or(selected),
            Variant::Bracket => selected,
        };
        if raw.trim().is_empty() {
            return Err(UnilinkError::InvalidRange {
                start: range.start,
                end: range.end,
                len: content.len(),
            });
        }

        let mut annotation = variant.spec().build_annotation(raw, generate_mark_id());
        annotation.created = true;
        self.edit(Origin::COMMAND, |txn, text| {
            format_range(txn, text, &range, mark_attrs(variant.spec(), Some(&annotation)));
        });
        self.track_and_enqueue(&annotation);
        Ok(annotation.mark_id)
    }

    pub fn refresh_all(&self) -> usize {
        state_manager::refresh_all(self)
    }

    /// Surround `range` with the variant's delimiters; the synchronizer then
    /// annotates it like typed text.
    pub fn wrap_selection(&self, range: Range<usize>, variant: Variant) -> Result<()> {
        self.check_range(&range)?;
        let (open, close) = variant.spec().delimiters();
        self.edit(Origin::COMMAND, |txn, text| {
            if !close.is_empty() {
                text.insert(txn, range.end as u32, close);
            }
            text.insert(txn, range.start as u32, open);
        });
        Ok(())
    }

    /// Remove an annotation together with its delimiters, keeping the inner
    /// text. Returns `false` when no annotation carries `mark_id`.
    pub fn unwrap_reference(&self, mark_id: &str) -> Result<bool> {
        let Some(span) = self.find_mark(mark_id) else {
            return Ok(false);
        };
        let range = span.range();
        let content = self.text();
        let covered = content.get(range.clone()).unwrap_or_default();
        let (open, close) = span.variant().spec().delimiters();
        let has_open = !open.is_empty() && covered.starts_with(open);
        let has_close = !close.is_empty()
            && covered.len() >= open.len() + close.len()
            && covered.ends_with(close);
        let spec = span.variant().spec();

        self.edit(Origin::COMMAND, |txn, text| {
            for segment in &span.segments {
                format_range(txn, text, segment, mark_attrs(spec, None));
            }
            if has_close {
                text.remove_range(txn, (range.end - close.len()) as u32, close.len() as u32);
            }
            if has_open {
                text.remove_range(txn, range.start as u32, open.len() as u32);
            }
        });
        self.resolver().metrics().forget(mark_id);
        Ok(true)
    }

    /// Convert delimiter syntax into created annotations in one transaction:
    /// bracket spans lose their brackets, tags keep the `#`. A span that a
    /// synchronizer already annotated keeps its markId and state; spans
    /// overlapping a created annotation are left alone. Returns the number
    /// converted.
    pub fn migrate_legacy_syntax(&self) -> usize {
        let mut fresh: Vec<LinkAnnotation> = Vec::new();
        let count = self.edit_counted(Origin::MIGRATION, |txn, text| {
            let content = text.get_string(&*txn);
            let existing = scan_annotations(&*txn, text, None);
            let mut plans: Vec<(ReferenceSpan, Option<AnnotatedSpan>)> = Vec::new();
            for spec in registry() {
                for span in spec.find_spans(&content) {
                    let range = span.range();
                    let overlapping: Vec<&AnnotatedSpan> =
                        existing.iter().filter(|a| a.overlaps(&range)).collect();
                    if overlapping.iter().any(|a| a.annotation.created) {
                        continue;
                    }
                    let synced = overlapping
                        .into_iter()
                        .find(|a| a.variant() == span.variant && a.annotation.raw == span.raw)
                        .cloned();
                    plans.push((span, synced));
                }
            }
            // Back to front so earlier offsets stay valid while delimiters go.
            plans.sort_by(|a, b| b.0.start.cmp(&a.0.start));

            for (span, synced) in &plans {
                let spec = span.variant.spec();
                let annotation = match synced {
                    Some(current) => {
                        for segment in &current.segments {
                            format_range(txn, text, segment, mark_attrs(spec, None));
                        }
                        LinkAnnotation {
                            created: true,
                            ..current.annotation.clone()
                        }
                    }
                    None => {
                        let mut annotation = spec.build_annotation(&span.raw, generate_mark_id());
                        annotation.created = true;
                        fresh.push(annotation.clone());
                        annotation
                    }
                };
                let (open, close) = match span.variant {
                    Variant::Bracket => spec.delimiters(),
                    Variant::Tag => ("", ""),
                };
                let inner = span.start + open.len()..span.end - close.len();
                format_range(txn, text, &inner, mark_attrs(spec, Some(&annotation)));
                if !close.is_empty() {
                    text.remove_range(txn, inner.end as u32, close.len() as u32);
                }
                if !open.is_empty() {
                    text.remove_range(txn, span.start as u32, open.len() as u32);
                }
            }
            plans.len()
        });
        if count == 0 {
            return 0;
        }

        fresh.reverse();
        for annotation in &fresh {
            self.track_and_enqueue(annotation);
        }
        tracing::info!("Migrated {} legacy reference(s)", count);
        count
    }

    /// What a click on the annotation carrying `mark_id` should do.
    pub fn activate(&self, mark_id: &str) -> Option<LinkAction> {
        let annotation = self.find_mark(mark_id)?.annotation;
        let action = match annotation.state {
            LinkState::Exists if annotation.is_external() => {
                LinkAction::OpenExternal(annotation.href)
            }
            LinkState::Exists => LinkAction::Navigate(annotation.href),
            LinkState::Missing => LinkAction::OfferCreate {
                title: annotation.raw,
            },
            LinkState::Pending => LinkAction::Pending,
            LinkState::Error => LinkAction::Retry,
        };
        Some(action)
    }

    fn track_and_enqueue(&self, annotation: &LinkAnnotation) {
        if annotation.is_external() {
            return;
        }
        let metrics = self.resolver().metrics();
        metrics.track_created(&annotation.mark_id, annotation.variant);
        self.resolver().enqueue(ResolverQueueItem::new(
            &annotation.key,
            &annotation.mark_id,
            annotation.variant,
            self.downgrade(),
        ));
    }
}
