use crate::annotation::{LinkAnnotation, Variant};
use crate::config::{IndexConfig, LinkConfig};
use crate::error::{Result, UnilinkError};
use crate::link_index::ReferenceIndex;
use crate::link_parser::{registry, VariantSpec};
use crate::mark_sync::MarkSynchronizer;
use crate::origin::Origin;
use crate::persist::{self, TextRun};
use crate::resolver_queue::ResolverQueue;
use std::collections::{HashMap, VecDeque};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::thread::{self, ThreadId};
use yrs::types::text::{Diff, YChange};
use yrs::types::Attrs;
use yrs::{Any, Doc, GetString, Out, ReadTxn, Text, TextRef, Transact, TransactionMut, WriteTxn};

/// Name of the shared text holding the document body.
pub const CONTENTS: &str = "contents";

static NEXT_SURFACE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(pub u64);

/// Notification delivered to observers after a transaction commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocChange {
    pub origin: Origin,
    pub revision: u64,
}

/// Reacts to committed document changes. Implementations must ignore changes
/// whose origin is their own.
pub trait DocumentObserver: Send + Sync {
    fn on_change(&self, surface: &EditorSurface, change: &DocChange);
}

/// One logical annotation as currently stored: its attributes and the byte
/// ranges carrying its markId, in document order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotatedSpan {
    pub annotation: LinkAnnotation,
    pub segments: Vec<Range<usize>>,
}

impl AnnotatedSpan {
    pub fn mark_id(&self) -> &str {
        &self.annotation.mark_id
    }

    pub fn variant(&self) -> Variant {
        self.annotation.variant
    }

    /// From the first segment's start to the last segment's end.
    pub fn range(&self) -> Range<usize> {
        let start = self.segments.first().map_or(0, |r| r.start);
        let end = self.segments.last().map_or(0, |r| r.end);
        start..end
    }

    pub fn is_contiguous(&self) -> bool {
        self.segments.len() == 1
    }

    pub fn overlaps(&self, range: &Range<usize>) -> bool {
        self.segments
            .iter()
            .any(|s| s.start < range.end && s.end > range.start)
    }
}

/// An editable document with live reference annotations.
///
/// Every mutation runs as one yrs transaction tagged with an [`Origin`];
/// after it commits, the change is queued and handed to each observer in
/// registration order. Changes produced while observers run are queued
/// behind the current one, so observers never re-enter each other.
///
/// yrs allows a single live write transaction per document, so every
/// transaction is taken under `doc_lock`. The lock is released before
/// observers run. One thread dispatches at a time; an edit committed on
/// another thread waits at `dispatch_gate` until its change has been seen
/// by every observer.
pub struct EditorSurface {
    id: SurfaceId,
    doc: Doc,
    doc_lock: RwLock<()>,
    resolver: Arc<ResolverQueue>,
    index: Arc<ReferenceIndex>,
    links: LinkConfig,
    observers: RwLock<Vec<Arc<dyn DocumentObserver>>>,
    pending_changes: Mutex<VecDeque<DocChange>>,
    dispatch_gate: Mutex<()>,
    dispatch_owner: Mutex<Option<ThreadId>>,
    revision: AtomicU64,
    self_ref: Weak<EditorSurface>,
}

impl EditorSurface {
    /// Create an empty surface with one synchronizer per registered variant
    /// and its own reference index.
    pub fn new(resolver: Arc<ResolverQueue>, index: IndexConfig, links: LinkConfig) -> Arc<Self> {
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            txn.get_or_insert_text(CONTENTS);
        }
        let reference_index = Arc::new(ReferenceIndex::new(index, links.clone()));

        let mut observers: Vec<Arc<dyn DocumentObserver>> = registry()
            .iter()
            .map(|spec| {
                Arc::new(MarkSynchronizer::new(*spec, resolver.clone()))
                    as Arc<dyn DocumentObserver>
            })
            .collect();
        observers.push(reference_index.clone());

        Arc::new_cyclic(|self_ref| EditorSurface {
            id: SurfaceId(NEXT_SURFACE_ID.fetch_add(1, Ordering::Relaxed)),
            doc,
            doc_lock: RwLock::new(()),
            resolver,
            index: reference_index,
            links,
            observers: RwLock::new(observers),
            pending_changes: Mutex::new(VecDeque::new()),
            dispatch_gate: Mutex::new(()),
            dispatch_owner: Mutex::new(None),
            revision: AtomicU64::new(0),
            self_ref: self_ref.clone(),
        })
    }

    pub fn id(&self) -> SurfaceId {
        self.id
    }

    pub fn resolver(&self) -> &Arc<ResolverQueue> {
        &self.resolver
    }

    pub fn index(&self) -> &ReferenceIndex {
        &self.index
    }

    pub fn links(&self) -> &LinkConfig {
        &self.links
    }

    pub fn downgrade(&self) -> Weak<EditorSurface> {
        self.self_ref.clone()
    }

    /// Number of transactions committed through this surface.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    pub fn add_observer(&self, observer: Arc<dyn DocumentObserver>) {
        self.observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    // ---------------------------------------------------------------------
    // Transactions and change dispatch
    // ---------------------------------------------------------------------

    fn read_lock(&self) -> RwLockReadGuard<'_, ()> {
        self.doc_lock.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_lock(&self) -> RwLockWriteGuard<'_, ()> {
        self.doc_lock.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` in one write transaction tagged with `origin`, then notify
    /// observers. `f` must not call back into this surface.
    pub fn edit<F, R>(&self, origin: Origin, f: F) -> R
    where
        F: FnOnce(&mut TransactionMut, &TextRef) -> R,
    {
        let result = {
            let _doc = self.write_lock();
            let mut txn = self.doc.transact_mut_with(origin.as_str());
            let text = txn.get_or_insert_text(CONTENTS);
            f(&mut txn, &text)
        };
        self.committed(origin);
        result
    }

    /// Like [`edit`](Self::edit) but `f` reports how many marks it changed;
    /// observers are only notified when that count is non-zero.
    pub(crate) fn edit_counted<F>(&self, origin: Origin, f: F) -> usize
    where
        F: FnOnce(&mut TransactionMut, &TextRef) -> usize,
    {
        let changed = {
            let _doc = self.write_lock();
            let mut txn = self.doc.transact_mut_with(origin.as_str());
            let text = txn.get_or_insert_text(CONTENTS);
            f(&mut txn, &text)
        };
        if changed > 0 {
            self.committed(origin);
        }
        changed
    }

    fn committed(&self, origin: Origin) {
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        self.dispatch(DocChange { origin, revision });
    }

    fn dispatch(&self, change: DocChange) {
        self.pending_changes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(change);

        let me = thread::current().id();
        if *self.dispatch_owner.lock().unwrap_or_else(|e| e.into_inner()) == Some(me) {
            // Committed by an observer; the loop further up this stack runs it.
            return;
        }

        let _gate = self.dispatch_gate.lock().unwrap_or_else(|e| e.into_inner());
        let _owner = DispatchOwner::claim(&self.dispatch_owner, me);
        while let Some(change) = self.next_change() {
            let observers: Vec<Arc<dyn DocumentObserver>> = self
                .observers
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            for observer in &observers {
                observer.on_change(self, &change);
            }
        }
    }

    fn next_change(&self) -> Option<DocChange> {
        self.pending_changes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    // ---------------------------------------------------------------------
    // Reading
    // ---------------------------------------------------------------------

    pub fn text(&self) -> String {
        let _doc = self.read_lock();
        let txn = self.doc.transact();
        txn.get_text(CONTENTS)
            .map(|text| text.get_string(&txn))
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.text().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Text and annotations of every variant, read from one snapshot.
    pub fn snapshot(&self) -> (String, Vec<AnnotatedSpan>) {
        let _doc = self.read_lock();
        let txn = self.doc.transact();
        match txn.get_text(CONTENTS) {
            Some(text) => (text.get_string(&txn), scan_annotations(&txn, &text, None)),
            None => (String::new(), Vec::new()),
        }
    }

    /// Annotations of one variant (or all when `None`), in document order.
    pub fn annotations(&self, variant: Option<Variant>) -> Vec<AnnotatedSpan> {
        let _doc = self.read_lock();
        let txn = self.doc.transact();
        match txn.get_text(CONTENTS) {
            Some(text) => scan_annotations(&txn, &text, variant.map(|v| v.spec())),
            None => Vec::new(),
        }
    }

    /// Fresh scan for the annotation carrying `mark_id`.
    pub fn find_mark(&self, mark_id: &str) -> Option<AnnotatedSpan> {
        self.annotations(None)
            .into_iter()
            .find(|span| span.mark_id() == mark_id)
    }

    /// Text split into runs with their covering annotations, bracket before tag.
    pub fn runs(&self) -> Vec<TextRun> {
        let _doc = self.read_lock();
        let txn = self.doc.transact();
        let Some(text) = txn.get_text(CONTENTS) else {
            return Vec::new();
        };
        let mut runs: Vec<TextRun> = Vec::new();
        for chunk in text.diff(&txn, YChange::identity) {
            let Some(content) = chunk_str(&chunk) else {
                continue;
            };
            let mut annotations = Vec::new();
            if let Some(attrs) = &chunk.attributes {
                for spec in registry() {
                    if let Some(annotation) = attrs
                        .get(spec.attribute_key())
                        .and_then(LinkAnnotation::from_any)
                    {
                        annotations.push(annotation);
                    }
                }
            }
            match runs.last_mut() {
                Some(last) if last.annotations == annotations => last.text.push_str(content),
                _ => runs.push(TextRun {
                    text: content.to_string(),
                    annotations,
                }),
            }
        }
        runs
    }

    /// Persisted form of the whole document.
    pub fn to_html(&self) -> String {
        persist::render_fragment(&self.runs())
    }

    // ---------------------------------------------------------------------
    // User edits
    // ---------------------------------------------------------------------

    pub(crate) fn check_range(&self, range: &Range<usize>) -> Result<()> {
        let text = self.text();
        let valid = range.start <= range.end
            && range.end <= text.len()
            && text.is_char_boundary(range.start)
            && text.is_char_boundary(range.end);
        if valid {
            Ok(())
        } else {
            Err(UnilinkError::InvalidRange {
                start: range.start,
                end: range.end,
                len: text.len(),
            })
        }
    }

    pub fn insert_text(&self, index: usize, chunk: &str) -> Result<()> {
        self.check_range(&(index..index))?;
        self.edit(Origin::USER, |txn, text| {
            let attrs = inherited_attrs(&*txn, text, index);
            text.insert_with_attributes(txn, index as u32, chunk, attrs);
        });
        Ok(())
    }

    pub fn push_text(&self, chunk: &str) -> Result<()> {
        self.insert_text(self.len(), chunk)
    }

    pub fn delete_range(&self, range: Range<usize>) -> Result<()> {
        self.check_range(&range)?;
        if range.is_empty() {
            return Ok(());
        }
        self.edit(Origin::USER, |txn, text| {
            text.remove_range(txn, range.start as u32, (range.end - range.start) as u32);
        });
        Ok(())
    }

    /// Replace `range` with `chunk` in one transaction.
    pub fn replace_range(&self, range: Range<usize>, chunk: &str) -> Result<()> {
        self.check_range(&range)?;
        self.edit(Origin::USER, |txn, text| {
            if !range.is_empty() {
                text.remove_range(txn, range.start as u32, (range.end - range.start) as u32);
            }
            if !chunk.is_empty() {
                let attrs = inherited_attrs(&*txn, text, range.start);
                text.insert_with_attributes(txn, range.start as u32, chunk, attrs);
            }
        });
        Ok(())
    }

    pub fn set_content(&self, content: &str) {
        self.edit(Origin::USER, |txn, text| {
            let len = text.get_string(&*txn).len() as u32;
            if len > 0 {
                text.remove_range(txn, 0, len);
            }
            if !content.is_empty() {
                text.insert(txn, 0, content);
            }
        });
    }

    /// Replace the document with a persisted fragment. Pending annotations
    /// from the fragment are queued for resolution.
    pub fn load_html(&self, html: &str) -> Result<()> {
        let runs = persist::parse_fragment(html)?;
        self.edit(Origin::LOAD, |txn, text| {
            let len = text.get_string(&*txn).len() as u32;
            if len > 0 {
                text.remove_range(txn, 0, len);
            }
            let mut offset = 0u32;
            for run in &runs {
                let mut attrs = Attrs::new();
                for annotation in &run.annotations {
                    attrs.insert(
                        Arc::from(annotation.variant.spec().attribute_key()),
                        annotation.to_any(),
                    );
                }
                text.insert_with_attributes(txn, offset, &run.text, attrs);
                offset += run.text.len() as u32;
            }
        });
        crate::state_manager::enqueue_pending(self);
        Ok(())
    }
}

/// Marks the thread running a surface's dispatch loop; cleared on drop so an
/// observer panic does not leave the surface claimed.
struct DispatchOwner<'a>(&'a Mutex<Option<ThreadId>>);

impl<'a> DispatchOwner<'a> {
    fn claim(slot: &'a Mutex<Option<ThreadId>>, thread: ThreadId) -> Self {
        *slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(thread);
        DispatchOwner(slot)
    }
}

impl Drop for DispatchOwner<'_> {
    fn drop(&mut self) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

// -------------------------------------------------------------------------
// Scanning helpers shared with the synchronizer and the state manager
// -------------------------------------------------------------------------

fn chunk_str<D>(chunk: &Diff<D>) -> Option<&str> {
    match &chunk.insert {
        Out::Any(Any::String(s)) => Some(s.as_ref()),
        _ => None,
    }
}

/// Group the annotations stored under each variant's attribute by markId.
/// `only` restricts the scan to one variant.
pub(crate) fn scan_annotations<T: ReadTxn>(
    txn: &T,
    text: &TextRef,
    only: Option<&'static dyn VariantSpec>,
) -> Vec<AnnotatedSpan> {
    let specs: Vec<&'static dyn VariantSpec> = match only {
        Some(spec) => vec![spec],
        None => registry().to_vec(),
    };

    let mut spans: Vec<AnnotatedSpan> = Vec::new();
    let mut by_id: HashMap<(Variant, String), usize> = HashMap::new();
    let mut offset = 0usize;

    for chunk in text.diff(txn, YChange::identity) {
        let Some(content) = chunk_str(&chunk) else {
            continue;
        };
        let range = offset..offset + content.len();
        offset = range.end;

        let Some(attrs) = &chunk.attributes else {
            continue;
        };
        for spec in &specs {
            let Some(annotation) = attrs
                .get(spec.attribute_key())
                .and_then(LinkAnnotation::from_any)
            else {
                continue;
            };
            let id = (spec.variant(), annotation.mark_id.clone());
            match by_id.get(&id) {
                Some(&i) => {
                    let segments = &mut spans[i].segments;
                    match segments.last_mut() {
                        Some(last) if last.end == range.start => last.end = range.end,
                        _ => segments.push(range.clone()),
                    }
                }
                None => {
                    by_id.insert(id, spans.len());
                    spans.push(AnnotatedSpan {
                        annotation,
                        segments: vec![range.clone()],
                    });
                }
            }
        }
    }

    spans.sort_by_key(|s| s.range().start);
    spans
}

/// Annotation attributes for text typed at `index`: a mark carries over only
/// when `index` lies strictly inside one of its segments, so text typed at a
/// reference's edge never joins it.
pub(crate) fn inherited_attrs<T: ReadTxn>(txn: &T, text: &TextRef, index: usize) -> Attrs {
    let spans = scan_annotations(txn, text, None);
    let mut attrs = Attrs::new();
    for spec in registry() {
        let inside = spans.iter().find(|span| {
            span.variant() == spec.variant()
                && span
                    .segments
                    .iter()
                    .any(|seg| seg.start < index && index < seg.end)
        });
        attrs.insert(
            Arc::from(spec.attribute_key()),
            inside.map_or(Any::Null, |span| span.annotation.to_any()),
        );
    }
    attrs
}

/// Attribute map setting (or with `None`, clearing) one variant's annotation.
pub(crate) fn mark_attrs(spec: &dyn VariantSpec, annotation: Option<&LinkAnnotation>) -> Attrs {
    let mut attrs = Attrs::new();
    attrs.insert(
        Arc::from(spec.attribute_key()),
        annotation.map(LinkAnnotation::to_any).unwrap_or(Any::Null),
    );
    attrs
}

pub(crate) fn format_range(
    txn: &mut TransactionMut,
    text: &TextRef,
    range: &Range<usize>,
    attrs: Attrs,
) {
    if range.is_empty() {
        return;
    }
    text.format(txn, range.start as u32, (range.end - range.start) as u32, attrs);
}

impl EditorSurface {
    /// Fresh scan inside one write transaction; `rewrite` returns the
    /// replacement attributes for annotations it wants to change. Returns the
    /// number of annotations rewritten.
    pub(crate) fn rewrite_marks<F>(&self, origin: Origin, mut rewrite: F) -> usize
    where
        F: FnMut(&LinkAnnotation) -> Option<LinkAnnotation>,
    {
        self.edit_counted(origin, |txn, text| {
            let spans = scan_annotations(&*txn, text, None);
            let mut changed = 0;
            for span in spans {
                let Some(updated) = rewrite(&span.annotation) else {
                    continue;
                };
                if updated == span.annotation {
                    continue;
                }
                let spec = span.variant().spec();
                for segment in &span.segments {
                    format_range(txn, text, segment, mark_attrs(spec, Some(&updated)));
                }
                changed += 1;
            }
            changed
        })
    }
}
