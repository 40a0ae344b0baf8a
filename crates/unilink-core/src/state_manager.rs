use crate::annotation::{AnnotationPatch, LinkAnnotation, LinkState, Variant};
use crate::origin::Origin;
use crate::resolver_queue::ResolverQueueItem;
use crate::surface::EditorSurface;

const MARK_ID_ALPHABET: [char; 36] = [
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r',
    's', 't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3', '4', '5', '6', '7', '8', '9',
];

/// `unilink-<base36 millis>-<8 random chars>`, unique within a document.
pub fn generate_mark_id() -> String {
    let millis = jiff::Timestamp::now().as_millisecond().max(0) as u64;
    format!(
        "unilink-{}-{}",
        base36(millis),
        nanoid::nanoid!(8, &MARK_ID_ALPHABET)
    )
}

fn base36(mut n: u64) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while n > 0 {
        digits.push(MARK_ID_ALPHABET[((n % 36) as usize + 26) % 36]);
        n /= 36;
    }
    digits.iter().rev().collect()
}

/// Location of an annotation found by state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkRef {
    pub mark_id: String,
    pub key: String,
    pub variant: Variant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    /// No annotation carries the markId any more.
    NotFound,
    /// The annotation exists but failed the caller's guard.
    Rejected,
}

/// Merge `patch` into every segment of the annotation carrying `mark_id`,
/// in one transaction. Returns `false` when the mark no longer exists.
pub fn update_mark_state(surface: &EditorSurface, mark_id: &str, patch: &AnnotationPatch) -> bool {
    update_mark_state_if(surface, mark_id, patch, |_| true) != UpdateOutcome::NotFound
}

/// Like [`update_mark_state`], but only while `guard` accepts the freshly
/// read annotation.
pub fn update_mark_state_if<G>(
    surface: &EditorSurface,
    mark_id: &str,
    patch: &AnnotationPatch,
    guard: G,
) -> UpdateOutcome
where
    G: Fn(&LinkAnnotation) -> bool,
{
    let mut outcome = UpdateOutcome::NotFound;
    surface.rewrite_marks(Origin::STATE, |current| {
        if current.mark_id != mark_id {
            return None;
        }
        if !guard(current) {
            outcome = UpdateOutcome::Rejected;
            return None;
        }
        outcome = UpdateOutcome::Updated;
        let mut updated = current.clone();
        patch.apply(&mut updated);
        Some(updated)
    });

    match outcome {
        UpdateOutcome::Updated => surface.index().forget_mark(mark_id),
        UpdateOutcome::NotFound => tracing::debug!("No mark {} on surface {:?}", mark_id, surface.id()),
        UpdateOutcome::Rejected => {}
    }
    outcome
}

pub fn find_marks_by_state(surface: &EditorSurface, state: LinkState) -> Vec<MarkRef> {
    surface
        .annotations(None)
        .into_iter()
        .filter(|span| span.annotation.state == state)
        .map(|span| MarkRef {
            mark_id: span.annotation.mark_id,
            key: span.annotation.key,
            variant: span.annotation.variant,
        })
        .collect()
}

/// Move every annotation that is not `exists` back to `pending`, in one
/// transaction, and queue it again.
pub fn refresh_all(surface: &EditorSurface) -> usize {
    let refreshed = refresh_where(surface, |_| true);
    tracing::info!("Refreshing {} reference(s)", refreshed);
    refreshed
}

/// [`refresh_all`] restricted to annotations with `key`.
pub fn refresh_key(surface: &EditorSurface, key: &str) -> usize {
    refresh_where(surface, |annotation| annotation.key == key)
}

fn refresh_where<P>(surface: &EditorSurface, select: P) -> usize
where
    P: Fn(&LinkAnnotation) -> bool,
{
    let mut refreshed = Vec::new();
    surface.rewrite_marks(Origin::STATE, |current| {
        if current.state == LinkState::Exists || !select(current) {
            return None;
        }
        let mut updated = current.clone();
        AnnotationPatch::pending().apply(&mut updated);
        refreshed.push(MarkRef {
            mark_id: current.mark_id.clone(),
            key: current.key.clone(),
            variant: current.variant,
        });
        Some(updated)
    });
    for mark in &refreshed {
        surface.index().forget_mark(&mark.mark_id);
        enqueue_mark(surface, mark);
    }
    refreshed.len()
}

/// Queue every annotation currently `pending`.
pub fn enqueue_pending(surface: &EditorSurface) -> usize {
    let pending = find_marks_by_state(surface, LinkState::Pending);
    for mark in &pending {
        enqueue_mark(surface, mark);
    }
    pending.len()
}

pub(crate) fn enqueue_mark(surface: &EditorSurface, mark: &MarkRef) {
    surface.resolver().enqueue(ResolverQueueItem::new(
        &mark.key,
        &mark.mark_id,
        mark.variant,
        surface.downgrade(),
    ));
}
