#[cfg(test)]
mod tests {
    use super::*;

    fn raws(spans: &[ReferenceSpan]) -> Vec<&str> {
        spans.iter().map(|s| s.raw.as_str()).collect()
    }

    // === bracket pattern ===

    #[test]
    fn finds_simple_bracket() {
        let spans = find_bracket_spans("See [Test Page] here");
        assert_eq!(raws(&spans), vec!["Test Page"]);
        assert_eq!(spans[0].start, 4);
        assert_eq!(spans[0].end, 15);
        assert_eq!(spans[0].variant, Variant::Bracket);
    }

    #[test]
    fn finds_multiple_brackets() {
        let spans = find_bracket_spans("[One] and [Two]");
        assert_eq!(raws(&spans), vec!["One", "Two"]);
    }

    #[test]
    fn empty_brackets_never_match() {
        assert!(find_bracket_spans("[]").is_empty());
        assert!(find_bracket_spans("a [] b").is_empty());
    }

    #[test]
    fn whitespace_only_brackets_never_match() {
        assert!(find_bracket_spans("[   ]").is_empty());
        assert!(find_bracket_spans("[\u{3000}]").is_empty());
    }

    #[test]
    fn incomplete_brackets_never_match() {
        assert!(find_bracket_spans("[Test Page").is_empty());
        assert!(find_bracket_spans("Test Page]").is_empty());
    }

    #[test]
    fn brackets_do_not_span_lines() {
        assert!(find_bracket_spans("[first\nsecond]").is_empty());
    }

    #[test]
    fn nested_brackets_resolve_to_innermost() {
        let spans = find_bracket_spans("[Outer [Inner] Text]");
        assert_eq!(raws(&spans), vec!["Inner"]);
        assert_eq!(spans[0].start, 7);
        assert_eq!(spans[0].end, 14);
    }

    #[test]
    fn byte_offsets_account_for_multibyte_text() {
        let text = "日本 [ページ]";
        let spans = find_bracket_spans(text);
        assert_eq!(raws(&spans), vec!["ページ"]);
        assert_eq!(&text[spans[0].start..spans[0].end], "[ページ]");
    }

    #[test]
    fn ignores_brackets_in_fenced_code() {
        let spans = find_bracket_spans("```\n[Code]\n```\nOutside [Real]");
        assert_eq!(raws(&spans), vec!["Real"]);
    }

    #[test]
    fn ignores_brackets_in_tilde_fence() {
        let spans = find_bracket_spans("~~~rust\n[Code]\n~~~\n[Real]");
        assert_eq!(raws(&spans), vec!["Real"]);
    }

    #[test]
    fn ignores_brackets_in_inline_code() {
        let spans = find_bracket_spans("See `[Fake]` but [Real]");
        assert_eq!(raws(&spans), vec!["Real"]);
    }

    #[test]
    fn ignores_brackets_overlapping_inline_code() {
        let spans = find_bracket_spans("[half `code] tail`");
        assert!(spans.is_empty());
    }

    // === tag pattern ===

    #[test]
    fn finds_tag_at_start_and_after_space() {
        let spans = find_tag_spans("#rust and #tokio");
        assert_eq!(raws(&spans), vec!["rust", "tokio"]);
        assert_eq!(spans[0].start, 0);
        assert_eq!(spans[0].end, 5);
        assert_eq!(spans[1].variant, Variant::Tag);
    }

    #[test]
    fn tag_requires_word_boundary_before_hash() {
        assert!(find_tag_spans("issue#42").is_empty());
        assert!(find_tag_spans("##double").is_empty());
    }

    #[test]
    fn space_after_hash_disqualifies() {
        assert!(find_tag_spans("# heading").is_empty());
        assert!(find_tag_spans("#").is_empty());
    }

    #[test]
    fn tag_terminated_by_punctuation() {
        let spans = find_tag_spans("see #rust, #go. (#zig)");
        assert_eq!(raws(&spans), vec!["rust", "go"]);
    }

    #[test]
    fn tag_terminated_by_cjk_punctuation() {
        let spans = find_tag_spans("#日本語、次");
        assert_eq!(raws(&spans), vec!["日本語"]);
    }

    #[test]
    fn tag_terminated_by_unicode_punctuation() {
        assert_eq!(raws(&find_tag_spans("#rust—great")), vec!["rust"]);
        assert_eq!(raws(&find_tag_spans("#rust… later")), vec!["rust"]);
        assert_eq!(raws(&find_tag_spans("#rust¿")), vec!["rust"]);
        assert_eq!(raws(&find_tag_spans("He said #rust” today")), vec!["rust"]);
        // The opening quote is not whitespace, same as `(#zig)`.
        assert!(find_tag_spans("He said “#rust” today").is_empty());
        assert_eq!(raws(&find_tag_spans("He said “ #rust” today")), vec!["rust"]);
    }

    #[test]
    fn tag_rejects_trailing_foreign_letters() {
        assert!(find_tag_spans("#café").is_empty());
        assert!(find_tag_spans("#naïve").is_empty());
    }

    #[test]
    fn tag_accepts_cjk_and_hangul() {
        let spans = find_tag_spans("#ひらがな #カタカナ #漢字 #한국어 #mixed漢字1");
        assert_eq!(raws(&spans), vec!["ひらがな", "カタカナ", "漢字", "한국어", "mixed漢字1"]);
    }

    #[test]
    fn tag_rejects_jamo_and_full_width_marks() {
        assert!(find_tag_spans("#ㄱ").is_empty());
        assert!(find_tag_spans("#！").is_empty());
    }

    #[test]
    fn tag_length_limit() {
        let fifty = "a".repeat(50);
        let spans = find_tag_spans(&format!("#{}", fifty));
        assert_eq!(raws(&spans), vec![fifty.as_str()]);

        let fifty_one = "a".repeat(51);
        assert!(find_tag_spans(&format!("#{}", fifty_one)).is_empty());
    }

    #[test]
    fn tag_scan_is_linear_on_adversarial_input() {
        let hostile = "#".repeat(20_000) + &"a".repeat(20_000);
        let started = std::time::Instant::now();
        let spans = find_tag_spans(&hostile);
        assert!(spans.is_empty());
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
    }

    #[test]
    fn tag_inside_bracket_belongs_to_bracket() {
        let text = "[C# #notes] #real";
        assert_eq!(raws(&find_tag_spans(text)), vec!["real"]);
        assert_eq!(raws(&find_bracket_spans(text)), vec!["C# #notes"]);
    }

    #[test]
    fn ignores_tags_in_code() {
        let spans = find_tag_spans("`#code` and\n```\n#fenced\n```\n#real");
        assert_eq!(raws(&spans), vec!["real"]);
    }

    // === external links ===

    #[test]
    fn detects_external_urls() {
        assert!(is_external("https://example.com"));
        assert!(is_external("http://example.com/a?b=c"));
        assert!(!is_external("ftp://example.com"));
        assert!(!is_external("see https://example.com"));
        assert!(!is_external("Test Page"));
    }

    // === registry ===

    #[test]
    fn registry_covers_every_variant_once() {
        let variants: Vec<Variant> = registry().iter().map(|spec| spec.variant()).collect();
        assert_eq!(variants, Variant::ALL.to_vec());
        for variant in Variant::ALL {
            assert_eq!(variant.spec().variant(), variant);
        }
    }

    #[test]
    fn attribute_keys_and_origins_are_distinct() {
        let bracket = Variant::Bracket.spec();
        let tag = Variant::Tag.spec();
        assert_ne!(bracket.attribute_key(), tag.attribute_key());
        assert_ne!(bracket.origin(), tag.origin());
    }

    #[test]
    fn extract_references_orders_by_position() {
        let refs = extract_references("#first [second] #third");
        let got: Vec<(Variant, &str)> = refs.iter().map(|r| (r.variant, r.raw.as_str())).collect();
        assert_eq!(
            got,
            vec![
                (Variant::Tag, "first"),
                (Variant::Bracket, "second"),
                (Variant::Tag, "third"),
            ]
        );
    }

    #[test]
    fn build_annotation_uses_variant_text() {
        let a = Variant::Tag.spec().build_annotation("rust", "m1".into());
        assert_eq!(a.text, "#rust");
        assert_eq!(a.variant, Variant::Tag);
        let b = Variant::Bracket.spec().build_annotation("Rust Book", "m2".into());
        assert_eq!(b.text, "Rust Book");
    }
}

use crate::annotation::{LinkAnnotation, Variant};
use crate::origin::Origin;
use regex::Regex;
use std::ops::Range;
use std::sync::LazyLock;

// Compile regex once, reuse across calls
static BRACKET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[([^\[\]\n]+)\]").unwrap()
});

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"#([A-Za-z0-9\x{3040}-\x{309F}\x{30A0}-\x{30FF}\x{4E00}-\x{9FAF}\x{AC00}-\x{D7AF}]{1,50})")
        .unwrap()
});

static EXTERNAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https?://").unwrap()
});

static FENCED_CODE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[^\n]*\n.*?```|~~~[^\n]*\n.*?~~~").unwrap()
});

static INLINE_CODE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"`[^`]*`").unwrap()
});

/// A delimiter-complete reference found in text.
///
/// `start..end` is the byte range of the whole reference including its
/// delimiters, e.g. `[Foo]` or `#foo`. `raw` is the text between them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceSpan {
    pub variant: Variant,
    pub start: usize,
    pub end: usize,
    pub raw: String,
}

impl ReferenceSpan {
    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }
}

/// Build a set of byte ranges that are inside code blocks or inline code.
fn build_excluded_ranges(text: &str) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    for m in FENCED_CODE_RE.find_iter(text) {
        ranges.push((m.start(), m.end()));
    }
    for m in INLINE_CODE_RE.find_iter(text) {
        ranges.push((m.start(), m.end()));
    }
    ranges
}

/// Returns true if `start..end` touches any excluded range.
fn overlaps_excluded(start: usize, end: usize, excluded: &[(usize, usize)]) -> bool {
    excluded.iter().any(|&(s, e)| start < e && end > s)
}

pub fn is_external(raw: &str) -> bool {
    EXTERNAL_RE.is_match(raw)
}

/// Find `[raw]` references outside code. Only innermost bracket-free spans
/// match, so `[Outer [Inner] Text]` yields `Inner`.
pub fn find_bracket_spans(text: &str) -> Vec<ReferenceSpan> {
    let excluded = build_excluded_ranges(text);
    bracket_spans_with(text, &excluded)
}

fn bracket_spans_with(text: &str, excluded: &[(usize, usize)]) -> Vec<ReferenceSpan> {
    let mut spans = Vec::new();
    for cap in BRACKET_RE.captures_iter(text) {
        let (Some(full), Some(inner)) = (cap.get(0), cap.get(1)) else {
            continue;
        };
        if overlaps_excluded(full.start(), full.end(), excluded) {
            continue;
        }
        if inner.as_str().trim().is_empty() {
            continue;
        }
        spans.push(ReferenceSpan {
            variant: Variant::Bracket,
            start: full.start(),
            end: full.end(),
            raw: inner.as_str().to_string(),
        });
    }
    spans
}

/// Find `#tag` references outside code and outside complete bracket spans.
pub fn find_tag_spans(text: &str) -> Vec<ReferenceSpan> {
    let mut excluded = build_excluded_ranges(text);
    let brackets = bracket_spans_with(text, &excluded);
    excluded.extend(brackets.iter().map(|s| (s.start, s.end)));

    let mut spans = Vec::new();
    for cap in TAG_RE.captures_iter(text) {
        let (Some(full), Some(inner)) = (cap.get(0), cap.get(1)) else {
            continue;
        };
        let boundary_before = text[..full.start()]
            .chars()
            .next_back()
            .map_or(true, char::is_whitespace);
        if !boundary_before {
            continue;
        }
        let boundary_after = text[full.end()..]
            .chars()
            .next()
            .map_or(true, is_tag_terminator);
        if !boundary_after {
            continue;
        }
        if overlaps_excluded(full.start(), full.end(), &excluded) {
            continue;
        }
        spans.push(ReferenceSpan {
            variant: Variant::Tag,
            start: full.start(),
            end: full.end(),
            raw: inner.as_str().to_string(),
        });
    }
    spans
}

/// Anything but a letter or digit ends a tag: whitespace and punctuation of
/// any script alike.
fn is_tag_terminator(c: char) -> bool {
    !c.is_alphanumeric()
}

/// Every reference of every registered variant, ordered by start offset.
pub fn extract_references(text: &str) -> Vec<ReferenceSpan> {
    let mut all: Vec<ReferenceSpan> = registry()
        .iter()
        .flat_map(|spec| spec.find_spans(text))
        .collect();
    all.sort_by_key(|s| s.start);
    all
}

// ---------------------------------------------------------------------------
// Variant registry
// ---------------------------------------------------------------------------

/// Per-variant behavior. Adding a delimiter style means adding an
/// implementation and a registry entry.
pub trait VariantSpec: Send + Sync {
    fn variant(&self) -> Variant;

    /// Format attribute under which this variant's annotations are stored.
    fn attribute_key(&self) -> &'static str;

    /// Origin token of this variant's synchronizer.
    fn origin(&self) -> Origin;

    /// Opening and closing delimiter used when wrapping a selection.
    fn delimiters(&self) -> (&'static str, &'static str);

    fn find_spans(&self, text: &str) -> Vec<ReferenceSpan>;

    fn build_annotation(&self, raw: &str, mark_id: String) -> LinkAnnotation {
        LinkAnnotation::pending(self.variant(), raw, mark_id)
    }
}

struct BracketSpec;

impl VariantSpec for BracketSpec {
    fn variant(&self) -> Variant {
        Variant::Bracket
    }

    fn attribute_key(&self) -> &'static str {
        "unilink_bracket"
    }

    fn origin(&self) -> Origin {
        Origin::BRACKET_SYNC
    }

    fn delimiters(&self) -> (&'static str, &'static str) {
        ("[", "]")
    }

    fn find_spans(&self, text: &str) -> Vec<ReferenceSpan> {
        find_bracket_spans(text)
    }
}

struct TagSpec;

impl VariantSpec for TagSpec {
    fn variant(&self) -> Variant {
        Variant::Tag
    }

    fn attribute_key(&self) -> &'static str {
        "unilink_tag"
    }

    fn origin(&self) -> Origin {
        Origin::TAG_SYNC
    }

    fn delimiters(&self) -> (&'static str, &'static str) {
        ("#", "")
    }

    fn find_spans(&self, text: &str) -> Vec<ReferenceSpan> {
        find_tag_spans(text)
    }
}

static REGISTRY: [&'static dyn VariantSpec; 2] = [&BracketSpec, &TagSpec];

pub fn registry() -> &'static [&'static dyn VariantSpec] {
    &REGISTRY
}

impl Variant {
    pub fn spec(&self) -> &'static dyn VariantSpec {
        match self {
            Variant::Bracket => REGISTRY[0],
            Variant::Tag => REGISTRY[1],
        }
    }
}
