use crate::link_parser::is_external;
use crate::normalize::normalize;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use yrs::Any;

/// Syntax family of a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    Bracket,
    Tag,
}

impl Variant {
    pub const ALL: [Variant; 2] = [Variant::Bracket, Variant::Tag];

    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Bracket => "bracket",
            Variant::Tag => "tag",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bracket" => Some(Variant::Bracket),
            "tag" => Some(Variant::Tag),
            _ => None,
        }
    }

    /// CSS class identifying the variant in persisted markup.
    pub fn css_class(&self) -> String {
        format!("unilink--{}", self.as_str())
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolution state of a reference.
///
/// `Pending` moves to one of the other three. `Missing` and `Error` only leave
/// through an explicit refresh; `Exists` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Pending,
    Exists,
    Missing,
    Error,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Pending => "pending",
            LinkState::Exists => "exists",
            LinkState::Missing => "missing",
            LinkState::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(LinkState::Pending),
            "exists" => Some(LinkState::Exists),
            "missing" => Some(LinkState::Missing),
            "error" => Some(LinkState::Error),
            _ => None,
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attribute set of one reference in the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkAnnotation {
    pub variant: Variant,
    pub raw: String,
    pub text: String,
    pub key: String,
    pub page_id: Option<String>,
    pub href: String,
    pub state: LinkState,
    pub exists: bool,
    pub created: bool,
    pub mark_id: String,
}

pub const UNRESOLVED_HREF: &str = "#";

const VARIANT: &str = "variant";
const RAW: &str = "raw";
const TEXT: &str = "text";
const KEY: &str = "key";
const PAGE_ID: &str = "pageId";
const HREF: &str = "href";
const STATE: &str = "state";
const EXISTS: &str = "exists";
const CREATED: &str = "created";
const MARK_ID: &str = "markId";

impl LinkAnnotation {
    /// A fresh reference for `raw`: pending, or already resolved when `raw`
    /// is an external URL.
    pub fn pending(variant: Variant, raw: &str, mark_id: String) -> Self {
        let mut annotation = LinkAnnotation {
            variant,
            raw: raw.to_string(),
            text: display_text(variant, raw),
            key: normalize(raw),
            page_id: None,
            href: UNRESOLVED_HREF.to_string(),
            state: LinkState::Pending,
            exists: false,
            created: false,
            mark_id,
        };
        if is_external(raw) {
            annotation.state = LinkState::Exists;
            annotation.exists = true;
            annotation.href = raw.to_string();
        }
        annotation
    }

    pub fn is_external(&self) -> bool {
        is_external(&self.raw)
    }

    /// Re-establish the attribute invariants after fields were set
    /// independently (parsing, merging).
    pub fn normalized(mut self) -> Self {
        if self.text.is_empty() && !self.raw.is_empty() {
            self.text = display_text(self.variant, &self.raw);
        }
        if self.key.is_empty() {
            self.key = normalize(&self.raw);
        }
        self.exists = self.state == LinkState::Exists;
        if !self.exists {
            self.page_id = None;
        }
        if self.href.is_empty() {
            self.href = UNRESOLVED_HREF.to_string();
        }
        self
    }

    pub fn to_any(&self) -> Any {
        let mut map: HashMap<String, Any> = HashMap::new();
        map.insert(VARIANT.into(), any_str(self.variant.as_str()));
        map.insert(RAW.into(), any_str(&self.raw));
        map.insert(TEXT.into(), any_str(&self.text));
        map.insert(KEY.into(), any_str(&self.key));
        map.insert(
            PAGE_ID.into(),
            self.page_id.as_deref().map(any_str).unwrap_or(Any::Null),
        );
        map.insert(HREF.into(), any_str(&self.href));
        map.insert(STATE.into(), any_str(self.state.as_str()));
        map.insert(EXISTS.into(), Any::Bool(self.exists));
        map.insert(CREATED.into(), Any::Bool(self.created));
        map.insert(MARK_ID.into(), any_str(&self.mark_id));
        Any::Map(Arc::new(map))
    }

    /// Read an annotation back from a format attribute value. Returns `None`
    /// for values that are not annotation maps or carry no markId.
    pub fn from_any(value: &Any) -> Option<Self> {
        let Any::Map(map) = value else {
            return None;
        };
        let mark_id = str_field(map, MARK_ID)?.to_string();
        if mark_id.is_empty() {
            return None;
        }
        let variant = str_field(map, VARIANT)
            .and_then(Variant::parse)
            .unwrap_or(Variant::Bracket);
        let state = str_field(map, STATE)
            .and_then(LinkState::parse)
            .unwrap_or(LinkState::Pending);
        Some(LinkAnnotation {
            variant,
            raw: str_field(map, RAW).unwrap_or_default().to_string(),
            text: str_field(map, TEXT).unwrap_or_default().to_string(),
            key: str_field(map, KEY).unwrap_or_default().to_string(),
            page_id: str_field(map, PAGE_ID).map(str::to_string),
            href: str_field(map, HREF).unwrap_or(UNRESOLVED_HREF).to_string(),
            state,
            exists: bool_field(map, EXISTS).unwrap_or(false),
            created: bool_field(map, CREATED).unwrap_or(false),
            mark_id,
        })
    }
}

/// Partial attribute update applied by the state manager.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnotationPatch {
    pub state: Option<LinkState>,
    pub page_id: Option<Option<String>>,
    pub href: Option<String>,
    pub created: Option<bool>,
}

impl AnnotationPatch {
    pub fn resolved(page_id: impl Into<String>, href: impl Into<String>) -> Self {
        Self {
            state: Some(LinkState::Exists),
            page_id: Some(Some(page_id.into())),
            href: Some(href.into()),
            created: None,
        }
    }

    pub fn missing() -> Self {
        Self::unresolved(LinkState::Missing)
    }

    pub fn error() -> Self {
        Self::unresolved(LinkState::Error)
    }

    pub fn pending() -> Self {
        Self::unresolved(LinkState::Pending)
    }

    fn unresolved(state: LinkState) -> Self {
        Self {
            state: Some(state),
            page_id: Some(None),
            href: Some(UNRESOLVED_HREF.to_string()),
            created: None,
        }
    }

    pub fn with_created(mut self, created: bool) -> Self {
        self.created = Some(created);
        self
    }

    /// Merge into `target`. `exists` follows `state` whenever the patch sets
    /// a state, and a non-`exists` state never keeps a page id.
    pub fn apply(&self, target: &mut LinkAnnotation) {
        if let Some(page_id) = &self.page_id {
            target.page_id = page_id.clone();
        }
        if let Some(href) = &self.href {
            target.href = href.clone();
        }
        if let Some(created) = self.created {
            target.created = created;
        }
        if let Some(state) = self.state {
            target.state = state;
            target.exists = state == LinkState::Exists;
            if !target.exists {
                target.page_id = None;
            }
        }
    }
}

pub fn display_text(variant: Variant, raw: &str) -> String {
    match variant {
        Variant::Bracket => raw.to_string(),
        Variant::Tag => format!("#{}", raw),
    }
}

fn any_str(s: &str) -> Any {
    Any::String(Arc::from(s))
}

fn str_field<'a>(map: &'a HashMap<String, Any>, key: &str) -> Option<&'a str> {
    match map.get(key) {
        Some(Any::String(s)) => Some(s.as_ref()),
        _ => None,
    }
}

fn bool_field(map: &HashMap<String, Any>, key: &str) -> Option<bool> {
    match map.get(key) {
        Some(Any::Bool(b)) => Some(*b),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_bracket_defaults() {
        let a = LinkAnnotation::pending(Variant::Bracket, "Test_Page", "unilink-1-a".into());
        assert_eq!(a.text, "Test_Page");
        assert_eq!(a.key, "Test Page");
        assert_eq!(a.href, "#");
        assert_eq!(a.state, LinkState::Pending);
        assert!(!a.exists);
        assert!(!a.created);
        assert_eq!(a.page_id, None);
    }

    #[test]
    fn pending_tag_renders_with_hash() {
        let a = LinkAnnotation::pending(Variant::Tag, "rust", "unilink-1-b".into());
        assert_eq!(a.text, "#rust");
        assert_eq!(a.key, "rust");
    }

    #[test]
    fn external_raw_is_resolved_immediately() {
        let a = LinkAnnotation::pending(Variant::Bracket, "https://example.com/x", "m".into());
        assert_eq!(a.state, LinkState::Exists);
        assert!(a.exists);
        assert_eq!(a.href, "https://example.com/x");
        assert_eq!(a.page_id, None);
    }

    #[test]
    fn any_round_trip_keeps_every_field() {
        let mut a = LinkAnnotation::pending(Variant::Tag, "タグ", "unilink-abc-def".into());
        AnnotationPatch::resolved("p9", "/pages/p9")
            .with_created(true)
            .apply(&mut a);
        let back = LinkAnnotation::from_any(&a.to_any()).expect("annotation map");
        assert_eq!(back, a);
    }

    #[test]
    fn from_any_rejects_foreign_values() {
        assert!(LinkAnnotation::from_any(&Any::Bool(true)).is_none());
        let empty: HashMap<String, Any> = HashMap::new();
        assert!(LinkAnnotation::from_any(&Any::Map(Arc::new(empty))).is_none());
    }

    #[test]
    fn patch_derives_exists_from_state() {
        let mut a = LinkAnnotation::pending(Variant::Bracket, "A", "m".into());
        AnnotationPatch::resolved("p1", "/pages/p1").apply(&mut a);
        assert!(a.exists);
        assert_eq!(a.page_id.as_deref(), Some("p1"));

        AnnotationPatch::missing().apply(&mut a);
        assert!(!a.exists);
        assert_eq!(a.state, LinkState::Missing);
        assert_eq!(a.page_id, None);
        assert_eq!(a.href, "#");
    }

    #[test]
    fn patch_without_state_leaves_exists_alone() {
        let mut a = LinkAnnotation::pending(Variant::Bracket, "A", "m".into());
        AnnotationPatch::default().with_created(true).apply(&mut a);
        assert!(a.created);
        assert_eq!(a.state, LinkState::Pending);
        assert!(!a.exists);
    }

    #[test]
    fn normalized_repairs_inconsistent_fields() {
        let a = LinkAnnotation {
            variant: Variant::Bracket,
            raw: "Foo  Bar".into(),
            text: String::new(),
            key: String::new(),
            page_id: Some("stale".into()),
            href: String::new(),
            state: LinkState::Missing,
            exists: true,
            created: false,
            mark_id: "m".into(),
        }
        .normalized();
        assert_eq!(a.text, "Foo  Bar");
        assert_eq!(a.key, "Foo Bar");
        assert!(!a.exists);
        assert_eq!(a.page_id, None);
        assert_eq!(a.href, "#");
    }
}
