//! Persisted form of annotated text: plain text interleaved with
//! `<a class="unilink ...">` elements.

use crate::annotation::{display_text, LinkAnnotation, LinkState, Variant, UNRESOLVED_HREF};
use crate::error::{Result, UnilinkError};
use crate::normalize::normalize;
use crate::state_manager::generate_mark_id;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::collections::HashMap;

const ELEMENT: &str = "a";
const BASE_CLASS: &str = "unilink";
const FRAGMENT_ROOT: &str = "unilink-fragment";

/// A piece of document text together with the annotations covering it,
/// outermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextRun {
    pub text: String,
    pub annotations: Vec<LinkAnnotation>,
}

/// Attribute list of the element for `annotation`, in persisted order.
pub fn element_attributes(annotation: &LinkAnnotation) -> Vec<(&'static str, String)> {
    let mut attrs = vec![
        ("class", format!("{} {}", BASE_CLASS, annotation.variant.css_class())),
        ("href", annotation.href.clone()),
        ("data-variant", annotation.variant.as_str().to_string()),
        ("data-raw", annotation.raw.clone()),
        ("data-text", annotation.text.clone()),
        ("data-key", annotation.key.clone()),
    ];
    if let Some(page_id) = &annotation.page_id {
        attrs.push(("data-page-id", page_id.clone()));
    }
    attrs.push(("data-state", annotation.state.as_str().to_string()));
    attrs.push((
        "data-exists",
        if annotation.exists { "true" } else { "false" }.to_string(),
    ));
    if annotation.created {
        attrs.push(("data-created", "true".to_string()));
    }
    attrs.push(("data-mark-id", annotation.mark_id.clone()));
    attrs
}

fn start_tag(annotation: &LinkAnnotation) -> BytesStart<'static> {
    let mut start = BytesStart::new(ELEMENT);
    for (name, value) in element_attributes(annotation) {
        start.push_attribute((name, value.as_str()));
    }
    start
}

/// Render one annotation element around `inner`.
pub fn render_element(annotation: &LinkAnnotation, inner: &str) -> String {
    render_fragment(&[TextRun {
        text: inner.to_string(),
        annotations: vec![annotation.clone()],
    }])
}

/// Render runs, opening and closing elements only where the covering
/// annotation changes so a reference split across runs stays one element.
pub fn render_fragment(runs: &[TextRun]) -> String {
    let mut writer = Writer::new(Vec::new());
    let mut open: Vec<&LinkAnnotation> = Vec::new();

    for run in runs {
        let shared = open
            .iter()
            .zip(run.annotations.iter())
            .take_while(|(a, b)| a.mark_id == b.mark_id)
            .count();
        while open.len() > shared {
            open.pop();
            write(&mut writer, Event::End(BytesEnd::new(ELEMENT)));
        }
        for annotation in &run.annotations[shared..] {
            write(&mut writer, Event::Start(start_tag(annotation)));
            open.push(annotation);
        }
        write(&mut writer, Event::Text(BytesText::new(&run.text)));
    }
    while open.pop().is_some() {
        write(&mut writer, Event::End(BytesEnd::new(ELEMENT)));
    }

    String::from_utf8_lossy(&writer.into_inner()).into_owned()
}

fn write(writer: &mut Writer<Vec<u8>>, event: Event<'_>) {
    // Writing into a Vec cannot fail.
    let _ = writer.write_event(event);
}

/// Parse a single element produced by [`render_element`]. Returns the
/// annotation and its inner text.
pub fn parse_element(html: &str) -> Result<(LinkAnnotation, String)> {
    let runs = parse_fragment(html)?;
    let mut annotation = None;
    let mut inner = String::new();
    for run in runs {
        match (run.annotations.first(), &annotation) {
            (Some(found), None) => annotation = Some(found.clone()),
            (Some(found), Some(current)) if found.mark_id != current.mark_id => {
                return Err(UnilinkError::MalformedElement(
                    "more than one link element".to_string(),
                ));
            }
            (None, _) if !run.text.trim().is_empty() => {
                return Err(UnilinkError::MalformedElement(
                    "text outside the link element".to_string(),
                ));
            }
            _ => {}
        }
        inner.push_str(&run.text);
    }
    match annotation {
        Some(annotation) => Ok((annotation, inner)),
        None => Err(UnilinkError::MalformedElement("no link element found".to_string())),
    }
}

/// Parse persisted text into runs. Elements that are not unilink anchors
/// contribute their text only.
pub fn parse_fragment(html: &str) -> Result<Vec<TextRun>> {
    let wrapped = format!("<{root}>{html}</{root}>", root = FRAGMENT_ROOT);
    let mut reader = Reader::from_str(&wrapped);
    let mut stack: Vec<Option<LinkAnnotation>> = Vec::new();
    let mut runs: Vec<TextRun> = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(start) => {
                let annotation = if start.name().as_ref() == ELEMENT.as_bytes() {
                    annotation_from_start(&start)?
                } else {
                    None
                };
                stack.push(annotation);
            }
            Event::End(_) => {
                stack.pop();
            }
            Event::Empty(_) => {}
            Event::Text(text) => {
                let text = text.unescape()?.into_owned();
                push_text(&mut runs, text, &stack);
            }
            Event::CData(data) => {
                let text = String::from_utf8_lossy(&data.into_inner()).into_owned();
                push_text(&mut runs, text, &stack);
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(runs)
}

fn push_text(runs: &mut Vec<TextRun>, text: String, stack: &[Option<LinkAnnotation>]) {
    if text.is_empty() {
        return;
    }
    let annotations: Vec<LinkAnnotation> = stack.iter().flatten().cloned().collect();
    if let Some(last) = runs.last_mut() {
        if last.annotations == annotations {
            last.text.push_str(&text);
            return;
        }
    }
    runs.push(TextRun { text, annotations });
}

fn annotation_from_start(start: &BytesStart<'_>) -> Result<Option<LinkAnnotation>> {
    let mut attrs: HashMap<String, String> = HashMap::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| UnilinkError::MalformedElement(e.to_string()))?;
        let name = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        attrs.insert(name, value);
    }

    let is_unilink = attrs
        .get("class")
        .is_some_and(|class| class.split_whitespace().any(|c| c == BASE_CLASS))
        || attrs.contains_key("data-mark-id")
        || attrs.contains_key("data-variant");
    if !is_unilink {
        return Ok(None);
    }

    Ok(Some(annotation_from_attrs(&attrs)))
}

fn annotation_from_attrs(attrs: &HashMap<String, String>) -> LinkAnnotation {
    let get = |name: &str| attrs.get(name).map(String::as_str);
    let legacy_title = get("data-page-title");

    let variant = get("data-variant")
        .and_then(Variant::parse)
        .or_else(|| {
            get("class").and_then(|class| {
                Variant::ALL
                    .into_iter()
                    .find(|v| class.split_whitespace().any(|c| c == v.css_class()))
            })
        })
        .unwrap_or(Variant::Bracket);

    let raw = get("data-raw").or(legacy_title).unwrap_or_default().to_string();
    let text = get("data-text").or(legacy_title).unwrap_or_default().to_string();
    let key = match (get("data-key"), legacy_title) {
        (Some(key), _) => key.to_string(),
        (None, Some(title)) => title.to_lowercase(),
        (None, None) => normalize(&raw),
    };
    let state = get("data-state")
        .and_then(LinkState::parse)
        .unwrap_or(LinkState::Pending);
    let mark_id = get("data-mark-id")
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(generate_mark_id);

    let annotation = LinkAnnotation {
        variant,
        raw,
        text,
        key,
        page_id: get("data-page-id").map(str::to_string),
        href: get("href").unwrap_or(UNRESOLVED_HREF).to_string(),
        state,
        exists: get("data-exists") == Some("true"),
        created: get("data-created") == Some("true"),
        mark_id,
    };
    settle_parsed(annotation)
}

/// Parsed elements keep `exists` consistent with `state` but never drop
/// fields that were present in the markup.
fn settle_parsed(mut annotation: LinkAnnotation) -> LinkAnnotation {
    if annotation.text.is_empty() && !annotation.raw.is_empty() {
        annotation.text = display_text(annotation.variant, &annotation.raw);
    }
    annotation.exists = annotation.state == LinkState::Exists;
    annotation
}
