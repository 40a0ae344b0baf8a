use anyhow::{Context, Result};
use colored::Colorize;
use serde::Serialize;
use std::sync::Arc;
use unilink_core::metrics::MetricsSummary;
use unilink_core::{
    EditorSurface, Engine, EngineConfig, InMemoryPages, LinkAnnotation, LinkState,
    PageEventChannel,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    Html,
}

/// How the input file is read into the surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// Plain text; the synchronizers annotate it.
    Text,
    /// A persisted fragment with `<a class="unilink">` elements.
    Fragment,
}

impl InputKind {
    pub fn detect(content: &str) -> Self {
        if content.contains("<a class=\"unilink") {
            InputKind::Fragment
        } else {
            InputKind::Text
        }
    }
}

#[derive(Serialize)]
struct JsonReport<'a> {
    text: String,
    annotations: Vec<&'a LinkAnnotation>,
    metrics: MetricsSummary,
}

/// Load `content` into a fresh surface and wait for every reference to settle.
pub async fn settle_surface(
    engine: &Engine,
    content: &str,
    kind: InputKind,
) -> Result<Arc<EditorSurface>> {
    let surface = match kind {
        InputKind::Fragment => engine
            .load_surface(content)
            .context("Failed to load persisted fragment")?,
        InputKind::Text => {
            let surface = engine.open_surface();
            surface.set_content(content);
            surface
        }
    };
    engine.settle().await;
    Ok(surface)
}

pub fn engine_for(config: EngineConfig, pages: InMemoryPages) -> Result<Engine> {
    Engine::from_parts(config, Arc::new(pages), PageEventChannel::default())
        .context("Failed to start resolution engine")
}

/// Execute the `resolve` tool.
pub async fn execute(
    content: &str,
    pages: InMemoryPages,
    config: EngineConfig,
    format: OutputFormat,
    color: bool,
) -> Result<String> {
    let engine = engine_for(config, pages)?;
    let surface = settle_surface(&engine, content, InputKind::detect(content)).await?;
    render(&engine, &surface, format, color)
}

pub fn render(
    engine: &Engine,
    surface: &EditorSurface,
    format: OutputFormat,
    color: bool,
) -> Result<String> {
    let spans = surface.annotations(None);
    match format {
        OutputFormat::Html => Ok(surface.to_html()),
        OutputFormat::Json => {
            let report = JsonReport {
                text: surface.text(),
                annotations: spans.iter().map(|s| &s.annotation).collect(),
                metrics: engine.metrics().summary(),
            };
            serde_json::to_string_pretty(&report).context("Failed to encode report")
        }
        OutputFormat::Text => {
            let mut output = String::new();
            if spans.is_empty() {
                output.push_str("No references found.\n");
            }
            for span in &spans {
                let a = &span.annotation;
                let target = a.page_id.as_deref().unwrap_or(a.href.as_str());
                output.push_str(&format!(
                    "{:<8} {:<8} {} -> {}\n",
                    a.variant.as_str(),
                    state_label(a.state, color),
                    a.text,
                    target
                ));
            }
            let summary = engine.metrics().summary();
            output.push_str(&format!(
                "\n{} resolved, {} missing, {} error(s), {} cache hit(s)\n",
                summary.resolved, summary.missing, summary.errors, summary.cache_hits
            ));
            Ok(output)
        }
    }
}

fn state_label(state: LinkState, color: bool) -> String {
    let label = format!("{:<8}", state.as_str());
    if !color {
        return label;
    }
    match state {
        LinkState::Exists => label.green().to_string(),
        LinkState::Missing => label.yellow().to_string(),
        LinkState::Error => label.red().to_string(),
        LinkState::Pending => label.dimmed().to_string(),
    }
}
