use super::resolve::{engine_for, InputKind};
use anyhow::{Context, Result};
use unilink_core::{EngineConfig, InMemoryPages};

/// Execute the `migrate` tool: convert delimiter syntax into created
/// references, resolve them against `pages`, and return the persisted form.
pub async fn execute(content: &str, pages: InMemoryPages, config: EngineConfig) -> Result<String> {
    let engine = engine_for(config, pages)?;
    let surface = match InputKind::detect(content) {
        InputKind::Fragment => engine
            .load_surface(content)
            .context("Failed to load persisted fragment")?,
        InputKind::Text => {
            let surface = engine.open_surface();
            surface.set_content(content);
            surface
        }
    };

    let migrated = surface.migrate_legacy_syntax();
    engine.settle().await;
    tracing::info!("Migrated {} reference(s)", migrated);
    Ok(surface.to_html())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn strips_brackets_and_marks_created() {
        let pages = InMemoryPages::with_pages([("p1", "Page One")]);
        let html = execute("old [Page One] and #legacy", pages, EngineConfig::default())
            .await
            .unwrap();

        assert!(html.starts_with("old <a class=\"unilink unilink--bracket\" href=\"/pages/p1\""));
        assert!(html.contains(">Page One</a>"), "{}", html);
        assert!(html.contains(">#legacy</a>"), "{}", html);
        assert_eq!(html.matches("data-created=\"true\"").count(), 2);
        assert!(!html.contains("[Page One]"));
    }

    #[tokio::test(start_paused = true)]
    async fn text_without_references_is_unchanged() {
        let html = execute("nothing `[here]`", InMemoryPages::new(), EngineConfig::default())
            .await
            .unwrap();
        assert_eq!(html, "nothing `[here]`");
    }
}
