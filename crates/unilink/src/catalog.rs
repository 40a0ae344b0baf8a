use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use unilink_core::InMemoryPages;

/// Page catalog file:
///
/// ```toml
/// [[page]]
/// id = "p1"
/// title = "Test Page"
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct Catalog {
    #[serde(default, rename = "page")]
    pub pages: Vec<CatalogPage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogPage {
    pub id: String,
    pub title: String,
}

impl Catalog {
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid page catalog")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read page catalog {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("In page catalog {}", path.display()))
    }

    pub fn into_pages(self) -> InMemoryPages {
        let pages = InMemoryPages::with_pages(self.pages.into_iter().map(|p| (p.id, p.title)));
        tracing::debug!("Loaded {} catalog page(s)", pages.len());
        pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_pages() {
        let catalog = Catalog::parse(
            r#"
[[page]]
id = "p1"
title = "Test Page"

[[page]]
id = "p2"
title = "Other"
"#,
        )
        .unwrap();
        assert_eq!(catalog.pages.len(), 2);
        assert_eq!(catalog.into_pages().len(), 2);
    }

    #[test]
    fn empty_file_is_an_empty_catalog() {
        assert!(Catalog::parse("").unwrap().pages.is_empty());
    }

    #[test]
    fn missing_title_is_an_error() {
        assert!(Catalog::parse("[[page]]\nid = \"p1\"\n").is_err());
    }

    #[test]
    fn load_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");
        let err = Catalog::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("missing.toml"));

        let good = dir.path().join("pages.toml");
        let mut file = std::fs::File::create(&good).unwrap();
        writeln!(file, "[[page]]\nid = \"p1\"\ntitle = \"Home\"").unwrap();
        assert_eq!(Catalog::load(&good).unwrap().pages[0].title, "Home");
    }
}
