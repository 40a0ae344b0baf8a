use crate::error::SearchError;
use crate::normalize::normalize;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

/// A page returned by the search backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchCandidate {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
}

impl SearchCandidate {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            similarity: None,
        }
    }
}

/// A page created on behalf of a missing reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRecord {
    pub id: String,
    pub title: String,
}

/// Query side of the page store. Results are unordered; callers pick the
/// exact normalized-title match themselves.
#[async_trait]
pub trait PageSearch: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<SearchCandidate>, SearchError>;
}

/// Write side of the page store, used when the user creates a page from a
/// missing reference.
#[async_trait]
pub trait PageCreator: Send + Sync {
    async fn create_page(&self, title: &str) -> Result<PageRecord, SearchError>;
}

/// First candidate whose normalized title equals `key`, wherever it sits in
/// the result list.
pub fn exact_match<'a>(candidates: &'a [SearchCandidate], key: &str) -> Option<&'a SearchCandidate> {
    candidates.iter().find(|c| normalize(&c.title) == key)
}

/// In-memory page catalog keyed by page id.
///
/// Matches titles by normalized substring and scores exact matches above
/// prefix matches above other substrings. Used by the command-line tool and by
/// tests that want a realistic, partially matching backend.
#[derive(Default)]
pub struct InMemoryPages {
    pages: DashMap<String, String>,
    next_id: AtomicUsize,
    searches: AtomicUsize,
}

impl InMemoryPages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pages<I, K, V>(pages: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let catalog = Self::new();
        for (id, title) in pages {
            catalog.insert(id, title);
        }
        catalog
    }

    pub fn insert(&self, id: impl Into<String>, title: impl Into<String>) {
        self.pages.insert(id.into(), title.into());
    }

    pub fn remove(&self, id: &str) -> Option<String> {
        self.pages.remove(id).map(|(_, title)| title)
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Number of `search` calls served so far.
    pub fn search_count(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }

    fn score(title_key: &str, query_key: &str) -> Option<f32> {
        let title = title_key.to_lowercase();
        let query = query_key.to_lowercase();
        if title_key == query_key {
            Some(1.0)
        } else if title.starts_with(&query) {
            Some(0.8)
        } else if title.contains(&query) {
            Some(0.5)
        } else {
            None
        }
    }
}

#[async_trait]
impl PageSearch for InMemoryPages {
    async fn search(&self, query: &str) -> Result<Vec<SearchCandidate>, SearchError> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        let query_key = normalize(query);
        if query_key.is_empty() {
            return Ok(Vec::new());
        }
        let mut results: Vec<SearchCandidate> = self
            .pages
            .iter()
            .filter_map(|entry| {
                let score = Self::score(&normalize(entry.value()), &query_key)?;
                Some(SearchCandidate {
                    id: entry.key().clone(),
                    title: entry.value().clone(),
                    similarity: Some(score),
                })
            })
            .collect();
        results.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(results)
    }
}

#[async_trait]
impl PageCreator for InMemoryPages {
    async fn create_page(&self, title: &str) -> Result<PageRecord, SearchError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(SearchError::new("page title must not be empty"));
        }
        let id = loop {
            let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            let candidate = format!("page-{}", n);
            if !self.pages.contains_key(&candidate) {
                break candidate;
            }
        };
        self.pages.insert(id.clone(), title.to_string());
        Ok(PageRecord {
            id,
            title: title.to_string(),
        })
    }
}
