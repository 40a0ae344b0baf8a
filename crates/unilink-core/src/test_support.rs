use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::error::SearchError;
use crate::search::{PageSearch, SearchCandidate};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn test_config() -> EngineConfig {
    EngineConfig::default()
}

pub fn engine_with<S: PageSearch + 'static>(search: S) -> Engine {
    Engine::new(test_config(), search).expect("default config is valid")
}

#[derive(Default)]
struct StaticInner {
    results: Mutex<Vec<SearchCandidate>>,
    queries: Mutex<Vec<String>>,
    delay: Mutex<Option<Duration>>,
}

/// Returns the same candidates for every query and records the queries.
/// Clones share state.
#[derive(Clone, Default)]
pub struct StaticSearch {
    inner: Arc<StaticInner>,
}

impl StaticSearch {
    pub fn new(results: Vec<SearchCandidate>) -> Self {
        let search = Self::default();
        search.set_results(results);
        search
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        *self.inner.delay.lock().unwrap() = Some(delay);
        self
    }

    pub fn set_results(&self, results: Vec<SearchCandidate>) {
        *self.inner.results.lock().unwrap() = results;
    }

    pub fn calls(&self) -> usize {
        self.inner.queries.lock().unwrap().len()
    }

    pub fn queries(&self) -> Vec<String> {
        self.inner.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl PageSearch for StaticSearch {
    async fn search(&self, query: &str) -> Result<Vec<SearchCandidate>, SearchError> {
        self.inner.queries.lock().unwrap().push(query.to_string());
        let delay = *self.inner.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.inner.results.lock().unwrap().clone())
    }
}

/// Fails the first `failures` calls, then behaves like [`StaticSearch`].
#[derive(Clone)]
pub struct FlakySearch {
    failures: usize,
    calls: Arc<AtomicUsize>,
    results: Vec<SearchCandidate>,
}

impl FlakySearch {
    pub fn failing(failures: usize, results: Vec<SearchCandidate>) -> Self {
        Self {
            failures,
            calls: Arc::new(AtomicUsize::new(0)),
            results,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageSearch for FlakySearch {
    async fn search(&self, _query: &str) -> Result<Vec<SearchCandidate>, SearchError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(SearchError::new(format!("backend unavailable (call {})", call + 1)))
        } else {
            Ok(self.results.clone())
        }
    }
}
