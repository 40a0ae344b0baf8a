use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use unilink_core::{
    Engine, EngineConfig, InMemoryPages, LinkAction, LinkState, PageEventChannel, PageSearch,
    SearchCandidate, SearchError, Variant,
};

/// Search backend that can be switched between failing and healthy.
#[derive(Default)]
struct Switchable {
    down: AtomicBool,
    calls: AtomicUsize,
    pages: InMemoryPages,
}

#[async_trait]
impl PageSearch for Switchable {
    async fn search(&self, query: &str) -> Result<Vec<SearchCandidate>, SearchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(SearchError::new("connection refused"));
        }
        self.pages.search(query).await
    }
}

fn catalog(pages: &[(&str, &str)]) -> InMemoryPages {
    InMemoryPages::with_pages(pages.iter().map(|(id, title)| (*id, *title)))
}

fn engine(pages: InMemoryPages) -> Engine {
    Engine::new(EngineConfig::default(), pages).unwrap()
}

#[tokio::test(start_paused = true)]
async fn existing_page_resolves_to_exists() {
    let engine = engine(catalog(&[("p1", "Test Page")]));
    let surface = engine.open_surface();
    surface.push_text("See [Test Page] for details").unwrap();
    engine.settle().await;

    let annotation = surface.annotations(None)[0].annotation.clone();
    assert_eq!(annotation.state, LinkState::Exists);
    assert!(annotation.exists);
    assert_eq!(annotation.page_id.as_deref(), Some("p1"));
    assert_eq!(annotation.href, "/pages/p1");
    assert_eq!(engine.metrics().summary().resolved, 1);
}

#[tokio::test(start_paused = true)]
async fn absent_page_resolves_to_missing_then_reconciles() {
    let engine = engine(catalog(&[]));
    let surface = engine.open_surface();
    surface.push_text("Plan: [Nonexistent Page]").unwrap();
    engine.settle().await;

    let missing = surface.annotations(None)[0].annotation.clone();
    assert_eq!(missing.state, LinkState::Missing);
    assert!(!missing.exists);
    assert_eq!(missing.href, "#");
    assert_eq!(missing.page_id, None);

    let revision = surface.revision();
    engine.page_created("Nonexistent Page", "p2");
    let flipped = surface.annotations(None)[0].annotation.clone();
    assert_eq!(flipped.mark_id, missing.mark_id);
    assert_eq!(flipped.state, LinkState::Exists);
    assert_eq!(flipped.page_id.as_deref(), Some("p2"));
    assert_eq!(flipped.href, "/pages/p2");
    assert_eq!(surface.text(), "Plan: [Nonexistent Page]");
    assert_eq!(surface.revision(), revision + 1);
}

#[tokio::test(start_paused = true)]
async fn normalized_variants_share_one_page() {
    let engine = engine(catalog(&[("p1", "Test Page")]));
    let surface = engine.open_surface();
    surface
        .push_text("[Test  Page] [Test_Page] [  Test Page  ] #other")
        .unwrap();
    engine.settle().await;

    let spans = surface.annotations(Some(Variant::Bracket));
    assert_eq!(spans.len(), 3);
    for span in spans {
        assert_eq!(span.annotation.key, "Test Page");
        assert_eq!(span.annotation.page_id.as_deref(), Some("p1"));
    }
}

#[tokio::test(start_paused = true)]
async fn exact_title_wins_over_partial_matches() {
    let engine = engine(catalog(&[("guide", "Rust Lang Guide"), ("short", "Rust Lang")]));
    let surface = engine.open_surface();
    surface.push_text("[Rust Lang]").unwrap();
    engine.settle().await;
    assert_eq!(
        surface.annotations(None)[0].annotation.page_id.as_deref(),
        Some("short")
    );
}

#[tokio::test(start_paused = true)]
async fn second_reference_is_served_from_cache() {
    let search = Arc::new(Switchable::default());
    search.pages.insert("p1", "Cached");
    let engine = Engine::from_parts(
        EngineConfig::default(),
        search.clone(),
        PageEventChannel::default(),
    )
    .unwrap();
    let surface = engine.open_surface();

    surface.push_text("[Cached]").unwrap();
    engine.settle().await;
    surface.push_text(" #Cached").unwrap();
    engine.settle().await;

    assert_eq!(search.calls.load(Ordering::SeqCst), 1);
    let summary = engine.metrics().summary();
    assert_eq!(summary.cache_hits, 1);
    assert_eq!(summary.cache_misses, 1);
    assert!((summary.cache_hit_rate - 0.5).abs() < f64::EPSILON);
    for span in surface.annotations(None) {
        assert_eq!(span.annotation.state, LinkState::Exists);
    }
}

#[tokio::test(start_paused = true)]
async fn deleting_right_after_typing_leaves_nothing_behind() {
    let engine = engine(catalog(&[("p1", "Ephemeral")]));
    let surface = engine.open_surface();
    surface.push_text("[Ephemeral]").unwrap();
    surface.set_content("");
    engine.settle().await;

    assert!(surface.annotations(None).is_empty());
    assert_eq!(surface.text(), "");
    assert_eq!(engine.metrics().summary().resolved, 0);
}

#[tokio::test(start_paused = true)]
async fn closed_surface_drops_its_queued_work() {
    let engine = engine(catalog(&[("p1", "Closed")]));
    let surface = engine.open_surface();
    surface.push_text("[Closed]").unwrap();
    engine.close_surface(&surface);
    drop(surface);
    engine.settle().await;
    assert_eq!(engine.metrics().summary().resolved, 0);
}

#[tokio::test(start_paused = true)]
async fn failing_search_errors_then_recovers_on_refresh() {
    let search = Arc::new(Switchable::default());
    search.pages.insert("p7", "Flaky");
    search.down.store(true, Ordering::SeqCst);
    let engine = Engine::from_parts(
        EngineConfig::default(),
        search.clone(),
        PageEventChannel::default(),
    )
    .unwrap();
    let surface = engine.open_surface();
    surface.push_text("[Flaky]").unwrap();
    engine.settle().await;

    let mark = surface.annotations(None)[0].mark_id().to_string();
    assert_eq!(surface.find_mark(&mark).unwrap().annotation.state, LinkState::Error);
    assert_eq!(surface.activate(&mark), Some(LinkAction::Retry));
    assert_eq!(search.calls.load(Ordering::SeqCst), 3);

    search.down.store(false, Ordering::SeqCst);
    assert_eq!(surface.refresh_all(), 1);
    engine.settle().await;
    let annotation = surface.find_mark(&mark).unwrap().annotation;
    assert_eq!(annotation.state, LinkState::Exists);
    assert_eq!(annotation.page_id.as_deref(), Some("p7"));
}

#[tokio::test(start_paused = true)]
async fn page_created_in_another_tab_reaches_this_one() {
    let channel = PageEventChannel::default();
    let here = Engine::with_channel(EngineConfig::default(), catalog(&[]), channel.clone()).unwrap();
    let there = Engine::with_channel(EngineConfig::default(), catalog(&[]), channel).unwrap();
    assert!(here.start_cross_tab_sync());
    assert!(there.start_cross_tab_sync());

    let surface = here.open_surface();
    surface.push_text("[Shared Note] and #SharedNote").unwrap();
    here.settle().await;

    let other = there.open_surface();
    other.push_text("[Shared Note]").unwrap();
    there.settle().await;
    let pages = InMemoryPages::new();
    let mark = other.annotations(None)[0].mark_id().to_string();
    let record = there.create_page_from_mark(&other, &mark, &pages).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let spans = surface.annotations(None);
    assert_eq!(spans[0].annotation.state, LinkState::Exists);
    assert_eq!(spans[0].annotation.page_id.as_deref(), Some(record.id.as_str()));
    // A different key is untouched.
    assert_eq!(spans[1].annotation.state, LinkState::Missing);
}

#[tokio::test(start_paused = true)]
async fn persisted_fragment_survives_reload() {
    let engine = engine(catalog(&[("p1", "Home")]));
    let surface = engine.open_surface();
    surface.push_text("Go [Home] or [Away]").unwrap();
    engine.settle().await;

    let html = surface.to_html();
    assert!(html.contains(
        "<a class=\"unilink unilink--bracket\" href=\"/pages/p1\" data-variant=\"bracket\" \
         data-raw=\"Home\" data-text=\"Home\" data-key=\"Home\" data-page-id=\"p1\" \
         data-state=\"exists\" data-exists=\"true\""
    ));

    let reloaded = engine.load_surface(&html).unwrap();
    engine.settle().await;
    assert_eq!(reloaded.text(), surface.text());
    let before: Vec<_> = surface.annotations(None).into_iter().map(|s| s.annotation).collect();
    let after: Vec<_> = reloaded.annotations(None).into_iter().map(|s| s.annotation).collect();
    assert_eq!(before, after);
}

#[tokio::test(start_paused = true)]
async fn external_links_never_hit_search() {
    let search = Arc::new(Switchable::default());
    let engine = Engine::from_parts(
        EngineConfig::default(),
        search.clone(),
        PageEventChannel::default(),
    )
    .unwrap();
    let surface = engine.open_surface();
    surface.push_text("[https://example.com/docs]").unwrap();
    engine.settle().await;

    let annotation = surface.annotations(None)[0].annotation.clone();
    assert_eq!(annotation.state, LinkState::Exists);
    assert_eq!(annotation.href, "https://example.com/docs");
    assert_eq!(annotation.page_id, None);
    assert_eq!(search.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn stale_keys_are_rechecked_on_demand() {
    let search = Arc::new(Switchable::default());
    let engine = Engine::from_parts(
        EngineConfig::default(),
        search.clone(),
        PageEventChannel::default(),
    )
    .unwrap();
    let surface = engine.open_surface();
    surface.push_text("[Appears Later]").unwrap();
    engine.settle().await;
    assert_eq!(surface.annotations(None)[0].annotation.state, LinkState::Missing);

    search.pages.insert("p8", "Appears Later");
    assert_eq!(engine.coordinator().reconcile_stale_keys().await, 1);
    assert_eq!(
        surface.annotations(None)[0].annotation.page_id.as_deref(),
        Some("p8")
    );
}
