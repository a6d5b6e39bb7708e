//! Integration tests for field-level resolution
//!
//! Covers priority ordering, fallback policies, caching, circuit breaking,
//! deadlines and cancellation through the public engine API.

mod common;

use common::{deadline, engine_with, payload, test_config, MockProvider, Reply};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use trove_common::events::EngineEvent;
use trove_meta::health::CircuitState;
use trove_meta::merger::{AttemptOutcome, Staleness};
use trove_meta::{
    EngineError, FallbackBehavior, ProviderDescriptor, ProviderError, ResolutionRequest,
    UnresolvedReason, Version,
};

const ALIEN: &str = "tt0078748";

fn v1() -> Version {
    Version::new(1, 0, 0)
}

fn tmdb() -> MockProvider {
    MockProvider::serving("tmdb", v1(), "movie", &["title", "poster_url"], 1)
}

fn fanart() -> MockProvider {
    MockProvider::serving("fanart", v1(), "movie", &["poster_url"], 2)
}

// ============================================================================
// Priority and fallback
// ============================================================================

#[tokio::test]
async fn test_lower_priority_provider_fills_empty_field() {
    let dir = tempfile::tempdir().unwrap();
    let tmdb = Arc::new(tmdb().with_payload(payload(&[
        ("title", json!("Alien")),
        ("poster_url", json!("")),
    ])));
    let fanart = Arc::new(
        fanart().with_payload(payload(&[("poster_url", json!("https://fanart.tv/alien.jpg"))])),
    );
    let engine = engine_with(test_config(dir.path()), &[tmdb.clone(), fanart.clone()]).await;

    let resolution = engine
        .resolve("movie", ALIEN, ["title", "poster_url"], deadline(5))
        .await;

    let title = resolution.field("title").unwrap();
    assert_eq!(title.value, Some(json!("Alien")));
    assert_eq!(title.provider.as_deref(), Some("tmdb"));

    let poster = resolution.field("poster_url").unwrap();
    assert_eq!(poster.value, Some(json!("https://fanart.tv/alien.jpg")));
    assert_eq!(poster.provider.as_deref(), Some("fanart"));
    assert_eq!(poster.attempts.len(), 2);
    assert_eq!(poster.attempts[0].provider, "tmdb");
    assert_eq!(poster.attempts[0].outcome, AttemptOutcome::Empty);
    assert_eq!(poster.attempts[1].outcome, AttemptOutcome::Success);
}

#[tokio::test]
async fn test_stop_policy_leaves_field_unresolved() {
    let dir = tempfile::tempdir().unwrap();
    let tmdb = Arc::new(tmdb().replying(Reply::Fail(ProviderError::Network(
        "connection reset".to_string(),
    ))));
    let fanart = Arc::new(
        fanart().with_payload(payload(&[("poster_url", json!("https://fanart.tv/alien.jpg"))])),
    );
    let engine = engine_with(test_config(dir.path()), &[tmdb.clone(), fanart.clone()]).await;

    engine
        .set_priority("movie", "poster_url", "tmdb", 1, FallbackBehavior::Stop)
        .await
        .unwrap();

    let resolution = engine.resolve("movie", ALIEN, ["poster_url"], deadline(5)).await;
    let poster = resolution.field("poster_url").unwrap();

    assert_eq!(poster.unresolved_reason(), Some(UnresolvedReason::Stopped));
    assert_eq!(fanart.calls(), 0, "walk must not continue past a stop policy");
    assert!(matches!(
        poster.attempts[0].outcome,
        AttemptOutcome::Failed { .. }
    ));
}

#[tokio::test]
async fn test_equal_priorities_order_by_provider_name() {
    let dir = tempfile::tempdir().unwrap();
    let beta = Arc::new(
        MockProvider::serving("beta", v1(), "book", &["title"], 1)
            .with_payload(payload(&[("title", json!("from beta"))])),
    );
    let alpha = Arc::new(
        MockProvider::serving("alpha", v1(), "book", &["title"], 1)
            .with_payload(payload(&[("title", json!("from alpha"))])),
    );
    let engine = engine_with(test_config(dir.path()), &[beta, alpha]).await;

    let order: Vec<String> = engine
        .candidates("book", "title")
        .unwrap()
        .into_iter()
        .map(|c| c.provider)
        .collect();
    assert_eq!(order, vec!["alpha", "beta"]);

    for _ in 0..5 {
        engine.refresh("isbn:9780441013593");
        let resolution = engine
            .resolve("book", "isbn:9780441013593", ["title"], deadline(5))
            .await;
        assert_eq!(resolution.value("title"), Some(&json!("from alpha")));
    }
}

#[tokio::test(start_paused = true)]
async fn test_retry_policy_reinvokes_same_provider() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.failure_threshold = 5;

    let tmdb = Arc::new(tmdb().with_payload(payload(&[("title", json!("Alien"))])));
    tmdb.push_reply(Reply::Fail(ProviderError::Network("timeout".to_string())));
    let engine = engine_with(config, &[tmdb.clone()]).await;

    engine
        .set_priority(
            "movie",
            "title",
            "tmdb",
            1,
            FallbackBehavior::Retry {
                attempts: 2,
                backoff_ms: 500,
            },
        )
        .await
        .unwrap();

    let resolution = engine.resolve("movie", ALIEN, ["title"], deadline(5)).await;
    let title = resolution.field("title").unwrap();

    assert_eq!(title.value, Some(json!("Alien")));
    assert_eq!(tmdb.calls(), 2);
    assert!(matches!(title.attempts[0].outcome, AttemptOutcome::Failed { .. }));
    assert_eq!(title.attempts[1].outcome, AttemptOutcome::Success);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_move_to_next_candidate() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.failure_threshold = 10;

    let tmdb = Arc::new(tmdb().replying(Reply::Fail(ProviderError::InvalidResponse(
        "truncated JSON".to_string(),
    ))));
    let fanart = Arc::new(
        fanart().with_payload(payload(&[("poster_url", json!("https://fanart.tv/alien.jpg"))])),
    );
    let engine = engine_with(config, &[tmdb.clone(), fanart.clone()]).await;

    engine
        .set_priority(
            "movie",
            "poster_url",
            "tmdb",
            1,
            FallbackBehavior::Retry {
                attempts: 2,
                backoff_ms: 100,
            },
        )
        .await
        .unwrap();

    let resolution = engine.resolve("movie", ALIEN, ["poster_url"], deadline(5)).await;
    let poster = resolution.field("poster_url").unwrap();

    assert_eq!(poster.provider.as_deref(), Some("fanart"));
    assert_eq!(tmdb.calls(), 3, "one call plus two retries");
    assert_eq!(poster.attempts.len(), 4);
}

#[tokio::test]
async fn test_not_found_is_not_a_health_failure() {
    let dir = tempfile::tempdir().unwrap();
    let tmdb = Arc::new(tmdb().replying(Reply::Fail(ProviderError::NotFound)));
    let fanart = Arc::new(
        fanart().with_payload(payload(&[("poster_url", json!("https://fanart.tv/alien.jpg"))])),
    );
    let engine = engine_with(test_config(dir.path()), &[tmdb, fanart]).await;

    for _ in 0..3 {
        engine.refresh(ALIEN);
        let resolution = engine.resolve("movie", ALIEN, ["poster_url"], deadline(5)).await;
        assert_eq!(resolution.field("poster_url").unwrap().provider.as_deref(), Some("fanart"));
    }

    let health = engine.health("tmdb").unwrap();
    assert_eq!(health.failures, 0);
    assert_eq!(health.state, CircuitState::Closed);
}

#[tokio::test]
async fn test_disabled_provider_is_not_a_candidate() {
    let dir = tempfile::tempdir().unwrap();
    let tmdb = Arc::new(tmdb().with_payload(payload(&[("poster_url", json!("https://tmdb/alien.jpg"))])));
    let fanart = Arc::new(
        fanart().with_payload(payload(&[("poster_url", json!("https://fanart.tv/alien.jpg"))])),
    );
    let engine = engine_with(test_config(dir.path()), &[tmdb.clone(), fanart]).await;

    engine.disable("tmdb").await.unwrap();

    let resolution = engine.resolve("movie", ALIEN, ["poster_url", "title"], deadline(5)).await;
    assert_eq!(resolution.field("poster_url").unwrap().provider.as_deref(), Some("fanart"));
    assert_eq!(
        resolution.field("title").unwrap().unresolved_reason(),
        Some(UnresolvedReason::NoProviderAvailable)
    );
    assert_eq!(tmdb.calls(), 0);
}

#[tokio::test]
async fn test_unknown_field_has_no_candidates() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with(test_config(dir.path()), &[Arc::new(tmdb())]).await;

    let err = engine.candidates("movie", "runtime").unwrap_err();
    assert!(matches!(err, EngineError::NoProviderAvailable { .. }));

    let resolution = engine.resolve("movie", ALIEN, ["runtime"], deadline(5)).await;
    assert_eq!(
        resolution.field("runtime").unwrap().unresolved_reason(),
        Some(UnresolvedReason::NoProviderAvailable)
    );
}

#[tokio::test]
async fn test_empty_field_list_resolves_to_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let tmdb = Arc::new(tmdb());
    let engine = engine_with(test_config(dir.path()), &[tmdb.clone()]).await;

    let resolution = engine
        .resolve("movie", ALIEN, Vec::<String>::new(), deadline(5))
        .await;
    assert!(resolution.fields.is_empty());
    assert_eq!(tmdb.calls(), 0);
}

// ============================================================================
// Caching
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_cached_value_expires_after_provider_ttl() {
    let dir = tempfile::tempdir().unwrap();
    let tmdb = Arc::new(
        MockProvider::new(
            ProviderDescriptor::new("tmdb", v1())
                .with_capability(trove_meta::Capability::new("movie", ["title"], 1))
                .with_cache_ttl(Duration::from_secs(60)),
        )
        .with_payload(payload(&[("title", json!("Alien"))])),
    );
    let engine = engine_with(test_config(dir.path()), &[tmdb.clone()]).await;

    let first = engine.resolve("movie", ALIEN, ["title"], deadline(5)).await;
    assert_eq!(first.field("title").unwrap().staleness, Some(Staleness::Fresh));

    tokio::time::advance(Duration::from_secs(30)).await;
    let second = engine.resolve("movie", ALIEN, ["title"], deadline(5)).await;
    assert!(matches!(
        second.field("title").unwrap().staleness,
        Some(Staleness::Cached { .. })
    ));
    assert_eq!(tmdb.calls(), 1);

    tokio::time::advance(Duration::from_secs(31)).await;
    let third = engine.resolve("movie", ALIEN, ["title"], deadline(5)).await;
    assert_eq!(third.field("title").unwrap().staleness, Some(Staleness::Fresh));
    assert_eq!(tmdb.calls(), 2);
}

#[tokio::test]
async fn test_empty_answer_is_cached_within_ttl() {
    let dir = tempfile::tempdir().unwrap();
    let tmdb = Arc::new(tmdb().with_payload(payload(&[
        ("title", json!("Alien")),
        ("poster_url", json!("")),
    ])));
    let fanart = Arc::new(
        fanart().with_payload(payload(&[("poster_url", json!("https://fanart.tv/alien.jpg"))])),
    );
    let engine = engine_with(test_config(dir.path()), &[tmdb.clone(), fanart.clone()]).await;

    let first = engine.resolve("movie", ALIEN, ["poster_url"], deadline(5)).await;
    assert_eq!(first.value("poster_url"), Some(&json!("https://fanart.tv/alien.jpg")));

    let second = engine.resolve("movie", ALIEN, ["poster_url"], deadline(5)).await;
    let poster = second.field("poster_url").unwrap();
    assert_eq!(poster.value, Some(json!("https://fanart.tv/alien.jpg")));
    assert_eq!(poster.attempts[0].provider, "tmdb");
    assert_eq!(poster.attempts[0].outcome, AttemptOutcome::Empty);
    assert_eq!(poster.attempts[1].outcome, AttemptOutcome::CacheHit);
    assert_eq!(tmdb.calls(), 1);
    assert_eq!(fanart.calls(), 1);

    // Other fields of the same payload come from the cached answer too
    let title = engine.resolve("movie", ALIEN, ["title"], deadline(5)).await;
    assert!(matches!(
        title.field("title").unwrap().staleness,
        Some(Staleness::Cached { .. })
    ));
    assert_eq!(tmdb.calls(), 1);
}

#[tokio::test]
async fn test_cached_empty_answer_honours_stop_policy() {
    let dir = tempfile::tempdir().unwrap();
    let tmdb = Arc::new(tmdb().with_payload(payload(&[("title", json!("Alien"))])));
    let fanart = Arc::new(
        fanart().with_payload(payload(&[("poster_url", json!("https://fanart.tv/alien.jpg"))])),
    );
    let engine = engine_with(test_config(dir.path()), &[tmdb.clone(), fanart.clone()]).await;
    engine
        .set_priority("movie", "poster_url", "tmdb", 1, FallbackBehavior::Stop)
        .await
        .unwrap();

    for _ in 0..2 {
        let resolution = engine.resolve("movie", ALIEN, ["poster_url"], deadline(5)).await;
        assert_eq!(
            resolution.field("poster_url").unwrap().unresolved_reason(),
            Some(UnresolvedReason::Stopped)
        );
    }
    assert_eq!(tmdb.calls(), 1);
    assert_eq!(fanart.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stale_value_served_while_refreshing() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.stale_while_revalidate = true;
    config.default_cache_ttl_secs = 10;

    let tmdb = Arc::new(
        MockProvider::serving("tmdb", v1(), "movie", &["title"], 1)
            .with_payload(payload(&[("title", json!("Alien"))])),
    );
    let engine = engine_with(config, &[tmdb.clone()]).await;

    engine.resolve("movie", ALIEN, ["title"], deadline(5)).await;
    tmdb.set_reply(Reply::Payload(payload(&[("title", json!("Alien (Director's Cut)"))])));

    tokio::time::advance(Duration::from_secs(11)).await;
    let stale = engine.resolve("movie", ALIEN, ["title"], deadline(5)).await;
    let title = stale.field("title").unwrap();
    assert_eq!(title.value, Some(json!("Alien")));
    assert!(matches!(title.staleness, Some(Staleness::Stale { .. })));

    // Let the background refresh land
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(tmdb.calls(), 2);

    let refreshed = engine.resolve("movie", ALIEN, ["title"], deadline(5)).await;
    let title = refreshed.field("title").unwrap();
    assert_eq!(title.value, Some(json!("Alien (Director's Cut)")));
    assert!(matches!(title.staleness, Some(Staleness::Cached { .. })));
}

#[tokio::test]
async fn test_refresh_drops_cached_query() {
    let dir = tempfile::tempdir().unwrap();
    let tmdb = Arc::new(tmdb().with_payload(payload(&[
        ("title", json!("Alien")),
        ("poster_url", json!("https://tmdb/alien.jpg")),
    ])));
    let engine = engine_with(test_config(dir.path()), &[tmdb.clone()]).await;

    engine.resolve("movie", ALIEN, ["title"], deadline(5)).await;
    engine.resolve("movie", ALIEN, ["title"], deadline(5)).await;
    assert_eq!(tmdb.calls(), 1);

    let mut rx = engine.subscribe();
    let dropped = engine.refresh(ALIEN);
    assert!(dropped >= 2, "field entries plus whole payload, got {}", dropped);

    match rx.try_recv().unwrap() {
        EngineEvent::CacheInvalidated { query, entries, .. } => {
            assert_eq!(query, ALIEN);
            assert_eq!(entries, dropped);
        }
        other => panic!("unexpected event {:?}", other),
    }

    engine.resolve("movie", ALIEN, ["title"], deadline(5)).await;
    assert_eq!(tmdb.calls(), 2);
}

// ============================================================================
// Health, deadlines and cancellation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_open_circuit_skips_provider_until_cooldown() {
    let dir = tempfile::tempdir().unwrap();
    let tmdb = Arc::new(
        MockProvider::serving("tmdb", v1(), "movie", &["title"], 1)
            .replying(Reply::Fail(ProviderError::Network("503".to_string()))),
    );
    let engine = engine_with(test_config(dir.path()), &[tmdb.clone()]).await;

    for _ in 0..2 {
        let resolution = engine.resolve("movie", ALIEN, ["title"], deadline(5)).await;
        assert_eq!(
            resolution.field("title").unwrap().unresolved_reason(),
            Some(UnresolvedReason::Exhausted)
        );
    }
    assert_eq!(engine.health("tmdb").unwrap().state, CircuitState::Open);

    let resolution = engine.resolve("movie", ALIEN, ["title"], deadline(5)).await;
    assert_eq!(
        resolution.field("title").unwrap().unresolved_reason(),
        Some(UnresolvedReason::NoProviderAvailable)
    );
    assert_eq!(tmdb.calls(), 2);

    tokio::time::advance(Duration::from_secs(31)).await;
    assert_eq!(engine.health("tmdb").unwrap().state, CircuitState::HalfOpen);

    tmdb.set_reply(Reply::Payload(payload(&[("title", json!("Alien"))])));
    let resolution = engine.resolve("movie", ALIEN, ["title"], deadline(5)).await;
    assert_eq!(resolution.value("title"), Some(&json!("Alien")));
    assert_eq!(engine.health("tmdb").unwrap().state, CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_marks_field_timed_out() {
    let dir = tempfile::tempdir().unwrap();
    let tmdb = Arc::new(tmdb().replying(Reply::Delayed(
        Duration::from_secs(10),
        Box::new(Reply::Payload(payload(&[("poster_url", json!("late"))]))),
    )));
    let fanart = Arc::new(
        fanart().with_payload(payload(&[("poster_url", json!("https://fanart.tv/alien.jpg"))])),
    );
    let engine = engine_with(test_config(dir.path()), &[tmdb, fanart.clone()]).await;

    let resolution = engine.resolve("movie", ALIEN, ["poster_url"], deadline(1)).await;
    let poster = resolution.field("poster_url").unwrap();

    assert_eq!(poster.unresolved_reason(), Some(UnresolvedReason::Timeout));
    assert_eq!(fanart.calls(), 0);
    assert_eq!(engine.health("tmdb").unwrap().failures, 1);
}

#[tokio::test(start_paused = true)]
async fn test_slow_field_does_not_hold_up_others() {
    let dir = tempfile::tempdir().unwrap();
    let omdb = Arc::new(
        MockProvider::serving("omdb", v1(), "movie", &["title"], 1)
            .with_payload(payload(&[("title", json!("Alien"))])),
    );
    let tmdb = Arc::new(
        MockProvider::serving("tmdb", v1(), "movie", &["poster_url"], 1).replying(Reply::Delayed(
            Duration::from_secs(30),
            Box::new(Reply::Payload(payload(&[("poster_url", json!("late"))]))),
        )),
    );
    let engine = engine_with(test_config(dir.path()), &[omdb.clone(), tmdb]).await;

    let resolution = engine
        .resolve("movie", ALIEN, ["title", "poster_url"], deadline(2))
        .await;

    let title = resolution.field("title").unwrap();
    assert_eq!(title.value, Some(json!("Alien")));
    assert_eq!(title.staleness, Some(Staleness::Fresh));
    assert_eq!(title.attempts[0].outcome, AttemptOutcome::Success);
    assert_eq!(
        resolution.field("poster_url").unwrap().unresolved_reason(),
        Some(UnresolvedReason::Timeout)
    );
    assert_eq!(omdb.calls(), 1);
}

#[tokio::test]
async fn test_cancelled_request_resolves_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let tmdb = Arc::new(tmdb().with_payload(payload(&[("title", json!("Alien"))])));
    let engine = engine_with(test_config(dir.path()), &[tmdb.clone()]).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let request = ResolutionRequest::new("movie", ALIEN, ["title", "poster_url"], deadline(5))
        .with_cancel(cancel);

    let resolution = engine.resolve_request(&request).await;
    assert_eq!(resolution.request_id, request.request_id);
    for result in resolution.fields.values() {
        assert_eq!(result.unresolved_reason(), Some(UnresolvedReason::Cancelled));
    }
    assert_eq!(tmdb.calls(), 0);
}
