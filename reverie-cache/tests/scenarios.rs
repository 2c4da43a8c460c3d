//! End-to-end behaviour of the tiered cache.

use std::sync::Arc;
use std::time::Duration;

use reverie_cache::{ClearScope, FetchSource, TieredCache};
use reverie_core::{
    Artifact, GenerationError, GovernorState, KeyDeriver, ReverieError, SPEECH_NAMESPACE,
};
use reverie_storage::RemoteWriteOutcome;
use reverie_test_utils::assertions::{
    assert_generation_error, assert_quota_exceeded, assert_rate_limited,
};
use reverie_test_utils::fixtures::{breathe_deeply, pre_game_request, test_clock, test_config, unspaced_limits};
use reverie_test_utils::{
    CanonicalKeyDeriver, Clock, FailingRemoteStore, InMemoryQuotaStore, InMemoryRemoteStore,
    MockPersonalizer, MockSynthesizer, ResetSchedule, ScriptedGenerator, SpeechRequest,
};
use tempfile::TempDir;

fn memory_only(generator: Arc<ScriptedGenerator>, daily_limit: u32) -> TieredCache<ScriptedGenerator> {
    TieredCache::builder(generator)
        .clock(test_clock())
        .quota(
            unspaced_limits(daily_limit),
            ResetSchedule::default(),
            Arc::new(InMemoryQuotaStore::new()),
        )
        .build()
}

async fn on_disk(
    generator: Arc<ScriptedGenerator>,
    dir: &TempDir,
) -> TieredCache<ScriptedGenerator> {
    TieredCache::builder(generator)
        .clock(test_clock())
        .configure(&test_config(dir.path()), SPEECH_NAMESPACE)
        .await
        .expect("valid config")
        .build()
}

// ============================================================================
// SCENARIOS
// ============================================================================

#[tokio::test]
async fn scenario_a_repeat_fetch_hits_memory() {
    let generator = Arc::new(ScriptedGenerator::new());
    let cache = memory_only(generator.clone(), 1500);

    let first = cache.fetch_with_source(&breathe_deeply()).await.unwrap();
    assert_eq!(first.source, FetchSource::Generated);
    assert_eq!(generator.calls(), 1);

    let second = cache.fetch_with_source(&breathe_deeply()).await.unwrap();
    assert_eq!(second.source, FetchSource::Memory);
    assert_eq!(second.artifact, first.artifact);
    assert_eq!(generator.calls(), 1);

    // speed 1.0 is the default and must not fragment the key
    let implicit = SpeechRequest::new("  Breathe deeply ").with_voice("X");
    let third = cache.fetch_with_source(&implicit).await.unwrap();
    assert_eq!(third.source, FetchSource::Memory);
    assert_eq!(generator.calls(), 1);
}

#[tokio::test]
async fn scenario_b_daily_limit_blocks_next_generation() {
    let generator = Arc::new(ScriptedGenerator::new());
    let cache = memory_only(generator.clone(), 1500);

    for i in 0..1500 {
        cache
            .fetch(&SpeechRequest::new(format!("line {}", i)))
            .await
            .unwrap();
    }
    assert_eq!(generator.calls(), 1500);
    assert_eq!(cache.governor().snapshot().daily_count, 1500);

    let result = cache.fetch(&SpeechRequest::new("one too many")).await;
    assert_quota_exceeded(&result);
    assert_eq!(generator.calls(), 1500);
    assert_eq!(cache.stats().quota.state, GovernorState::QuotaExhausted);

    // cached content is still served
    assert!(cache.fetch(&SpeechRequest::new("line 7")).await.is_ok());
}

#[tokio::test]
async fn scenario_c_provider_quota_error_exhausts_budget() {
    let generator = Arc::new(ScriptedGenerator::new());
    generator.push_quota_error();
    let cache = memory_only(generator.clone(), 1500);

    let first = cache.fetch(&SpeechRequest::new("first")).await;
    assert_generation_error(&first);
    assert!(matches!(
        first,
        Err(ReverieError::Generation(GenerationError::ProviderQuotaExceeded { .. }))
    ));
    let snapshot = cache.governor().snapshot();
    assert_eq!(snapshot.daily_count, 1500);
    assert!(snapshot.last_provider_error_at.is_some());

    let second = cache.fetch(&SpeechRequest::new("second")).await;
    assert_quota_exceeded(&second);
    assert_eq!(generator.calls(), 1);
}

#[tokio::test]
async fn spacing_violation_surfaces_as_rate_limited() {
    let generator = Arc::new(ScriptedGenerator::new());
    let clock = test_clock();
    let cache = TieredCache::builder(generator.clone())
        .clock(clock.clone())
        .quota(
            unspaced_limits(1500).with_min_interval(Duration::from_secs(4)),
            ResetSchedule::default(),
            Arc::new(InMemoryQuotaStore::new()),
        )
        .build();

    cache.fetch(&SpeechRequest::new("first")).await.unwrap();
    let early = cache.fetch(&SpeechRequest::new("second")).await;
    assert_rate_limited(&early);
    if let Err(ReverieError::Quota(denial)) = &early {
        assert!(denial.wait(clock.now()) <= Duration::from_secs(4));
    }
    assert_eq!(generator.calls(), 1);

    clock.advance(Duration::from_secs(4));
    assert!(cache.fetch(&SpeechRequest::new("second")).await.is_ok());
    assert_eq!(generator.calls(), 2);
}

#[tokio::test]
async fn scenario_d_concurrent_fetches_share_one_generation() {
    let generator = Arc::new(ScriptedGenerator::new().gated());
    let cache = memory_only(generator.clone(), 1500);
    let request = SpeechRequest::new("Visualize the finish line");

    let mut handles = Vec::new();
    for _ in 0..5 {
        let cache = cache.clone();
        let request = request.clone();
        handles.push(tokio::spawn(async move { cache.fetch_with_source(&request).await }));
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        while cache.stats().waiters < 5 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("all five callers subscribe");
    generator.open_gate();

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(generator.calls(), 1);
    let bytes = results[0].artifact.to_bytes();
    assert!(results.iter().all(|r| r.artifact.to_bytes() == bytes));
    assert_eq!(
        results
            .iter()
            .filter(|r| r.source == FetchSource::Generated)
            .count(),
        1
    );
    assert_eq!(
        results
            .iter()
            .filter(|r| r.source == FetchSource::Coalesced)
            .count(),
        4
    );
    let stats = cache.stats();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.coalesced, 4);
    assert_eq!(stats.quota.daily_count, 1);
}

#[tokio::test]
async fn concurrent_failure_reaches_every_waiter() {
    let generator = Arc::new(ScriptedGenerator::new().gated());
    generator.push_err(GenerationError::Provider {
        provider: "scripted".to_string(),
        message: "HTTP 500".to_string(),
    });
    let cache = memory_only(generator.clone(), 1500);
    let request = SpeechRequest::new("Stay present");

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let cache = cache.clone();
            let request = request.clone();
            tokio::spawn(async move { cache.fetch(&request).await })
        })
        .collect();
    tokio::time::timeout(Duration::from_secs(5), async {
        while cache.stats().waiters < 3 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("all callers subscribe");
    generator.open_gate();

    for handle in handles {
        assert_generation_error(&handle.await.unwrap());
    }
    assert_eq!(generator.calls(), 1);

    // the failure is not replayed
    assert!(cache.fetch(&request).await.is_ok());
    assert_eq!(generator.calls(), 2);
}

// ============================================================================
// TIERS
// ============================================================================

#[tokio::test]
async fn remote_hit_promotes_to_faster_tiers() {
    let remote = Arc::new(InMemoryRemoteStore::new());
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();

    let producer = TieredCache::builder(Arc::new(ScriptedGenerator::new()))
        .clock(test_clock())
        .configure(&test_config(dir_a.path()), SPEECH_NAMESPACE)
        .await
        .unwrap()
        .remote_store(remote.clone(), Duration::from_secs(1))
        .build();
    producer.fetch(&breathe_deeply()).await.unwrap();
    let outcomes = producer.flush_remote_writes().await;
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].is_written());

    let generator = Arc::new(ScriptedGenerator::new());
    let consumer = TieredCache::builder(generator.clone())
        .clock(test_clock())
        .configure(&test_config(dir_b.path()), SPEECH_NAMESPACE)
        .await
        .unwrap()
        .remote_store(remote.clone(), Duration::from_secs(1))
        .build();

    let fetched = consumer.fetch_with_source(&breathe_deeply()).await.unwrap();
    assert_eq!(fetched.source, FetchSource::Remote);
    assert_eq!(consumer.local().map(|l| l.len()), Some(1));

    let lookups = remote.lookup_count();
    let local_hits = consumer.local().map(|l| l.stats().hits);
    let again = consumer.fetch_with_source(&breathe_deeply()).await.unwrap();
    assert_eq!(again.source, FetchSource::Memory);
    assert_eq!(remote.lookup_count(), lookups);
    assert_eq!(consumer.local().map(|l| l.stats().hits), local_hits);
    assert_eq!(generator.calls(), 0);
}

#[tokio::test]
async fn unreachable_remote_is_never_fatal() {
    let store = Arc::new(FailingRemoteStore::new());
    let generator = Arc::new(ScriptedGenerator::new());
    let cache = TieredCache::builder(generator.clone())
        .clock(test_clock())
        .quota(
            unspaced_limits(10),
            ResetSchedule::default(),
            Arc::new(InMemoryQuotaStore::new()),
        )
        .remote_store(store.clone(), Duration::from_millis(200))
        .build();

    let fetched = cache.fetch_with_source(&breathe_deeply()).await.unwrap();
    assert_eq!(fetched.source, FetchSource::Generated);

    let outcomes = cache.flush_remote_writes().await;
    assert!(matches!(outcomes.as_slice(), [RemoteWriteOutcome::Failed { .. }]));
    assert_eq!(cache.stats().remote_writes_failed, 1);
    assert!(store.calls() >= 2);
}

#[tokio::test]
async fn local_tier_survives_restart() {
    let dir = TempDir::new().unwrap();
    let request = breathe_deeply();

    let original = {
        let cache = on_disk(Arc::new(ScriptedGenerator::new()), &dir).await;
        let audio = cache.fetch(&request).await.unwrap();
        assert_eq!(cache.governor().snapshot().daily_count, 1);
        audio
    };

    let generator = Arc::new(ScriptedGenerator::new());
    let cache = on_disk(generator.clone(), &dir).await;
    let fetched = cache.fetch_with_source(&request).await.unwrap();
    assert_eq!(fetched.source, FetchSource::Local);
    assert_eq!(fetched.artifact, original);
    assert_eq!(generator.calls(), 0);

    // quota usage persisted alongside the index
    assert_eq!(cache.governor().snapshot().daily_count, 1);
}

#[tokio::test]
async fn truncated_blob_is_never_served() {
    let dir = TempDir::new().unwrap();
    let request = breathe_deeply();

    let (original, blob_path, blobs_dir) = {
        let cache = on_disk(Arc::new(ScriptedGenerator::new()), &dir).await;
        let fetched = cache.fetch_with_source(&request).await.unwrap();
        let local = cache.local().expect("local tier opened");
        let path = local.blob_path(&fetched.key);
        let blobs = path.parent().unwrap().to_path_buf();
        (fetched.artifact, path, blobs)
    };

    // simulate a crash mid-write: a half-written blob and a stray temp file
    let bytes = std::fs::read(&blob_path).unwrap();
    std::fs::write(&blob_path, &bytes[..bytes.len() / 2]).unwrap();
    std::fs::write(blobs_dir.join(".tmp-interrupted"), b"partial").unwrap();

    let generator = Arc::new(ScriptedGenerator::new());
    let cache = on_disk(generator.clone(), &dir).await;
    assert!(!blobs_dir.join(".tmp-interrupted").exists());

    let fetched = cache.fetch_with_source(&request).await.unwrap();
    assert_eq!(fetched.source, FetchSource::Generated);
    assert_eq!(fetched.artifact, original);
    assert_eq!(generator.calls(), 1);
    assert_eq!(cache.local().map(|l| l.stats().corrupt_purged), Some(1));
}

#[tokio::test]
async fn deleted_blob_falls_through_to_generation() {
    let dir = TempDir::new().unwrap();
    let generator = Arc::new(ScriptedGenerator::new());
    let cache = on_disk(generator.clone(), &dir).await;
    let request = breathe_deeply();
    let key = cache.key_for(&request);
    cache.fetch(&request).await.unwrap();

    // out-of-band deletion plus a cold memory tier
    let path = cache.local().unwrap().blob_path(&key);
    std::fs::remove_file(path).unwrap();
    cache.clear(ClearScope::Memory).await.unwrap();

    let fetched = cache.fetch_with_source(&request).await.unwrap();
    assert_eq!(fetched.source, FetchSource::Generated);
    assert_eq!(generator.calls(), 2);
}

#[tokio::test]
async fn byte_budgets_are_never_exceeded() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.memory.max_bytes = 2_000;
    config.local.max_bytes = 5_000;

    let cache = TieredCache::builder(Arc::new(MockSynthesizer::new()))
        .clock(test_clock())
        .configure(&config, SPEECH_NAMESPACE)
        .await
        .unwrap()
        .build();

    for i in 0..40 {
        cache
            .fetch(&SpeechRequest::new(format!("Affirmation {}", i)))
            .await
            .unwrap();
        assert!(cache.memory().bytes_used() <= 2_000);
        let local = cache.local().unwrap();
        assert!(local.bytes_used() <= 5_000);
    }
    assert!(cache.stats().memory.evictions > 0);
}

#[tokio::test]
async fn clear_all_forces_regeneration() {
    let dir = TempDir::new().unwrap();
    let generator = Arc::new(ScriptedGenerator::new());
    let cache = on_disk(generator.clone(), &dir).await;
    cache.fetch(&breathe_deeply()).await.unwrap();

    let report = cache.clear(ClearScope::All).await.unwrap();
    assert_eq!(report.memory, 1);
    assert_eq!(report.local, 1);

    let fetched = cache.fetch_with_source(&breathe_deeply()).await.unwrap();
    assert_eq!(fetched.source, FetchSource::Generated);
    assert_eq!(generator.calls(), 2);
}

#[tokio::test]
async fn personalization_and_speech_caches_do_not_collide() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let clock = test_clock();

    let personalizer = Arc::new(MockPersonalizer::new());
    let text_cache = TieredCache::builder(personalizer.clone())
        .clock(clock.clone())
        .configure(&config, "personalize")
        .await
        .unwrap()
        .build();
    let speech_cache = TieredCache::builder(Arc::new(MockSynthesizer::new()))
        .clock(clock)
        .configure(&config, SPEECH_NAMESPACE)
        .await
        .unwrap()
        .build();

    let script = text_cache.fetch(&pre_game_request()).await.unwrap();
    let speech_request = SpeechRequest::new(script.as_str()).with_voice("coach");
    let audio = speech_cache.fetch(&speech_request).await.unwrap();
    assert!(audio.byte_size() > 0);

    let deriver = CanonicalKeyDeriver::new();
    assert_ne!(
        deriver.derive(&pre_game_request()),
        deriver.derive(&speech_request)
    );
    assert_eq!(
        text_cache.fetch_with_source(&pre_game_request()).await.unwrap().source,
        FetchSource::Memory
    );
    assert_eq!(personalizer.calls(), 1);
}
