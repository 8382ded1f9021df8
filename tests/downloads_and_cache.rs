//! Media downloads, rate limiting and cached lookups through the public engine API

mod common;

use common::{Message, assert_ordered, sample_messages};
use inspector_engine::{
    Engine, EngineConfig, FailureKind, RetryConfig, RunSummary, TaskFailure, TtlCache, cache_key,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        initial_delay: Duration::from_millis(200),
        max_delay: Duration::from_secs(2),
        backoff_multiplier: 2.0,
        jitter: false,
    }
}

fn engine_with(rate_limit_delay: Duration) -> Engine {
    Engine::new(EngineConfig {
        rate_limit_delay,
        retry: fast_retry(),
        ..Default::default()
    })
    .unwrap()
}

/// Media attachments of the sample messages
fn attachments(messages: &[Message]) -> Vec<String> {
    messages.iter().filter_map(|m| m.media.clone()).collect()
}

#[tokio::test(start_paused = true)]
async fn downloads_retry_transient_failures() {
    let engine = engine_with(Duration::ZERO);
    let files = attachments(&sample_messages(50));
    let attempts = Mutex::new(HashMap::<String, u32>::new());

    let results = engine
        .run_downloads(
            &files,
            |file| {
                let attempt = {
                    let mut attempts = attempts.lock().unwrap();
                    let n = attempts.entry(file.clone()).or_default();
                    *n += 1;
                    *n
                };
                let file = file.clone();
                async move {
                    match file.as_str() {
                        "photo_10.jpg" if attempt < 3 => {
                            Err(TaskFailure::transient("connection reset"))
                        }
                        "photo_20.jpg" => Err(TaskFailure::transient("flood wait")),
                        "photo_30.jpg" => Err(TaskFailure::permanent("file reference expired")),
                        _ => Ok(file.len()),
                    }
                }
            },
            None,
        )
        .await
        .unwrap();

    assert_ordered(&results, 5);
    let attempts = attempts.lock().unwrap();

    assert!(results[1].is_success(), "photo_10 recovered on its third try");
    assert_eq!(attempts["photo_10.jpg"], 3);

    let exhausted = results[2].failure().unwrap();
    assert_eq!(exhausted.kind, FailureKind::Permanent);
    assert!(exhausted.reason.contains("4 attempts"));
    assert_eq!(attempts["photo_20.jpg"], 4);

    assert_eq!(results[3].failure().unwrap().reason, "file reference expired");
    assert_eq!(attempts["photo_30.jpg"], 1, "permanent failures are not retried");

    let summary = RunSummary::from_results(&results);
    assert_eq!((summary.succeeded, summary.failed_permanent), (3, 2));
}

#[tokio::test]
async fn downloads_respect_the_download_ceiling() {
    let engine = Engine::new(EngineConfig {
        max_concurrent_tasks: 8,
        max_concurrent_downloads: 3,
        rate_limit_delay: Duration::ZERO,
        ..Default::default()
    })
    .unwrap();
    let files: Vec<String> = (0..24).map(|i| format!("video_{i}.mp4")).collect();
    let current = AtomicUsize::new(0);
    let peak = AtomicUsize::new(0);
    let (current_ref, peak_ref) = (&current, &peak);

    let results = engine
        .run_downloads(
            &files,
            move |_| async move {
                let now = current_ref.fetch_add(1, Ordering::SeqCst) + 1;
                peak_ref.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(3)).await;
                current_ref.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, TaskFailure>(())
            },
            None,
        )
        .await
        .unwrap();

    assert_eq!(RunSummary::from_results(&results).succeeded, 24);
    let peak = peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak {peak} exceeded max_concurrent_downloads");
}

#[tokio::test]
async fn concurrent_lookups_of_one_key_compute_once() {
    let engine = engine_with(Duration::ZERO);
    let cache: Arc<TtlCache<String, String>> = engine.cache();
    let calls = Arc::new(AtomicUsize::new(0));
    let key = cache_key("get_entity", &("@rustlang",)).unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let cache = Arc::clone(&cache);
        let calls = Arc::clone(&calls);
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            cache
                .get_or_compute(key, Duration::from_secs(300), || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok::<_, TaskFailure>("The Rust Programming Language".to_string())
                })
                .await
        }));
    }
    for handle in handles {
        assert_eq!(
            handle.await.unwrap().unwrap(),
            "The Rust Programming Language"
        );
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    engine.cancel();
}

// Entry expiry follows the wall clock, so this test runs in real time
#[tokio::test]
async fn cached_entries_expire_at_their_ttl() {
    let engine = engine_with(Duration::ZERO);
    let cache: Arc<TtlCache<&'static str, u32>> = engine.cache();
    let ttl = Duration::from_millis(300);

    cache
        .get_or_compute("members:rustlang", ttl, || async {
            Ok::<_, TaskFailure>(1200)
        })
        .await
        .unwrap();

    tokio::time::sleep(ttl / 3).await;
    assert_eq!(cache.get(&"members:rustlang").await, Some(1200));

    tokio::time::sleep(ttl).await;
    assert_eq!(cache.get(&"members:rustlang").await, None);
    engine.cancel();
}

#[tokio::test(start_paused = true)]
async fn rate_limiter_spaces_concurrent_callers() {
    let delay = Duration::from_millis(250);
    let engine = engine_with(delay);
    let limiter = engine.rate_limiter();
    let stamps = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let limiter = Arc::clone(&limiter);
        let stamps = Arc::clone(&stamps);
        handles.push(tokio::spawn(async move {
            limiter.await_turn().await;
            stamps.lock().unwrap().push(Instant::now());
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let mut stamps = stamps.lock().unwrap().clone();
    stamps.sort();
    for pair in stamps.windows(2) {
        assert!(pair[1] - pair[0] >= delay);
    }
}

#[tokio::test(start_paused = true)]
async fn analysis_workers_share_throttled_group_lookups() {
    let delay = Duration::from_millis(100);
    let engine = engine_with(delay);
    let groups = engine.throttled_cache::<String>();
    let lookups = AtomicUsize::new(0);
    let lookups_ref = &lookups;
    let groups_ref = &groups;
    // 60 messages spread over 3 groups
    let messages: Vec<(u64, u64)> = (0..60).map(|id| (id, id % 3)).collect();

    let start = Instant::now();
    let results = engine
        .run_batch(
            &messages,
            move |&(_, group)| async move {
                let key = cache_key("get_group", &group)
                    .map_err(|e| TaskFailure::permanent(e.to_string()))?;
                groups_ref
                    .call(key, || async move {
                        lookups_ref.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, TaskFailure>(format!("group {group}"))
                    })
                    .await
            },
            Some(20),
        )
        .await
        .unwrap();

    assert_ordered(&results, 60);
    assert_eq!(results[4].value().unwrap(), "group 1");
    assert_eq!(lookups.load(Ordering::SeqCst), 3, "one external call per group");
    assert!(
        Instant::now() - start >= delay * 2,
        "three misses are spaced by the limiter"
    );
    engine.cancel();
}
