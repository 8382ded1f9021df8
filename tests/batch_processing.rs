//! End-to-end batch analysis through the public engine API
//!
//! Covers ordering, per-batch progress, failure isolation, cancellation and the
//! shared analysis ceiling.

mod common;

use common::{
    Analysis, analyze, assert_ordered, collect_events_until, ends_run, progress_of,
    sample_messages, undispatched,
};
use inspector_engine::{
    Engine, EngineConfig, Event, FailureKind, RunId, RunSummary, TaskFailure, TaskOutcome,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn test_config() -> EngineConfig {
    EngineConfig {
        rate_limit_delay: Duration::ZERO,
        ..Default::default()
    }
}

#[tokio::test]
async fn analyzes_250_messages_in_three_batches() {
    let engine = Engine::new(test_config()).unwrap();
    let mut events = engine.subscribe();
    let messages = sample_messages(250);

    let results = engine.run_batch(&messages, analyze, None).await.unwrap();

    assert_ordered(&results, 250);
    for (message, result) in messages.iter().zip(&results) {
        let analysis: &Analysis = result.value().unwrap();
        assert_eq!(analysis.id, message.id);
        assert_eq!(analysis.has_link, message.id % 7 == 0);
    }

    let events = collect_events_until(&mut events, Duration::from_secs(5), |e| {
        ends_run(e, RunId(1))
    })
    .await;
    assert_eq!(
        events[0],
        Event::RunStarted {
            run: RunId(1),
            total: 250,
            batches: 3
        }
    );
    assert_eq!(progress_of(&events, RunId(1)), vec![100, 200, 250]);
    match events.last().unwrap() {
        Event::RunFinished { summary, .. } => assert_eq!(summary.succeeded, 250),
        other => panic!("expected RunFinished, got {other:?}"),
    }
}

#[tokio::test]
async fn one_failing_message_does_not_affect_the_others() {
    let engine = Engine::new(test_config()).unwrap();
    let messages = sample_messages(250);

    let results = engine
        .run_batch(
            &messages,
            |message| {
                let id = message.id;
                async move {
                    if id == 123 {
                        Err(TaskFailure::permanent("message was deleted"))
                    } else {
                        Ok(id)
                    }
                }
            },
            None,
        )
        .await
        .unwrap();

    assert_ordered(&results, 250);
    let summary = RunSummary::from_results(&results);
    assert_eq!(summary.succeeded, 249);
    assert_eq!(summary.failed(), 1);
    assert_eq!(
        results[123].failure().map(|f| f.kind),
        Some(FailureKind::Permanent)
    );
}

#[tokio::test]
async fn cancelling_after_the_first_batch_stops_the_run() {
    let engine = Engine::new(test_config()).unwrap();
    let token = engine.cancellation_token();
    let engine = engine.with_progress(Arc::new(move |completed: usize, _total: usize| {
        if completed >= 100 {
            token.cancel();
        }
    }));
    let mut events = engine.subscribe();
    let messages = sample_messages(300);

    let results = tokio::time::timeout(
        Duration::from_secs(5),
        engine.run_batch(&messages, analyze, None),
    )
    .await
    .expect("cancelled run must return promptly")
    .unwrap();

    assert_ordered(&results, 300);
    assert!(results[..100].iter().all(|r| r.is_success()));
    assert_eq!(undispatched(&results), 200);

    let events = collect_events_until(&mut events, Duration::from_secs(1), |e| {
        ends_run(e, RunId(1))
    })
    .await;
    assert_eq!(
        events.last(),
        Some(&Event::RunCancelled {
            run: RunId(1),
            completed: 100,
            total: 300
        })
    );
}

#[tokio::test]
async fn cancelling_one_run_does_not_cancel_the_next() {
    let stop = CancellationToken::new();
    let trigger = stop.clone();
    let engine = Engine::new(test_config())
        .unwrap()
        .with_progress(Arc::new(move |completed: usize, _total: usize| {
            if completed >= 100 {
                trigger.cancel();
            }
        }));
    let mut events = engine.subscribe();
    let messages = sample_messages(300);

    let results = engine
        .run_batch_cancellable(&messages, analyze, None, &stop)
        .await
        .unwrap();
    assert!(results[..100].iter().all(|r| r.is_success()));
    assert_eq!(undispatched(&results), 200);

    let results = engine.run_batch(&messages, analyze, None).await.unwrap();
    assert_ordered(&results, 300);
    assert!(results.iter().all(|r| r.is_success()));

    let events = collect_events_until(&mut events, Duration::from_secs(1), |e| {
        ends_run(e, RunId(2))
    })
    .await;
    assert!(events.contains(&Event::RunCancelled {
        run: RunId(1),
        completed: 100,
        total: 300
    }));
    match events.last().unwrap() {
        Event::RunFinished { run, summary } => {
            assert_eq!(*run, RunId(2));
            assert_eq!(summary.succeeded, 300);
        }
        other => panic!("expected RunFinished, got {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_runs_share_the_analysis_ceiling() {
    let engine = Engine::new(EngineConfig {
        max_concurrent_tasks: 3,
        max_concurrent_downloads: 2,
        batch_size: 20,
        ..test_config()
    })
    .unwrap();
    let current = AtomicUsize::new(0);
    let peak = AtomicUsize::new(0);
    let (current_ref, peak_ref) = (&current, &peak);
    let worker = move |_: &u32| async move {
        let (current, peak) = (current_ref, peak_ref);
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2)).await;
        current.fetch_sub(1, Ordering::SeqCst);
        Ok::<_, TaskFailure>(())
    };
    let chats: Vec<u32> = (0..30).collect();
    let users: Vec<u32> = (0..30).collect();

    let (a, b) = tokio::join!(
        engine.run_batch(&chats, worker, None),
        engine.run_batch(&users, worker, None)
    );

    assert_eq!(RunSummary::from_results(&a.unwrap()).succeeded, 30);
    assert_eq!(RunSummary::from_results(&b.unwrap()).succeeded, 30);
    let peak = peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak {peak} exceeded the shared ceiling of 3");
}

#[tokio::test]
async fn panicking_worker_becomes_a_permanent_failure() {
    let engine = Engine::new(test_config()).unwrap();
    let messages = sample_messages(20);

    let results = engine
        .run_batch(
            &messages,
            |message| {
                let id = message.id;
                async move {
                    assert_ne!(id, 13, "unsupported message entity");
                    Ok(id)
                }
            },
            Some(5),
        )
        .await
        .unwrap();

    assert_ordered(&results, 20);
    let failure = results[13].failure().unwrap();
    assert_eq!(failure.kind, FailureKind::Permanent);
    assert!(failure.reason.contains("unsupported message entity"));
    assert_eq!(RunSummary::from_results(&results).succeeded, 19);
}

#[tokio::test]
async fn empty_input_finishes_immediately() {
    let engine = Engine::new(test_config()).unwrap();
    let mut events = engine.subscribe();
    let messages = sample_messages(0);

    let results = engine.run_batch(&messages, analyze, None).await.unwrap();
    assert!(results.is_empty());

    let events = collect_events_until(&mut events, Duration::from_secs(1), |e| {
        ends_run(e, RunId(1))
    })
    .await;
    assert!(progress_of(&events, RunId(1)).is_empty());
    assert!(matches!(
        events.last(),
        Some(Event::RunFinished { summary, .. }) if summary.total == 0
    ));
}

#[tokio::test]
async fn shutdown_rejects_later_runs() {
    let engine = Engine::new(test_config()).unwrap();
    engine.shutdown().await;

    let messages = sample_messages(3);
    let err = engine.run_batch(&messages, analyze, None).await.unwrap_err();
    assert!(matches!(err, inspector_engine::Error::ShuttingDown));
}

#[tokio::test]
async fn cancelled_engine_dispatches_nothing() {
    let engine = Engine::new(test_config()).unwrap();
    engine.cancel();

    let messages = sample_messages(4);
    let results = engine.run_batch(&messages, analyze, None).await.unwrap();
    assert_ordered(&results, 4);
    assert!(results.iter().all(|r| r.outcome == TaskOutcome::Cancelled));
}
