//! Event collection and result assertions

use inspector_engine::{Event, RunId, TaskOutcome, TaskResult};
use std::time::Duration;
use tokio::sync::broadcast;

/// Collect events until `predicate` matches one (inclusive) or `timeout` elapses
pub async fn collect_events_until<F>(
    events: &mut broadcast::Receiver<Event>,
    timeout: Duration,
    predicate: F,
) -> Vec<Event>
where
    F: Fn(&Event) -> bool,
{
    let mut collected = Vec::new();
    let _ = tokio::time::timeout(timeout, async {
        while let Ok(event) = events.recv().await {
            let done = predicate(&event);
            collected.push(event);
            if done {
                break;
            }
        }
    })
    .await;
    collected
}

/// Whether `event` ends the given run
pub fn ends_run(event: &Event, run: RunId) -> bool {
    matches!(
        event,
        Event::RunFinished { run: r, .. } | Event::RunCancelled { run: r, .. } if *r == run
    )
}

/// Cumulative progress values reported for `run`, in emission order
pub fn progress_of(events: &[Event], run: RunId) -> Vec<usize> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::Progress { run: r, completed, .. } if *r == run => Some(*completed),
            _ => None,
        })
        .collect()
}

/// Assert `results` has one entry per input item, indexed in input order
pub fn assert_ordered<V>(results: &[TaskResult<V>], expected_len: usize) {
    assert_eq!(results.len(), expected_len, "one result per item");
    for (i, result) in results.iter().enumerate() {
        assert_eq!(result.index, i, "result {i} carries index {}", result.index);
    }
}

/// Count results that were never dispatched
pub fn undispatched<V>(results: &[TaskResult<V>]) -> usize {
    results
        .iter()
        .filter(|r| matches!(r.outcome, TaskOutcome::Cancelled))
        .count()
}
