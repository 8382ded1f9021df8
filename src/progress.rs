//! Progress reporting for batch runs
//!
//! A coordinator calls [`ProgressSink::on_progress`] once per finished batch with
//! cumulative counts. Reporting is fire-and-forget: sinks must return quickly and
//! never fail the run, so the stock channel sinks drop updates nobody listens to.

use tokio::sync::{broadcast, mpsc};

use crate::types::{Event, Progress, RunId};

/// Receiver of progress updates
///
/// Sinks run inline on the run's task between batches, so a slow sink delays the
/// next batch. Consumers that render, log to disk or otherwise block should take
/// an [`mpsc::UnboundedSender<Progress>`] sink and drain the receiver on their own
/// task; sending never waits.
pub trait ProgressSink: Send + Sync {
    /// Called after each batch with the items finished so far and the total
    fn on_progress(&self, completed: usize, total: usize);
}

/// Sink that discards every update
#[derive(Clone, Copy, Debug, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_progress(&self, _completed: usize, _total: usize) {}
}

impl<F> ProgressSink for F
where
    F: Fn(usize, usize) + Send + Sync,
{
    fn on_progress(&self, completed: usize, total: usize) {
        self(completed, total)
    }
}

impl ProgressSink for mpsc::UnboundedSender<Progress> {
    fn on_progress(&self, completed: usize, total: usize) {
        self.send(Progress { completed, total }).ok();
    }
}

/// Sink that publishes [`Event::Progress`] on an event broadcast channel
#[derive(Clone, Debug)]
pub struct EventProgress {
    run: RunId,
    event_tx: broadcast::Sender<Event>,
}

impl EventProgress {
    /// Publish progress of `run` to `event_tx`
    pub fn new(run: RunId, event_tx: broadcast::Sender<Event>) -> Self {
        Self { run, event_tx }
    }
}

impl ProgressSink for EventProgress {
    fn on_progress(&self, completed: usize, total: usize) {
        // No subscribers is fine
        self.event_tx
            .send(Event::Progress {
                run: self.run,
                completed,
                total,
            })
            .ok();
    }
}

/// Forwards each update to two sinks
pub(crate) struct Tee<'a> {
    pub(crate) first: &'a dyn ProgressSink,
    pub(crate) second: &'a dyn ProgressSink,
}

impl ProgressSink for Tee<'_> {
    fn on_progress(&self, completed: usize, total: usize) {
        self.first.on_progress(completed, total);
        self.second.on_progress(completed, total);
    }
}
