//! Progress reporting for UI and logging collaborators.
//!
//! The coordinator publishes [`RunEvent`]s on a Tokio `broadcast` channel.
//! Publishing never waits for subscribers: a subscriber that falls behind
//! loses the oldest events (and is told how many) instead of slowing the
//! sweep down. Every event carries owned or `Arc`-shared snapshots, so
//! observers can keep them as long as they like.

use crate::coordinator::RunState;
use crate::data::{Dataset, ScanPoint};
use crate::sequencer::SequencerState;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

/// Progress notification published on the [`EventBus`].
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// The coordinator moved between run states.
    StateChanged {
        /// Run the event belongs to.
        run_id: Uuid,
        /// State left.
        from: RunState,
        /// State entered.
        to: RunState,
    },
    /// The sequencer entered a new phase for point `index`.
    PointPhase {
        /// Run the event belongs to.
        run_id: Uuid,
        /// Point index within the run.
        index: usize,
        /// Phase entered.
        phase: SequencerState,
    },
    /// A point was appended to the dataset as complete.
    PointCompleted {
        /// Run the event belongs to.
        run_id: Uuid,
        /// The point as recorded.
        point: Arc<ScanPoint>,
        /// Points planned for the run.
        total: usize,
    },
    /// A point ended in error. `will_retry` tells whether the coordinator
    /// re-runs it.
    PointFailed {
        /// Run the event belongs to.
        run_id: Uuid,
        /// The point as recorded.
        point: Arc<ScanPoint>,
        /// Whether the coordinator re-runs the point.
        will_retry: bool,
    },
    /// Terminal event with the sealed dataset.
    Finished {
        /// Run the event belongs to.
        run_id: Uuid,
        /// Terminal state.
        state: RunState,
        /// Sealed dataset.
        dataset: Arc<Dataset>,
    },
}

impl RunEvent {
    /// Run the event belongs to.
    pub fn run_id(&self) -> Uuid {
        match self {
            RunEvent::StateChanged { run_id, .. }
            | RunEvent::PointPhase { run_id, .. }
            | RunEvent::PointCompleted { run_id, .. }
            | RunEvent::PointFailed { run_id, .. }
            | RunEvent::Finished { run_id, .. } => *run_id,
        }
    }
}

/// Fire-and-forget event fan-out.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RunEvent>,
}

impl EventBus {
    /// Bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }

    /// Publish without blocking. Having no subscribers is not an error.
    pub fn publish(&self, event: RunEvent) {
        let _ = self.sender.send(event);
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Callback-style observer.
#[async_trait]
pub trait RunObserver: Send + Sync + 'static {
    /// Handle one event. Events arrive in publication order.
    async fn on_event(&self, event: &RunEvent);
}

/// Drive `observer` from a subscription until the run finishes or the bus
/// is dropped.
pub fn spawn_observer<O: RunObserver>(
    mut events: broadcast::Receiver<RunEvent>,
    observer: Arc<O>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let finished = matches!(event, RunEvent::Finished { .. });
                    observer.on_event(&event).await;
                    if finished {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "observer lagging behind run events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<RunState>>,
    }

    #[async_trait]
    impl RunObserver for Recorder {
        async fn on_event(&self, event: &RunEvent) {
            if let RunEvent::StateChanged { to, .. } = event {
                self.seen.lock().unwrap().push(*to);
            }
        }
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.publish(RunEvent::StateChanged {
            run_id: Uuid::nil(),
            from: RunState::Idle,
            to: RunState::Initializing,
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn observer_receives_events_until_closed() {
        let bus = EventBus::new(8);
        let recorder = Arc::new(Recorder::default());
        let task = spawn_observer(bus.subscribe(), recorder.clone());

        for (from, to) in [
            (RunState::Idle, RunState::Initializing),
            (RunState::Initializing, RunState::Sweeping),
        ] {
            bus.publish(RunEvent::StateChanged {
                run_id: Uuid::nil(),
                from,
                to,
            });
        }
        drop(bus);
        task.await.unwrap();

        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec![RunState::Initializing, RunState::Sweeping]
        );
    }
}
