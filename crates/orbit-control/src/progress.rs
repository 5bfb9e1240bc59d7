//! Progress reporting.

use crate::types::{ProgressEvent, StallEvent};

/// Receives progress and stall notifications from the monitor.
pub trait ProgressSink: Send + Sync {
    /// Called after every successful poll.
    fn on_progress(&self, event: &ProgressEvent);

    /// Called once per stall, when polls have not succeeded for longer than
    /// the stall threshold.
    fn on_stall(&self, event: &StallEvent) {
        let _ = event;
    }
}

/// Writes progress to `tracing` at `info`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn on_progress(&self, event: &ProgressEvent) {
        tracing::info!(
            task_id = %event.task_id,
            target_ref = %event.target,
            status = %event.status,
            completed = event.completed,
            total = event.total,
            current = event.current_sub_step.as_deref().unwrap_or("-"),
            elapsed_secs = event.elapsed.as_secs(),
            "Task progress"
        );
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub use recording::RecordingProgress;

#[cfg(any(test, feature = "test-utils"))]
mod recording {
    use parking_lot::Mutex;

    use super::ProgressSink;
    use crate::types::{ProgressEvent, StallEvent};

    /// Collects every notification for later assertions.
    #[derive(Debug, Default)]
    pub struct RecordingProgress {
        events: Mutex<Vec<ProgressEvent>>,
        stalls: Mutex<Vec<StallEvent>>,
    }

    impl RecordingProgress {
        /// Create an empty recorder.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Progress events received so far.
        #[must_use]
        pub fn events(&self) -> Vec<ProgressEvent> {
            self.events.lock().clone()
        }

        /// Stall events received so far.
        #[must_use]
        pub fn stalls(&self) -> Vec<StallEvent> {
            self.stalls.lock().clone()
        }
    }

    impl ProgressSink for RecordingProgress {
        fn on_progress(&self, event: &ProgressEvent) {
            self.events.lock().push(event.clone());
        }

        fn on_stall(&self, event: &StallEvent) {
            self.stalls.lock().push(event.clone());
        }
    }
}
