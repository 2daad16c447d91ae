//! Counts in-flight operations so shutdown can drain them.

use std::fmt::Debug;

use tokio_util::task::TaskTracker;
use tokio_util::task::task_tracker::TaskTrackerToken;

/// Reference-counts in-flight operations. `begin` marks entry into a
/// tracked region; the returned guard releases it on every exit path.
/// `drain` blocks until all tracked regions have exited.
#[derive(Debug, Default)]
pub struct OperationTracker {
    inner: TaskTracker,
}

/// Releases its tracked region when dropped.
pub struct OperationGuard {
    _token: TaskTrackerToken,
}

impl OperationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> OperationGuard {
        OperationGuard {
            _token: self.inner.token(),
        }
    }

    pub fn outstanding(&self) -> usize {
        self.inner.len()
    }

    /// Waits for every outstanding operation to finish.
    pub async fn drain(&self) {
        self.inner.close();
        self.inner.wait().await;
    }
}

impl Debug for OperationGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationGuard").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use tokio::time::{Duration, sleep, timeout};

    #[tokio::test]
    async fn drain_waits_for_open_guards() {
        let tracker = Arc::new(OperationTracker::new());
        let guard = tracker.begin();
        assert_eq!(tracker.outstanding(), 1);

        let draining = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.drain().await })
        };

        sleep(Duration::from_millis(20)).await;
        assert!(!draining.is_finished());

        drop(guard);
        timeout(Duration::from_secs(1), draining)
            .await
            .expect("drain did not complete")
            .unwrap();
        assert_eq!(tracker.outstanding(), 0);
    }

    #[tokio::test]
    async fn drain_returns_immediately_when_idle() {
        let tracker = OperationTracker::new();
        timeout(Duration::from_secs(1), tracker.drain())
            .await
            .expect("drain did not complete");
    }
}
