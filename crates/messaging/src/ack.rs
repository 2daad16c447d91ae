use crate::transport::{AckFuture, RawAck};

use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A pending acknowledgement: fires the transport ack with its captured
/// outcome when invoked.
pub type AckThunk = Box<dyn FnOnce() -> AckFuture + Send>;

/// Holds deferred acknowledgements and commits each one when its due time
/// arrives. Shutdown force-drains whatever is still pending, so every
/// scheduled ack is executed exactly once.
pub struct AckScheduler {
    entries: Mutex<Vec<(Instant, AckThunk)>>,
    notify: Notify,
    stop: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AckScheduler {
    /// Creates the scheduler and starts its timer task. Must be called
    /// within a tokio runtime.
    #[must_use]
    pub fn new() -> Arc<Self> {
        let scheduler = Arc::new(Self {
            entries: Mutex::new(Vec::new()),
            notify: Notify::new(),
            stop: CancellationToken::new(),
            worker: Mutex::new(None),
        });

        let task = tokio::spawn(Self::run(scheduler.clone()));
        *scheduler.worker.lock().expect("ack worker poisoned") = Some(task);

        scheduler
    }

    /// Schedules a thunk to fire after `delay`. A zero delay runs the
    /// thunk inline.
    pub async fn schedule_in(&self, delay: Duration, thunk: AckThunk) {
        if delay.is_zero() {
            Self::fire(thunk).await;
            return;
        }

        let due = Instant::now() + delay;
        self.entries
            .lock()
            .expect("ack entries poisoned")
            .push((due, thunk));
        self.notify.notify_one();
    }

    /// Executes every pending entry regardless of due time.
    pub async fn force_drain(&self) {
        let drained = std::mem::take(&mut *self.entries.lock().expect("ack entries poisoned"));
        for (_, thunk) in drained {
            Self::fire(thunk).await;
        }
    }

    /// Stops the timer task and drains anything still pending.
    pub async fn shutdown(&self) {
        self.stop.cancel();
        let worker = self.worker.lock().expect("ack worker poisoned").take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        self.force_drain().await;
    }

    async fn run(self: Arc<Self>) {
        loop {
            let next_due = self
                .entries
                .lock()
                .expect("ack entries poisoned")
                .iter()
                .map(|(due, _)| *due)
                .min();

            tokio::select! {
                () = self.stop.cancelled() => break,
                () = self.notify.notified() => {}
                () = async {
                    match next_due {
                        Some(due) => sleep_until(due).await,
                        None => std::future::pending().await,
                    }
                } => self.fire_due().await,
            }
        }
    }

    // Snapshot-and-remove under the lock, invoke outside it, so a
    // concurrent force_drain can never double-fire a thunk.
    async fn fire_due(&self) {
        let now = Instant::now();
        let due_thunks = {
            let mut entries = self.entries.lock().expect("ack entries poisoned");
            let mut due_thunks = Vec::new();
            let mut i = 0;
            while i < entries.len() {
                if entries[i].0 <= now {
                    due_thunks.push(entries.swap_remove(i).1);
                } else {
                    i += 1;
                }
            }
            due_thunks
        };

        for thunk in due_thunks {
            Self::fire(thunk).await;
        }
    }

    async fn fire(thunk: AckThunk) {
        if let Err(e) = thunk().await {
            warn!("deferred ack failed: {e}");
        }
    }
}

impl Debug for AckScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckScheduler")
            .field(
                "pending",
                &self.entries.lock().expect("ack entries poisoned").len(),
            )
            .finish_non_exhaustive()
    }
}

/// Acknowledgement delegate handed to message handlers.
///
/// `accepted = true` commits the message; `(ZERO, false)` rejects it
/// immediately; `(delay, false)` with a positive delay rejects it after
/// the delay, giving visibility-timeout style redelivery. The underlying
/// transport ack is consumed on first use, so repeated calls are no-ops.
#[derive(Clone)]
pub struct Acker {
    raw: Arc<Mutex<Option<RawAck>>>,
    scheduler: Arc<AckScheduler>,
}

impl Acker {
    pub(crate) fn new(raw: RawAck, scheduler: Arc<AckScheduler>) -> Self {
        Self {
            raw: Arc::new(Mutex::new(Some(raw))),
            scheduler,
        }
    }

    /// Acknowledges the message, immediately when `delay` is zero and
    /// through the deferred-ack scheduler otherwise.
    pub async fn ack(&self, delay: Duration, accepted: bool) {
        let raw = self.raw.lock().expect("acker poisoned").take();
        let Some(raw) = raw else { return };

        self.scheduler
            .schedule_in(delay, Box::new(move || raw(accepted)))
            .await;
    }
}

impl Debug for Acker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acker").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::time::sleep;

    fn counting_thunk(counter: &Arc<AtomicUsize>) -> AckThunk {
        let counter = counter.clone();
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        })
    }

    fn counting_raw(counter: &Arc<AtomicUsize>) -> RawAck {
        let counter = counter.clone();
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        })
    }

    #[tokio::test]
    async fn zero_delay_runs_inline() {
        let scheduler = AckScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));

        scheduler
            .schedule_in(Duration::ZERO, counting_thunk(&fired))
            .await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn fires_at_due_time() {
        let scheduler = AckScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));

        scheduler
            .schedule_in(Duration::from_millis(200), counting_thunk(&fired))
            .await;

        sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn force_drain_runs_everything_once() {
        let scheduler = AckScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));

        scheduler
            .schedule_in(Duration::from_secs(3600), counting_thunk(&fired))
            .await;
        scheduler
            .schedule_in(Duration::from_secs(7200), counting_thunk(&fired))
            .await;

        scheduler.force_drain().await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        scheduler.force_drain().await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn acker_is_take_once() {
        let scheduler = AckScheduler::new();
        let acked = Arc::new(AtomicUsize::new(0));
        let acker = Acker::new(counting_raw(&acked), scheduler.clone());

        acker.ack(Duration::ZERO, true).await;
        acker.ack(Duration::ZERO, false).await;
        acker.clone().ack(Duration::ZERO, false).await;

        assert_eq!(acked.load(Ordering::SeqCst), 1);

        scheduler.shutdown().await;
    }
}
