//! Tracks outstanding request handles and fails them on timeout.

use crate::error::Error;
use crate::transport::RequestHandle;

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;

type FailureCallback = Box<dyn FnOnce(Error) + Send>;

/// Take-once cell holding a request's failure callback. Shared between
/// the tracker (timeout/shutdown path) and the response path (processing
/// failures), so exactly one outcome is ever reported per request.
pub struct FailureSlot(Mutex<Option<FailureCallback>>);

impl FailureSlot {
    pub fn new(callback: impl FnOnce(Error) + Send + 'static) -> Arc<Self> {
        Arc::new(Self(Mutex::new(Some(Box::new(callback)))))
    }

    /// Fires the callback with `error` if no outcome has been reported
    /// yet.
    pub fn fail(&self, error: Error) {
        let callback = self.0.lock().expect("failure slot poisoned").take();
        if let Some(callback) = callback {
            callback(error);
        }
    }

    /// Marks the request successfully completed, discarding the callback.
    pub fn resolve(&self) {
        drop(self.0.lock().expect("failure slot poisoned").take());
    }
}

impl Debug for FailureSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureSlot").finish_non_exhaustive()
    }
}

struct Entry {
    handle: Arc<RequestHandle>,
    failure: Arc<FailureSlot>,
}

/// Tracks outstanding request handles with their deadlines. A background
/// task sweeps entries that are past due or already complete; `poke`
/// schedules a prompt sweep after a response lands.
pub struct RequestTracker {
    entries: Mutex<HashMap<u64, Entry>>,
    notify: Notify,
    stop: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RequestTracker {
    /// Creates the tracker and starts its timer task. Must be called
    /// within a tokio runtime.
    pub fn new() -> Arc<Self> {
        let tracker = Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            stop: CancellationToken::new(),
            worker: Mutex::new(None),
        });

        let task = tokio::spawn(Self::run(tracker.clone()));
        *tracker.worker.lock().expect("tracker worker poisoned") = Some(task);

        tracker
    }

    /// Starts tracking a handle: stamps its deadline and arms the timer.
    pub fn register(&self, handle: Arc<RequestHandle>, timeout: Duration, failure: Arc<FailureSlot>) {
        handle.set_due(Instant::now() + timeout);
        self.entries
            .lock()
            .expect("tracker entries poisoned")
            .insert(handle.id(), Entry { handle, failure });
        self.notify.notify_one();
    }

    /// Schedules a prompt sweep so a freshly completed handle is
    /// collected without waiting for its deadline.
    pub fn poke(&self) {
        self.notify.notify_one();
    }

    /// Number of requests still being tracked.
    pub fn outstanding(&self) -> usize {
        self.entries.lock().expect("tracker entries poisoned").len()
    }

    /// Fails every remaining entry as timed out and stops the timer task.
    pub async fn shutdown(&self) {
        self.stop.cancel();
        let worker = self.worker.lock().expect("tracker worker poisoned").take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        self.stop_all();
    }

    fn stop_all(&self) {
        let drained: Vec<Entry> = self
            .entries
            .lock()
            .expect("tracker entries poisoned")
            .drain()
            .map(|(_, entry)| entry)
            .collect();

        for entry in drained {
            entry.handle.dispose();
            entry.failure.fail(Error::Timeout);
        }
    }

    async fn run(self: Arc<Self>) {
        loop {
            let next_due = self
                .entries
                .lock()
                .expect("tracker entries poisoned")
                .values()
                .filter_map(|entry| entry.handle.due())
                .min();

            tokio::select! {
                () = self.stop.cancelled() => break,
                () = self.notify.notified() => {
                    sleep(Duration::from_millis(1)).await;
                    self.sweep();
                }
                () = async {
                    match next_due {
                        Some(due) => sleep_until(due).await,
                        None => std::future::pending().await,
                    }
                } => self.sweep(),
            }
        }
    }

    // Snapshot the due-or-complete entries under the lock, dispose and
    // fail them outside it.
    fn sweep(&self) {
        let now = Instant::now();
        let swept: Vec<Entry> = {
            let mut entries = self.entries.lock().expect("tracker entries poisoned");
            let ids: Vec<u64> = entries
                .iter()
                .filter(|(_, entry)| {
                    entry.handle.is_complete()
                        || entry.handle.due().is_some_and(|due| due <= now)
                })
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| entries.remove(&id)).collect()
        };

        for entry in swept {
            entry.handle.dispose();
            if !entry.handle.is_complete() {
                entry.failure.fail(Error::Timeout);
            }
        }
    }
}

impl Debug for RequestTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestTracker")
            .field("outstanding", &self.outstanding())
            .finish_non_exhaustive()
    }
}
