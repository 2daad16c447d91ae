use crate::BinaryMessage;

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::{Duration, Instant};

/// Errors raised by the transport layer.
#[derive(Clone, Debug, Error)]
pub enum TransportError {
    /// The transport or destination is not reachable.
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    /// The transport rejected the operation.
    #[error("transport rejected operation: {0}")]
    Rejected(String),

    /// A registered reply handler failed to produce a response.
    #[error("handler failed: {0}")]
    Handler(String),

    /// The transport has been shut down.
    #[error("transport closed")]
    Closed,
}

/// Kinds of connectivity change emitted by a transport.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransportEventKind {
    /// The transport lost its connection; server-side registrations on it
    /// are gone and must be re-installed.
    Failure,

    /// The transport re-established its connection.
    Recovered,
}

/// A connectivity change on a named transport.
#[derive(Clone, Debug)]
pub struct TransportEvent {
    /// The transport the event concerns.
    pub transport_id: String,

    /// What happened.
    pub kind: TransportEventKind,
}

/// Future produced by a raw transport acknowledgement.
pub type AckFuture = BoxFuture<'static, Result<(), TransportError>>;

/// Raw per-delivery acknowledgement handed to delivery callbacks.
/// `accepted = true` commits the message, `false` rejects it for
/// redelivery. Consumed on first use.
pub type RawAck = Box<dyn FnOnce(bool) -> AckFuture + Send>;

/// Callback invoked by the transport for each inbound delivery.
pub type DeliveryCallback =
    Arc<dyn Fn(BinaryMessage, RawAck) -> BoxFuture<'static, ()> + Send + Sync>;

/// Callback invoked by the transport when a response to an outstanding
/// request arrives.
pub type ResponseCallback = Arc<dyn Fn(BinaryMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Server-side reply handler as registered with the transport: consumes a
/// request frame, produces the response frame.
pub type WireHandler = Arc<
    dyn Fn(BinaryMessage) -> BoxFuture<'static, Result<BinaryMessage, TransportError>>
        + Send
        + Sync,
>;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(0);

/// Correlator token for an outstanding request/reply exchange. Created by
/// the transport when a request is dispatched; the client owns exactly one
/// copy per outstanding request.
pub struct RequestHandle {
    id: u64,
    due: Mutex<Option<Instant>>,
    complete: Arc<AtomicBool>,
    canceller: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl RequestHandle {
    /// Creates a handle whose disposal runs `canceller`, which must remove
    /// the transport-side correlator entry for the request.
    #[must_use]
    pub fn new(canceller: impl FnOnce() + Send + 'static) -> Self {
        Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            due: Mutex::new(None),
            complete: Arc::new(AtomicBool::new(false)),
            canceller: Mutex::new(Some(Box::new(canceller))),
        }
    }

    /// Unique id of this handle.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Sets the absolute deadline for the request.
    pub fn set_due(&self, due: Instant) {
        *self.due.lock().expect("request handle poisoned") = Some(due);
    }

    /// The absolute deadline for the request, if one has been set.
    #[must_use]
    pub fn due(&self) -> Option<Instant> {
        *self.due.lock().expect("request handle poisoned")
    }

    /// Completion flag, shared with the transport. The transport sets it
    /// before invoking the response callback.
    #[must_use]
    pub fn completion(&self) -> Arc<AtomicBool> {
        self.complete.clone()
    }

    /// Whether a response has arrived for the request.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }

    /// Cancels the pending correlator entry on the transport side.
    /// Idempotent.
    pub fn dispose(&self) {
        let canceller = self
            .canceller
            .lock()
            .expect("request handle poisoned")
            .take();
        if let Some(cancel) = canceller {
            cancel();
        }
    }
}

impl Debug for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandle")
            .field("id", &self.id)
            .field("complete", &self.is_complete())
            .finish_non_exhaustive()
    }
}

/// Teardown for a transport-side subscription or reply-handler
/// registration. Disposal is idempotent.
pub struct TransportSubscription {
    teardown: Mutex<Option<Box<dyn FnOnce() -> AckFuture + Send>>>,
}

impl TransportSubscription {
    /// Creates a teardown around the given cancel closure.
    #[must_use]
    pub fn new(teardown: impl FnOnce() -> AckFuture + Send + 'static) -> Self {
        Self {
            teardown: Mutex::new(Some(Box::new(teardown))),
        }
    }

    /// Removes the subscription from the transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails to tear the subscription
    /// down. Repeated calls are no-ops.
    pub async fn dispose(&self) -> Result<(), TransportError> {
        let teardown = self
            .teardown
            .lock()
            .expect("transport subscription poisoned")
            .take();
        match teardown {
            Some(teardown) => teardown().await,
            None => Ok(()),
        }
    }
}

impl Debug for TransportSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSubscription").finish_non_exhaustive()
    }
}

/// A per-`(transport, destination)` channel owned by the transport layer.
#[async_trait]
pub trait ProcessingGroup: Send + Sync + 'static {
    /// Sends a message to the destination. A `Duration::ZERO` lifespan
    /// means the message never expires at the broker.
    async fn send(
        &self,
        destination: &str,
        message: BinaryMessage,
        lifespan: Duration,
    ) -> Result<(), TransportError>;

    /// Subscribes to deliveries on the destination. When a wire-type
    /// filter is given, only messages carrying that wire-type name are
    /// delivered.
    async fn subscribe(
        &self,
        destination: &str,
        delivery: DeliveryCallback,
        wire_type_filter: Option<String>,
    ) -> Result<TransportSubscription, TransportError>;

    /// Registers a reply handler on the destination.
    async fn register_handler(
        &self,
        destination: &str,
        handler: WireHandler,
        wire_type_filter: Option<String>,
    ) -> Result<TransportSubscription, TransportError>;

    /// Dispatches a request and returns the correlator handle for it. The
    /// response callback is invoked for each response frame that arrives
    /// while the correlator is live.
    async fn send_request(
        &self,
        destination: &str,
        message: BinaryMessage,
        on_response: ResponseCallback,
    ) -> Result<Arc<RequestHandle>, TransportError>;
}

/// Owns the configured transports and hands out processing groups.
#[async_trait]
pub trait TransportManager: Send + Sync + 'static {
    /// The processing group type of this manager's transports.
    type Group: ProcessingGroup;

    /// Acquires the processing group for a `(transport, destination)`
    /// pair.
    async fn processing_group(
        &self,
        transport_id: &str,
        destination: &str,
    ) -> Result<Arc<Self::Group>, TransportError>;

    /// Subscribes to connectivity events across all transports.
    fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent>;

    /// Shuts down all transports.
    async fn shutdown(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    #[test]
    fn handle_dispose_is_idempotent() {
        let cancelled = Arc::new(AtomicUsize::new(0));
        let counter = cancelled.clone();
        let handle = RequestHandle::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        handle.dispose();
        handle.dispose();
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handle_ids_are_unique() {
        let a = RequestHandle::new(|| {});
        let b = RequestHandle::new(|| {});
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn subscription_dispose_runs_once() {
        let torn = Arc::new(AtomicUsize::new(0));
        let counter = torn.clone();
        let subscription = TransportSubscription::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        });

        subscription.dispose().await.unwrap();
        subscription.dispose().await.unwrap();
        assert_eq!(torn.load(Ordering::SeqCst), 1);
    }
}
