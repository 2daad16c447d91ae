use crate::manager::AckRecord;

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use relay_messaging::BinaryMessage;
use relay_messaging::transport::{
    DeliveryCallback, ProcessingGroup, RawAck, RequestHandle, ResponseCallback,
    TransportError, TransportSubscription, WireHandler,
};
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

struct SubscriptionEntry {
    delivery: DeliveryCallback,
    filter: Option<String>,
}

struct HandlerEntry {
    handler: WireHandler,
    filter: Option<String>,
}

#[derive(Default)]
struct GroupState {
    subscriptions: HashMap<u64, SubscriptionEntry>,
    handlers: HashMap<u64, HandlerEntry>,
    correlators: HashMap<String, ResponseCallback>,
}

/// An in-memory processing group: one destination's subscriber and
/// handler tables plus the correlators for its outstanding requests.
/// Deliveries run on spawned tasks, like a real transport's worker
/// threads.
pub struct MemoryProcessingGroup {
    state: Arc<Mutex<GroupState>>,
    next_id: AtomicU64,
    acks: Arc<Mutex<Vec<AckRecord>>>,
    fail_registrations: Arc<AtomicBool>,
}

impl MemoryProcessingGroup {
    pub(crate) fn new(
        acks: Arc<Mutex<Vec<AckRecord>>>,
        fail_registrations: Arc<AtomicBool>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(GroupState::default())),
            next_id: AtomicU64::new(0),
            acks,
            fail_registrations,
        }
    }

    fn matches(filter: Option<&str>, wire_type: &str) -> bool {
        filter.is_none() || filter == Some(wire_type)
    }

    fn recording_ack(&self, destination: &str) -> RawAck {
        let acks = self.acks.clone();
        let destination = destination.to_string();
        Box::new(move |accepted| {
            Box::pin(async move {
                acks.lock().expect("ack log poisoned").push(AckRecord {
                    destination,
                    accepted,
                    at: Instant::now(),
                });
                Ok(())
            })
        })
    }
}

#[async_trait]
impl ProcessingGroup for MemoryProcessingGroup {
    async fn send(
        &self,
        destination: &str,
        message: BinaryMessage,
        _lifespan: Duration,
    ) -> Result<(), TransportError> {
        let deliveries: Vec<DeliveryCallback> = {
            let state = self.state.lock().expect("group state poisoned");
            state
                .subscriptions
                .values()
                .filter(|entry| Self::matches(entry.filter.as_deref(), &message.wire_type))
                .map(|entry| entry.delivery.clone())
                .collect()
        };

        debug!(
            "delivering {} on {destination} to {} subscriber(s)",
            message.wire_type,
            deliveries.len()
        );
        for delivery in deliveries {
            let raw = self.recording_ack(destination);
            tokio::spawn(delivery(message.clone(), raw));
        }

        Ok(())
    }

    async fn subscribe(
        &self,
        _destination: &str,
        delivery: DeliveryCallback,
        wire_type_filter: Option<String>,
    ) -> Result<TransportSubscription, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.state
            .lock()
            .expect("group state poisoned")
            .subscriptions
            .insert(
                id,
                SubscriptionEntry {
                    delivery,
                    filter: wire_type_filter,
                },
            );

        let state = self.state.clone();
        Ok(TransportSubscription::new(move || {
            state
                .lock()
                .expect("group state poisoned")
                .subscriptions
                .remove(&id);
            Box::pin(async { Ok(()) })
        }))
    }

    async fn register_handler(
        &self,
        destination: &str,
        handler: WireHandler,
        wire_type_filter: Option<String>,
    ) -> Result<TransportSubscription, TransportError> {
        if self.fail_registrations.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable(format!(
                "registration refused on {destination}"
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.state
            .lock()
            .expect("group state poisoned")
            .handlers
            .insert(
                id,
                HandlerEntry {
                    handler,
                    filter: wire_type_filter,
                },
            );

        let state = self.state.clone();
        Ok(TransportSubscription::new(move || {
            state
                .lock()
                .expect("group state poisoned")
                .handlers
                .remove(&id);
            Box::pin(async { Ok(()) })
        }))
    }

    async fn send_request(
        &self,
        destination: &str,
        message: BinaryMessage,
        on_response: ResponseCallback,
    ) -> Result<Arc<RequestHandle>, TransportError> {
        let correlation_id = Uuid::new_v4().to_string();
        self.state
            .lock()
            .expect("group state poisoned")
            .correlators
            .insert(correlation_id.clone(), on_response);

        let handle = {
            let state = self.state.clone();
            let correlation_id = correlation_id.clone();
            Arc::new(RequestHandle::new(move || {
                state
                    .lock()
                    .expect("group state poisoned")
                    .correlators
                    .remove(&correlation_id);
            }))
        };

        let handler = {
            let state = self.state.lock().expect("group state poisoned");
            state
                .handlers
                .values()
                .find(|entry| Self::matches(entry.filter.as_deref(), &message.wire_type))
                .map(|entry| entry.handler.clone())
        };

        if let Some(handler) = handler {
            let state = self.state.clone();
            let completion = handle.completion();
            let destination = destination.to_string();
            tokio::spawn(async move {
                match handler(message).await {
                    Ok(response) => {
                        let callback = state
                            .lock()
                            .expect("group state poisoned")
                            .correlators
                            .remove(&correlation_id);
                        // Dropped when the requester cancelled the
                        // correlator before the response was ready.
                        if let Some(callback) = callback {
                            completion.store(true, Ordering::SeqCst);
                            callback(response).await;
                        }
                    }
                    Err(e) => warn!("request handler on {destination} failed: {e}"),
                }
            });
        } else {
            debug!(
                "no handler for {} on {destination}, request will time out",
                message.wire_type
            );
        }

        Ok(handle)
    }
}

impl Debug for MemoryProcessingGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("group state poisoned");
        f.debug_struct("MemoryProcessingGroup")
            .field("subscriptions", &state.subscriptions.len())
            .field("handlers", &state.handlers.len())
            .field("correlators", &state.correlators.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn collecting_delivery(sender: mpsc::UnboundedSender<String>) -> DeliveryCallback {
        let delivery: DeliveryCallback = Arc::new(move |message: BinaryMessage, raw: RawAck| {
            let sender = sender.clone();
            Box::pin(async move {
                let _ = sender.send(message.wire_type.clone());
                let _ = raw(true).await;
            })
        });
        delivery
    }

    fn group() -> MemoryProcessingGroup {
        MemoryProcessingGroup::new(
            Arc::new(Mutex::new(Vec::new())),
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[tokio::test]
    async fn wire_type_filter_limits_delivery() {
        let group = group();
        let (sender, mut receiver) = mpsc::unbounded_channel();

        group
            .subscribe("dest", collecting_delivery(sender), Some("Wanted".into()))
            .await
            .unwrap();

        group
            .send(
                "dest",
                BinaryMessage::new(Bytes::new(), "Ignored"),
                Duration::ZERO,
            )
            .await
            .unwrap();
        group
            .send(
                "dest",
                BinaryMessage::new(Bytes::new(), "Wanted"),
                Duration::ZERO,
            )
            .await
            .unwrap();

        let delivered = timeout(Duration::from_secs(1), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered, "Wanted");
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribed_delivery_stops() {
        let group = group();
        let (sender, mut receiver) = mpsc::unbounded_channel();

        let subscription = group
            .subscribe("dest", collecting_delivery(sender), None)
            .await
            .unwrap();
        subscription.dispose().await.unwrap();

        group
            .send(
                "dest",
                BinaryMessage::new(Bytes::new(), "Anything"),
                Duration::ZERO,
            )
            .await
            .unwrap();

        assert!(
            timeout(Duration::from_millis(50), receiver.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn disposed_request_handle_drops_late_responses() {
        let group = group();

        group
            .register_handler(
                "dest",
                Arc::new(|message: BinaryMessage| {
                    Box::pin(async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(message)
                    })
                }),
                None,
            )
            .await
            .unwrap();

        let (sender, mut receiver) = mpsc::unbounded_channel();
        let on_response: ResponseCallback = Arc::new(move |message: BinaryMessage| {
            let sender = sender.clone();
            Box::pin(async move {
                let _ = sender.send(message.wire_type.clone());
            })
        });

        let handle = group
            .send_request("dest", BinaryMessage::new(Bytes::new(), "Echo"), on_response)
            .await
            .unwrap();
        handle.dispose();

        assert!(
            timeout(Duration::from_millis(200), receiver.recv())
                .await
                .is_err()
        );
    }
}
