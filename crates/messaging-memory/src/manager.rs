use crate::group::MemoryProcessingGroup;

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use relay_messaging::transport::{
    TransportError, TransportEvent, TransportEventKind, TransportManager,
};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::info;

/// A raw transport acknowledgement as observed by the loopback
/// transport.
#[derive(Clone, Debug)]
pub struct AckRecord {
    /// Destination the acknowledged message was delivered on.
    pub destination: String,

    /// Whether the message was accepted.
    pub accepted: bool,

    /// When the acknowledgement reached the transport.
    pub at: Instant,
}

/// In-memory transport manager: hands out loopback processing groups per
/// `(transport, destination)` pair and records every acknowledgement that
/// reaches the transport. Connectivity events are synthesized through
/// [`emit_event`](Self::emit_event).
pub struct MemoryTransportManager {
    groups: Mutex<HashMap<(String, String), Arc<MemoryProcessingGroup>>>,
    events: broadcast::Sender<TransportEvent>,
    acks: Arc<Mutex<Vec<AckRecord>>>,
    fail_registrations: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl MemoryTransportManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            groups: Mutex::new(HashMap::new()),
            events,
            acks: Arc::new(Mutex::new(Vec::new())),
            fail_registrations: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
        }
    }

    /// Synthesizes a connectivity event for a transport.
    pub fn emit_event(&self, transport_id: &str, kind: TransportEventKind) {
        let _ = self.events.send(TransportEvent {
            transport_id: transport_id.to_string(),
            kind,
        });
    }

    /// Every acknowledgement the transport has seen so far.
    #[must_use]
    pub fn acks(&self) -> Vec<AckRecord> {
        self.acks.lock().expect("ack log poisoned").clone()
    }

    /// Makes handler registration fail until cleared, for exercising
    /// re-registration retries.
    pub fn set_fail_registrations(&self, fail: bool) {
        self.fail_registrations.store(fail, Ordering::SeqCst);
    }
}

impl Default for MemoryTransportManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportManager for MemoryTransportManager {
    type Group = MemoryProcessingGroup;

    async fn processing_group(
        &self,
        transport_id: &str,
        destination: &str,
    ) -> Result<Arc<Self::Group>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let key = (transport_id.to_string(), destination.to_string());
        let group = self
            .groups
            .lock()
            .expect("group table poisoned")
            .entry(key)
            .or_insert_with(|| {
                Arc::new(MemoryProcessingGroup::new(
                    self.acks.clone(),
                    self.fail_registrations.clone(),
                ))
            })
            .clone();

        Ok(group)
    }

    fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.groups.lock().expect("group table poisoned").clear();
        info!("memory transport shut down");
    }
}

impl Debug for MemoryTransportManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransportManager")
            .field(
                "groups",
                &self.groups.lock().expect("group table poisoned").len(),
            )
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
