use crate::BinaryMessage;
use crate::ack::{AckScheduler, Acker};
use crate::config::ClientConfig;
use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::handler::{AckMessageHandler, KnownTypes, MessageHandler, MultiHandler, ServiceHandler};
use crate::operations::OperationTracker;
use crate::registry::{HandleRegistry, RegistryHandle};
use crate::serializer::Serializer;
use crate::tracker::{FailureSlot, RequestTracker};
use crate::transport::{
    DeliveryCallback, ProcessingGroup, RawAck, RequestHandle, ResponseCallback, TransportError,
    TransportEventKind, TransportManager, TransportSubscription, WireHandler,
};
use crate::type_name::{MessageType, TypeNameResolver};

use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as TokioMutex, broadcast, oneshot};
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Broker-client facade: typed send, subscribe, request/reply and
/// server-side handler registration over the transports owned by a
/// [`TransportManager`], with wire encoding delegated to a
/// [`Serializer`].
///
/// Cloning is cheap and all clones share one lifecycle; `shutdown`
/// drains in-flight work before tearing the client down.
pub struct MessagingClient<M, S>
where
    M: TransportManager,
    S: Serializer,
{
    inner: Arc<ClientInner<M, S>>,
}

struct ClientInner<M, S>
where
    M: TransportManager,
    S: Serializer,
{
    transports: Arc<M>,
    serializer: Arc<S>,
    config: ClientConfig,
    resolver: TypeNameResolver,
    ack_scheduler: Arc<AckScheduler>,
    request_tracker: Arc<RequestTracker>,
    operations: OperationTracker,
    handles: HandleRegistry,
    disposing: CancellationToken,
}

/// Teardown for a live subscription.
#[derive(Debug)]
pub struct Subscription {
    handle: RegistryHandle,
}

impl Subscription {
    /// Removes the subscription. In-flight deliveries are allowed to
    /// complete.
    pub async fn unsubscribe(&self) {
        self.handle.dispose().await;
    }
}

/// Teardown for a registered service handler.
#[derive(Debug)]
pub struct ServiceRegistration {
    handle: RegistryHandle,
}

impl ServiceRegistration {
    /// Removes the handler and stops its self-healing re-registration.
    pub async fn deregister(&self) {
        self.handle.dispose().await;
    }
}

/// Teardown for an outstanding request.
#[derive(Debug)]
pub struct RequestGuard {
    handle: Arc<RequestHandle>,
}

impl RequestGuard {
    /// Cancels the pending correlator for the request. The failure
    /// callback still fires at the deadline if no response arrived
    /// before disposal.
    pub fn dispose(&self) {
        self.handle.dispose();
    }
}

// The slot holding a service's live transport registration. Its lock also
// serializes re-registration attempts.
struct RegistrationSlot {
    current: TokioMutex<Option<TransportSubscription>>,
}

impl<M, S> MessagingClient<M, S>
where
    M: TransportManager,
    S: Serializer,
{
    /// Creates a client with default configuration. Must be called
    /// within a tokio runtime.
    pub fn new(transports: M, serializer: S) -> Self {
        Self::with_config(transports, serializer, ClientConfig::default())
    }

    /// Creates a client with the given configuration.
    pub fn with_config(transports: M, serializer: S, config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                transports: Arc::new(transports),
                serializer: Arc::new(serializer),
                config,
                resolver: TypeNameResolver::new(),
                ack_scheduler: AckScheduler::new(),
                request_tracker: RequestTracker::new(),
                operations: OperationTracker::new(),
                handles: HandleRegistry::new(),
                disposing: CancellationToken::new(),
            }),
        }
    }

    /// The transport manager the client routes through.
    #[must_use]
    pub fn transports(&self) -> &M {
        &self.inner.transports
    }

    /// Whether shutdown has begun.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.inner.disposing.is_cancelled()
    }

    /// Number of requests awaiting a response or their deadline.
    #[must_use]
    pub fn outstanding_requests(&self) -> usize {
        self.inner.request_tracker.outstanding()
    }

    /// Number of live subscription and registration teardowns the client
    /// owns.
    #[must_use]
    pub fn open_handles(&self) -> usize {
        self.inner.handles.len()
    }

    /// Sends a message with the default lifespan.
    ///
    /// # Errors
    ///
    /// Fails with a shutdown error after shutdown has begun, a
    /// serialization error if the message cannot be encoded, or a
    /// transport error.
    pub async fn send<T>(&self, message: &T, endpoint: &Endpoint) -> Result<(), Error>
    where
        T: MessageType,
    {
        self.send_with_lifespan(message, endpoint, self.inner.config.default_lifespan)
            .await
    }

    /// Sends a message that expires at the broker after `lifespan`.
    /// `Duration::ZERO` means the message never expires.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn send_with_lifespan<T>(
        &self,
        message: &T,
        endpoint: &Endpoint,
        lifespan: Duration,
    ) -> Result<(), Error>
    where
        T: MessageType,
    {
        self.ensure_active()?;
        let _operation = self.inner.operations.begin();

        let wire_type = self.inner.resolver.resolve::<T>();
        let payload = self.inner.serializer.serialize(endpoint.format(), message)?;
        let frame = BinaryMessage::new(payload, &*wire_type);

        let group = self.group(endpoint).await?;
        debug!(
            "sending {wire_type} to {}/{}",
            endpoint.transport_id(),
            endpoint.destination()
        );
        group
            .send(endpoint.destination(), frame, lifespan)
            .await
            .map_err(|e| {
                warn!(
                    "send of {wire_type} to {}/{} failed: {e}",
                    endpoint.transport_id(),
                    endpoint.destination()
                );
                Error::Transport(e)
            })
    }

    /// Subscribes to messages of one schema. The delivery is accepted
    /// when the handler returns `Ok` and rejected for delayed redelivery
    /// when it fails.
    ///
    /// # Errors
    ///
    /// Fails with a shutdown error after shutdown has begun, or a
    /// transport error.
    pub async fn subscribe<T, H>(
        &self,
        endpoint: &Endpoint,
        handler: H,
    ) -> Result<Subscription, Error>
    where
        T: MessageType,
        H: MessageHandler<T>,
    {
        let handler = Arc::new(handler);
        let inner = self.inner.clone();
        let format = endpoint.format().to_string();

        let delivery: DeliveryCallback = Arc::new(move |frame: BinaryMessage, raw: RawAck| {
            let handler = handler.clone();
            let inner = inner.clone();
            let format = format.clone();
            Box::pin(async move {
                let acker = Acker::new(raw, inner.ack_scheduler.clone());
                match inner.serializer.deserialize::<T>(&format, &frame.payload) {
                    Ok(message) => match handler.handle(message).await {
                        Ok(()) => acker.ack(Duration::ZERO, true).await,
                        Err(e) => {
                            warn!("handler for {} failed: {e}", frame.wire_type);
                            acker.ack(inner.config.unack_delay, false).await;
                        }
                    },
                    Err(e) => {
                        warn!("failed to deserialize {}: {e}", frame.wire_type);
                        acker.ack(inner.config.unack_delay, false).await;
                    }
                }
            })
        });

        self.install_subscription(endpoint, delivery, self.schema_filter::<T>(endpoint))
            .await
    }

    /// Subscribes to messages of one schema with explicit acknowledgement
    /// control. If the handler fails without having used its acker, the
    /// delivery is rejected for delayed redelivery.
    ///
    /// # Errors
    ///
    /// See [`subscribe`](Self::subscribe).
    pub async fn subscribe_with_ack<T, H>(
        &self,
        endpoint: &Endpoint,
        handler: H,
    ) -> Result<Subscription, Error>
    where
        T: MessageType,
        H: AckMessageHandler<T>,
    {
        let handler = Arc::new(handler);
        let inner = self.inner.clone();
        let format = endpoint.format().to_string();

        let delivery: DeliveryCallback = Arc::new(move |frame: BinaryMessage, raw: RawAck| {
            let handler = handler.clone();
            let inner = inner.clone();
            let format = format.clone();
            Box::pin(async move {
                let acker = Acker::new(raw, inner.ack_scheduler.clone());
                match inner.serializer.deserialize::<T>(&format, &frame.payload) {
                    Ok(message) => {
                        if let Err(e) = handler.handle(message, acker.clone()).await {
                            warn!("handler for {} failed: {e}", frame.wire_type);
                            acker.ack(inner.config.unack_delay, false).await;
                        }
                    }
                    Err(e) => {
                        warn!("failed to deserialize {}: {e}", frame.wire_type);
                        acker.ack(inner.config.unack_delay, false).await;
                    }
                }
            })
        });

        self.install_subscription(endpoint, delivery, self.schema_filter::<T>(endpoint))
            .await
    }

    /// Subscribes to a destination carrying several schemas, decoded
    /// through `known`. Messages with an unregistered wire-type name go
    /// to the handler's unknown-type hook.
    ///
    /// # Errors
    ///
    /// See [`subscribe`](Self::subscribe).
    pub async fn subscribe_multi<H>(
        &self,
        endpoint: &Endpoint,
        handler: H,
        known: KnownTypes<S>,
    ) -> Result<Subscription, Error>
    where
        H: MultiHandler,
    {
        let handler = Arc::new(handler);
        let known = Arc::new(known);
        let inner = self.inner.clone();
        let format = endpoint.format().to_string();

        let delivery: DeliveryCallback = Arc::new(move |frame: BinaryMessage, raw: RawAck| {
            let handler = handler.clone();
            let known = known.clone();
            let inner = inner.clone();
            let format = format.clone();
            Box::pin(async move {
                let acker = Acker::new(raw, inner.ack_scheduler.clone());
                match known.decode(&frame.wire_type, &inner.serializer, &format, &frame.payload) {
                    None => {
                        if let Err(e) = handler.handle_unknown(&frame.wire_type, acker).await {
                            warn!("unknown-type handler for {} failed: {e}", frame.wire_type);
                        }
                    }
                    Some(Err(e)) => {
                        warn!("failed to deserialize {}: {e}", frame.wire_type);
                        acker.ack(inner.config.unack_delay, false).await;
                    }
                    Some(Ok(message)) => {
                        if let Err(e) = handler.handle(message, acker.clone()).await {
                            warn!("handler for {} failed: {e}", frame.wire_type);
                            acker.ack(inner.config.unack_delay, false).await;
                        }
                    }
                }
            })
        });

        self.install_subscription(endpoint, delivery, None).await
    }

    /// Dispatches a request and reports its outcome through callbacks:
    /// `on_response` with the first response, or `on_failure` with a
    /// timeout error at the deadline (also during shutdown) or a
    /// processing error if the response cannot be decoded. Exactly one
    /// of the two fires.
    ///
    /// # Errors
    ///
    /// Fails with a shutdown error after shutdown has begun, a
    /// serialization error if the request cannot be encoded, or a
    /// transport error.
    pub async fn request_with_callbacks<Req, Resp>(
        &self,
        request: &Req,
        endpoint: &Endpoint,
        on_response: impl FnOnce(Resp) + Send + 'static,
        on_failure: impl FnOnce(Error) + Send + 'static,
        timeout: Duration,
    ) -> Result<RequestGuard, Error>
    where
        Req: MessageType,
        Resp: MessageType,
    {
        self.ensure_active()?;
        let _operation = self.inner.operations.begin();

        let wire_type = self.inner.resolver.resolve::<Req>();
        let payload = self.inner.serializer.serialize(endpoint.format(), request)?;
        let frame = BinaryMessage::new(payload, &*wire_type);

        let failure = FailureSlot::new(on_failure);
        let deliver_slot = Arc::new(Mutex::new(Some(on_response)));

        let inner = self.inner.clone();
        let format = endpoint.format().to_string();
        let response_failure = failure.clone();
        let on_response: ResponseCallback = Arc::new(move |response: BinaryMessage| {
            let inner = inner.clone();
            let format = format.clone();
            let deliver_slot = deliver_slot.clone();
            let failure = response_failure.clone();
            Box::pin(async move {
                // Only the first response on a topic-style destination is
                // delivered; the swept handle closes the correlator.
                let deliver = deliver_slot.lock().expect("response slot poisoned").take();
                let Some(deliver) = deliver else { return };

                match inner.serializer.deserialize::<Resp>(&format, &response.payload) {
                    Ok(value) => {
                        failure.resolve();
                        deliver(value);
                    }
                    Err(e) => failure.fail(Error::Processing(Box::new(e))),
                }
                inner.request_tracker.poke();
            })
        });

        let group = self.group(endpoint).await?;
        let handle = group
            .send_request(endpoint.destination(), frame, on_response)
            .await
            .map_err(|e| {
                warn!(
                    "request {wire_type} to {}/{} failed: {e}",
                    endpoint.transport_id(),
                    endpoint.destination()
                );
                Error::Transport(e)
            })?;

        debug!(
            "request {} ({wire_type}) dispatched to {}/{}",
            handle.id(),
            endpoint.transport_id(),
            endpoint.destination()
        );
        self.inner
            .request_tracker
            .register(handle.clone(), timeout, failure);

        Ok(RequestGuard { handle })
    }

    /// Dispatches a request and awaits its response.
    ///
    /// # Errors
    ///
    /// Fails with a timeout error if no response arrives before the
    /// deadline, a shutdown error if the client begins disposing while
    /// waiting, a processing error if the response cannot be decoded, or
    /// any error of [`request_with_callbacks`](Self::request_with_callbacks).
    pub async fn request<Req, Resp>(
        &self,
        request: &Req,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> Result<Resp, Error>
    where
        Req: MessageType,
        Resp: MessageType,
    {
        let (sender, receiver) = oneshot::channel::<Result<Resp, Error>>();
        let sender = Arc::new(Mutex::new(Some(sender)));
        let failure_sender = sender.clone();

        let _guard = self
            .request_with_callbacks(
                request,
                endpoint,
                move |response: Resp| {
                    if let Some(sender) = sender.lock().expect("request waiter poisoned").take() {
                        let _ = sender.send(Ok(response));
                    }
                },
                move |error| {
                    let sender = failure_sender
                        .lock()
                        .expect("request waiter poisoned")
                        .take();
                    if let Some(sender) = sender {
                        let _ = sender.send(Err(error));
                    }
                },
                timeout,
            )
            .await?;

        tokio::select! {
            biased;
            () = self.inner.disposing.cancelled() => Err(Error::ShuttingDown),
            outcome = receiver => match outcome {
                Ok(result) => result,
                Err(_) => Err(Error::ShuttingDown),
            },
        }
    }

    /// Registers a reply handler on the endpoint. The registration heals
    /// itself: when the endpoint's transport reports a failure event, the
    /// handler is re-installed, retrying on the configured interval until
    /// it sticks.
    ///
    /// # Errors
    ///
    /// Fails with a shutdown error after shutdown has begun, or a
    /// transport error if the initial installation fails.
    pub async fn register_service<Req, H>(
        &self,
        endpoint: &Endpoint,
        handler: H,
    ) -> Result<ServiceRegistration, Error>
    where
        Req: MessageType,
        H: ServiceHandler<Req>,
    {
        self.ensure_active()?;
        let _operation = self.inner.operations.begin();

        let response_type = self.inner.resolver.resolve::<H::Response>();
        let filter = self.schema_filter::<Req>(endpoint);

        let handler = Arc::new(handler);
        let inner = self.inner.clone();
        let format = endpoint.format().to_string();
        let wire_handler: WireHandler = Arc::new(move |frame: BinaryMessage| {
            let handler = handler.clone();
            let inner = inner.clone();
            let format = format.clone();
            let response_type = response_type.clone();
            Box::pin(async move {
                let request = inner
                    .serializer
                    .deserialize::<Req>(&format, &frame.payload)
                    .map_err(|e| TransportError::Handler(e.to_string()))?;
                let response = handler
                    .handle(request)
                    .await
                    .map_err(|e| TransportError::Handler(e.to_string()))?;
                let payload = inner
                    .serializer
                    .serialize(&format, &response)
                    .map_err(|e| TransportError::Handler(e.to_string()))?;
                Ok(BinaryMessage::new(payload, &*response_type))
            })
        });

        let slot = Arc::new(RegistrationSlot {
            current: TokioMutex::new(None),
        });

        Self::try_register(&self.inner, endpoint, &slot, &wire_handler, filter.clone())
            .await
            .map_err(|e| {
                warn!(
                    "handler registration on {}/{} failed: {e}",
                    endpoint.transport_id(),
                    endpoint.destination()
                );
                Error::Transport(e)
            })?;

        let listener_stop = self.inner.disposing.child_token();
        {
            let inner = self.inner.clone();
            let endpoint = endpoint.clone();
            let slot = slot.clone();
            let wire_handler = wire_handler.clone();
            let filter = filter.clone();
            let stop = listener_stop.clone();
            tokio::spawn(async move {
                let mut events = inner.transports.subscribe_events();
                loop {
                    tokio::select! {
                        () = stop.cancelled() => break,
                        event = events.recv() => match event {
                            Ok(event)
                                if event.kind == TransportEventKind::Failure
                                    && event.transport_id == endpoint.transport_id() =>
                            {
                                Self::reinstall_until_live(
                                    &inner,
                                    &endpoint,
                                    &slot,
                                    &wire_handler,
                                    filter.clone(),
                                    &stop,
                                )
                                .await;
                            }
                            Ok(_) => {}
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!("transport event stream lagged by {skipped} events");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            });
        }

        let transport_id = endpoint.transport_id().to_string();
        let destination = endpoint.destination().to_string();
        let registry_handle = self.inner.handles.create(move || {
            Box::pin(async move {
                listener_stop.cancel();
                let current = slot.current.lock().await.take();
                if let Some(current) = current {
                    if let Err(e) = current.dispose().await {
                        warn!("failed to tear down handler on {transport_id}/{destination}: {e}");
                    }
                }
            })
        });

        Ok(ServiceRegistration {
            handle: registry_handle,
        })
    }

    /// Shuts the client down: fails outstanding requests so waiters
    /// unblock, commits pending deferred acks, drains in-flight
    /// operations, then tears down every live subscription and the
    /// transports. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.disposing.is_cancelled() {
            return;
        }
        info!("messaging client shutting down");
        self.inner.disposing.cancel();

        self.inner.request_tracker.shutdown().await;
        self.inner.ack_scheduler.shutdown().await;
        self.inner.operations.drain().await;
        self.inner.handles.dispose_all().await;
        self.inner.transports.shutdown().await;

        info!("messaging client shutdown complete");
    }

    fn ensure_active(&self) -> Result<(), Error> {
        if self.inner.disposing.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    // Typed single-schema consumers on a shared destination filter by
    // wire-type name at the transport layer.
    fn schema_filter<T: MessageType>(&self, endpoint: &Endpoint) -> Option<String> {
        endpoint
            .is_shared_destination()
            .then(|| self.inner.resolver.resolve::<T>().to_string())
    }

    async fn group(&self, endpoint: &Endpoint) -> Result<Arc<M::Group>, Error> {
        self.inner
            .transports
            .processing_group(endpoint.transport_id(), endpoint.destination())
            .await
            .map_err(|e| {
                warn!(
                    "no processing group for {}/{}: {e}",
                    endpoint.transport_id(),
                    endpoint.destination()
                );
                Error::Transport(e)
            })
    }

    async fn install_subscription(
        &self,
        endpoint: &Endpoint,
        delivery: DeliveryCallback,
        wire_type_filter: Option<String>,
    ) -> Result<Subscription, Error> {
        self.ensure_active()?;
        let _operation = self.inner.operations.begin();

        let group = self.group(endpoint).await?;
        let subscription = group
            .subscribe(endpoint.destination(), delivery, wire_type_filter)
            .await
            .map_err(|e| {
                warn!(
                    "subscribe on {}/{} failed: {e}",
                    endpoint.transport_id(),
                    endpoint.destination()
                );
                Error::Transport(e)
            })?;

        let transport_id = endpoint.transport_id().to_string();
        let destination = endpoint.destination().to_string();
        let handle = self.inner.handles.create(move || {
            Box::pin(async move {
                if let Err(e) = subscription.dispose().await {
                    warn!("failed to tear down subscription on {transport_id}/{destination}: {e}");
                }
            })
        });

        Ok(Subscription { handle })
    }

    // Swaps in a fresh transport registration under the slot lock, so
    // concurrent reinstalls cannot race.
    async fn try_register(
        inner: &Arc<ClientInner<M, S>>,
        endpoint: &Endpoint,
        slot: &Arc<RegistrationSlot>,
        wire_handler: &WireHandler,
        wire_type_filter: Option<String>,
    ) -> Result<(), TransportError> {
        let mut current = slot.current.lock().await;

        if let Some(previous) = current.take() {
            if let Err(e) = previous.dispose().await {
                debug!(
                    "stale handler teardown on {}/{} failed: {e}",
                    endpoint.transport_id(),
                    endpoint.destination()
                );
            }
        }

        let group = inner
            .transports
            .processing_group(endpoint.transport_id(), endpoint.destination())
            .await?;
        let subscription = group
            .register_handler(endpoint.destination(), wire_handler.clone(), wire_type_filter)
            .await?;
        *current = Some(subscription);

        Ok(())
    }

    async fn reinstall_until_live(
        inner: &Arc<ClientInner<M, S>>,
        endpoint: &Endpoint,
        slot: &Arc<RegistrationSlot>,
        wire_handler: &WireHandler,
        wire_type_filter: Option<String>,
        stop: &CancellationToken,
    ) {
        loop {
            match Self::try_register(inner, endpoint, slot, wire_handler, wire_type_filter.clone())
                .await
            {
                Ok(()) => {
                    info!(
                        "handler re-installed on {}/{}",
                        endpoint.transport_id(),
                        endpoint.destination()
                    );
                    break;
                }
                Err(e) => {
                    warn!(
                        "handler re-install on {}/{} failed: {e}, retrying in {:?}",
                        endpoint.transport_id(),
                        endpoint.destination(),
                        inner.config.handler_reregister_interval
                    );
                    tokio::select! {
                        () = stop.cancelled() => break,
                        () = sleep(inner.config.handler_reregister_interval) => {}
                    }
                }
            }
        }
    }
}

impl<M, S> Clone for MessagingClient<M, S>
where
    M: TransportManager,
    S: Serializer,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M, S> Debug for MessagingClient<M, S>
where
    M: TransportManager,
    S: Serializer,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagingClient")
            .field("outstanding_requests", &self.outstanding_requests())
            .field("open_handles", &self.open_handles())
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}
