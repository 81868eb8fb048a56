//! Gateway communication module
//!
//! This module owns the UDP transport loop, the heartbeat timers and the
//! notification fan-out, and exposes them through [`GatewayClient`] and its
//! cloneable [`GatewayHandle`].

mod connection;
mod dispatch;
mod heartbeat;

pub use self::dispatch::{DeliveryFailure, EventDispatcher, Subscriber, SubscriberId};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use crate::core::{Availability, CallId, Error, GatewayConfig, Result, GATEWAY_SID};
use crate::protocol::{
    classify_method, AvailabilityTracker, CallResult, EventKind, Message, MessageKind, MethodRoute,
    Notification, OutboundCall, PendingCall, Push, Request, RequestRegistry,
};
use self::connection::{Control, Queues, TransportLoop};

/// Capacity of the diagnostics channel
const DIAGNOSTIC_CAPACITY: usize = 64;

/// Capacity of the loop's control channel
const CONTROL_CAPACITY: usize = 8;

/// Something went wrong without stopping the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// A datagram could not be decoded and was dropped whole
    DecodeFailed {
        /// Datagram length
        bytes: usize,
        /// Parser error
        reason: String,
    },
    /// A message had neither `result` nor `method`
    NonParseable {
        /// The message, rendered for inspection
        message: String,
    },
    /// A push used a method nothing handles
    UnknownMethod {
        /// Method name
        method: String,
        /// Source device ID
        sid: String,
    },
    /// An event arrived from a device nobody registered
    UnknownSensor {
        /// Source device ID
        sid: String,
        /// Event name
        event: String,
    },
    /// A socket call failed
    SocketError {
        /// `send` or `receive`
        operation: &'static str,
        /// OS error text
        reason: String,
    },
    /// A subscriber returned an error or panicked
    SubscriberFailed(DeliveryFailure),
    /// A heartbeat, or a call before its deadline, could not be queued
    QueueFull,
}

/// State shared by the client, its handles, the transport loop and the timers
pub(crate) struct Shared {
    config: GatewayConfig,
    unique_id: String,
    registry: RequestRegistry,
    tracker: AvailabilityTracker,
    dispatcher: EventDispatcher,
    outbound_tx: mpsc::Sender<OutboundCall>,
    control_tx: mpsc::Sender<Control>,
    diagnostics: broadcast::Sender<Diagnostic>,
    known_sids: RwLock<HashSet<String>>,
    callbacks: TaskTracker,
}

impl Shared {
    fn new(
        config: GatewayConfig,
        outbound_tx: mpsc::Sender<OutboundCall>,
        control_tx: mpsc::Sender<Control>,
    ) -> Self {
        let (diagnostics, _) = broadcast::channel(DIAGNOSTIC_CAPACITY);
        let mut known_sids: HashSet<String> = config.sensors.iter().map(|s| s.sid.clone()).collect();
        known_sids.insert(GATEWAY_SID.to_string());

        Shared {
            unique_id: crate::util::gateway_unique_id(&config.host, config.port),
            registry: RequestRegistry::new(),
            tracker: AvailabilityTracker::new(config.missed_heartbeat_threshold),
            dispatcher: EventDispatcher::new(),
            outbound_tx,
            control_tx,
            diagnostics,
            known_sids: RwLock::new(known_sids),
            callbacks: TaskTracker::new(),
            config,
        }
    }

    /// Publishes a diagnostic; nobody listening is fine
    pub(crate) fn diagnose(&self, diagnostic: Diagnostic) {
        let _ = self.diagnostics.send(diagnostic);
    }

    fn broadcast(&self, notification: &Notification) {
        for failure in self.dispatcher.broadcast(notification) {
            self.diagnose(Diagnostic::SubscriberFailed(failure));
        }
    }

    fn notify_availability(&self, availability: Availability) {
        self.broadcast(&Notification::availability(availability));
    }

    /// A datagram arrived; must run before its messages are routed
    pub(crate) fn record_receive(&self) {
        if let Some(change) = self.tracker.record_receive() {
            self.notify_availability(change);
        }
    }

    /// Nothing answered the start-up probe
    pub(crate) fn record_probe_unanswered(&self) {
        if let Some(change) = self.tracker.mark_unavailable() {
            self.notify_availability(change);
        }
    }

    /// Asks the transport loop to send a heartbeat probe
    pub(crate) fn request_heartbeat(&self) {
        match self.control_tx.try_send(Control::Heartbeat) {
            Ok(()) => trace!("Queued heartbeat"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Control queue full, heartbeat dropped");
                self.diagnose(Diagnostic::QueueFull);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Control queue closed, heartbeat dropped");
            }
        }
    }

    /// Asks the transport loop to judge missed heartbeats
    pub(crate) fn request_evaluation(&self) {
        if let Err(e) = self.control_tx.try_send(Control::Evaluate) {
            // A queued evaluation covers this one
            debug!(error = %e, "Availability check not queued");
        }
    }

    /// Judges missed heartbeats; runs on the transport loop
    pub(crate) fn evaluate_availability(&self) {
        if let Some(change) = self.tracker.evaluate() {
            self.notify_availability(change);
        }
    }

    /// Queues a registered call and waits for its outcome. The queue wait
    /// counts against `deadline`.
    async fn submit(
        &self,
        id: CallId,
        pending: PendingCall,
        request: Request,
        deadline: Duration,
    ) -> Result<CallResult> {
        let started = Instant::now();
        match timeout(deadline, self.outbound_tx.send(OutboundCall::new(id, request))).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                self.registry.cancel(id);
                return Err(Error::queue("Outbound queue closed"));
            }
            Err(_) => {
                warn!(id, "Outbound queue full until the call deadline");
                self.diagnose(Diagnostic::QueueFull);
                self.registry.timeout(id);
                return Ok(CallResult::NoResult);
            }
        }

        let remaining = deadline.saturating_sub(started.elapsed());
        Ok(self.registry.wait(id, pending, remaining).await)
    }

    /// Routes one decoded message
    pub(crate) fn route(&self, message: Message) {
        match message.kind() {
            MessageKind::Response => {
                if let (Some(id), Some(result)) = (message.id, message.result) {
                    if !self.registry.resolve(id, result) {
                        trace!(id, "Response without a waiting caller");
                    }
                } else {
                    debug!("Response without an id ignored");
                }
            }
            MessageKind::Push => self.route_push(message),
            MessageKind::Invalid => {
                error!(?message, "Non-parseable data");
                self.diagnose(Diagnostic::NonParseable {
                    message: format!("{:?}", message),
                });
            }
        }
    }

    fn route_push(&self, message: Message) {
        let Message { method, params, model, sid, .. } = message;
        let Some(method) = method else {
            return;
        };

        let kind = match classify_method(&method) {
            MethodRoute::Dispatch(kind) => kind,
            MethodRoute::Internal | MethodRoute::Ignored => {
                trace!(%method, "Dropping push");
                return;
            }
            MethodRoute::Unknown => {
                info!(%method, %sid, "Received unknown method");
                self.diagnose(Diagnostic::UnknownMethod { method, sid });
                return;
            }
        };

        if let EventKind::Event(event) = &kind {
            debug!(%model, %sid, %event, "Received event");
            if !self.known_sids.read().contains(&sid) {
                warn!(%model, %sid, %event, "Received event from unregistered sensor");
                self.diagnose(Diagnostic::UnknownSensor {
                    sid: sid.clone(),
                    event: event.clone(),
                });
            }
        }

        self.broadcast(&Notification::Push(Push { model, sid, kind, params }));
    }
}

/// Cloneable access to a running gateway client
#[derive(Clone)]
pub struct GatewayHandle {
    shared: Arc<Shared>,
}

impl GatewayHandle {
    fn prepare(&self, request: Request) -> OutboundCall {
        if request.is_ping() {
            OutboundCall { id: None, request }
        } else {
            OutboundCall::new(self.shared.registry.allocate(), request)
        }
    }

    async fn enqueue(&self, call: OutboundCall) -> Result<()> {
        self.shared
            .outbound_tx
            .send(call)
            .await
            .map_err(|_| Error::queue("Outbound queue closed"))
    }

    /// Queues a request without waiting for an answer.
    ///
    /// Waits only while the outbound queue is full.
    pub async fn send(&self, request: Request) -> Result<()> {
        self.enqueue(self.prepare(request)).await
    }

    /// Queues a request without waiting, failing if the queue is full
    pub fn try_send(&self, request: Request) -> Result<()> {
        self.shared
            .outbound_tx
            .try_send(self.prepare(request))
            .map_err(|e| Error::queue(format!("Failed to queue request: {}", e)))
    }

    /// Queues a request from a thread outside the async runtime
    pub fn send_blocking(&self, request: Request) -> Result<()> {
        self.shared
            .outbound_tx
            .blocking_send(self.prepare(request))
            .map_err(|_| Error::queue("Outbound queue closed"))
    }

    /// Heartbeat probes go out without an id, so nothing could answer them
    fn awaitable(request: &Request) -> Result<()> {
        if request.is_ping() {
            return Err(Error::protocol("Heartbeat probes carry no id and cannot be awaited"));
        }
        Ok(())
    }

    /// Sends a request and waits for its answer using the configured timeout
    pub async fn call(&self, request: Request) -> Result<CallResult> {
        self.call_with_timeout(request, self.shared.config.call_timeout).await
    }

    /// Sends a request and waits up to `deadline` for its answer, including
    /// any time spent waiting for room in the outbound queue
    pub async fn call_with_timeout(&self, request: Request, deadline: Duration) -> Result<CallResult> {
        Self::awaitable(&request)?;
        let (id, pending) = self.shared.registry.register_new();
        self.shared.submit(id, pending, request, deadline).await
    }

    /// Sends a request and runs `callback` exactly once with its outcome.
    ///
    /// The callback runs on a task that [`GatewayClient::stop`] waits for;
    /// calls still pending at stop complete with [`CallResult::NoResult`].
    pub async fn send_with_callback<F>(&self, request: Request, callback: F) -> Result<CallId>
    where
        F: FnOnce(CallResult) + Send + 'static,
    {
        Self::awaitable(&request)?;
        let (id, pending) = self.shared.registry.register_new();

        debug!(id, "Added callback for call");
        let shared = self.shared.clone();
        let deadline = shared.config.call_timeout;
        self.shared.callbacks.spawn(async move {
            let result = match shared.submit(id, pending, request, deadline).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(id, error = %e, "Call not sent");
                    CallResult::NoResult
                }
            };
            callback(result);
        });
        Ok(id)
    }

    /// Asks the gateway to accept new Zigbee devices
    pub async fn start_zigbee_join(&self) -> Result<()> {
        self.send(Request::new("start_zigbee_join")).await
    }

    /// Registers a subscriber for pushes and availability changes
    pub fn subscribe<S>(&self, subscriber: S) -> SubscriberId
    where
        S: Subscriber + 'static,
    {
        self.shared.dispatcher.subscribe(Arc::new(subscriber))
    }

    /// Marks a device ID as expected
    pub fn append_known_sid(&self, sid: impl Into<String>) {
        self.shared.known_sids.write().insert(sid.into());
    }

    /// Whether events from `sid` are expected
    pub fn is_known_sid(&self, sid: &str) -> bool {
        self.shared.known_sids.read().contains(sid)
    }

    /// Current liveness of the gateway
    pub fn availability(&self) -> Availability {
        self.shared.tracker.current()
    }

    /// Whether the gateway is currently considered reachable
    pub fn is_available(&self) -> bool {
        self.shared.tracker.is_available()
    }

    /// Heartbeats sent since the gateway last answered
    pub fn missed_heartbeats(&self) -> u32 {
        self.shared.tracker.missed_heartbeats()
    }

    /// Asks the transport loop to send a heartbeat probe; for hosts that run
    /// their own scheduler
    pub fn send_heartbeat(&self) {
        self.shared.request_heartbeat();
    }

    /// Asks the transport loop to judge missed heartbeats; for hosts that run
    /// their own scheduler. Any resulting notification is delivered from the
    /// loop.
    pub fn evaluate_availability(&self) {
        self.shared.request_evaluation();
    }

    /// Receiver for non-fatal failures
    pub fn diagnostics(&self) -> broadcast::Receiver<Diagnostic> {
        self.shared.diagnostics.subscribe()
    }

    /// Calls still waiting for an answer
    pub fn pending_calls(&self) -> usize {
        self.shared.registry.pending_count()
    }

    /// Stable identifier derived from the gateway address
    pub fn unique_id(&self) -> &str {
        &self.shared.unique_id
    }

    /// Client configuration
    pub fn config(&self) -> &GatewayConfig {
        &self.shared.config
    }
}

/// Tasks owned by a started client
struct Worker {
    shutdown: CancellationToken,
    transport: JoinHandle<Queues>,
    timers: Vec<JoinHandle<()>>,
}

/// Client for one gateway.
///
/// Construction only validates the configuration; [`start`](Self::start)
/// opens the socket and spawns the transport loop, [`stop`](Self::stop)
/// waits for every task to finish and releases the socket.
pub struct GatewayClient {
    handle: GatewayHandle,
    queues: Option<Queues>,
    worker: Option<Worker>,
}

impl GatewayClient {
    /// Creates a stopped client
    pub fn new(config: GatewayConfig) -> Result<Self> {
        config.validate()?;
        let (outbound_tx, outbound) = mpsc::channel(config.queue_capacity);
        let (control_tx, control) = mpsc::channel(CONTROL_CAPACITY);
        let shared = Arc::new(Shared::new(config, outbound_tx, control_tx));

        Ok(GatewayClient {
            handle: GatewayHandle { shared },
            queues: Some(Queues { outbound, control }),
            worker: None,
        })
    }

    /// Returns a handle for consumers
    pub fn handle(&self) -> GatewayHandle {
        self.handle.clone()
    }

    /// Whether the transport loop is running
    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Opens the socket and starts the transport loop and timers
    pub async fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Err(Error::invalid_state("Gateway client already started"));
        }
        let shared = self.handle.shared.clone();
        let socket = connection::open_socket(&shared.config.host, shared.config.port).await?;
        let queues = self
            .queues
            .take()
            .ok_or_else(|| Error::invalid_state("Queues were lost by a failed transport loop"))?;

        info!(host = %shared.config.host, port = shared.config.port, "Starting gateway client");
        let shutdown = CancellationToken::new();
        let transport = tokio::spawn(
            TransportLoop::new(socket, queues, shared.clone(), shutdown.clone()).run(),
        );

        let mut timers = Vec::new();
        if shared.config.schedule_heartbeats {
            timers.push(tokio::spawn(heartbeat::run_heartbeat(shared.clone(), shutdown.clone())));
            timers.push(tokio::spawn(heartbeat::run_availability_check(shared, shutdown.clone())));
        }

        self.worker = Some(Worker {
            shutdown,
            transport,
            timers,
        });
        Ok(())
    }

    /// Stops the timers and the transport loop and waits for them to exit.
    ///
    /// Calls still pending complete with [`CallResult::NoResult`], and their
    /// callbacks have run by the time this returns.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        info!("Stopping gateway client");
        worker.shutdown.cancel();

        for joined in futures::future::join_all(worker.timers).await {
            if let Err(e) = joined {
                warn!(error = %e, "Timer task failed");
            }
        }

        let transport = worker.transport.await;

        // No answer can arrive without the loop
        let shared = &self.handle.shared;
        let expired = shared.registry.expire_all();
        if expired > 0 {
            debug!(expired, "Expired pending calls");
        }
        shared.callbacks.close();
        shared.callbacks.wait().await;
        shared.callbacks.reopen();

        let queues = transport.map_err(|e| Error::invalid_state(format!("Transport loop failed: {}", e)))?;
        self.queues = Some(queues);
        Ok(())
    }
}

impl std::ops::Deref for GatewayClient {
    type Target = GatewayHandle;

    fn deref(&self) -> &GatewayHandle {
        &self.handle
    }
}

impl Drop for GatewayClient {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            warn!("Gateway client dropped without stop; cancelling tasks");
            worker.shutdown.cancel();
        }
    }
}
