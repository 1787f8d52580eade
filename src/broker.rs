use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    path::PathBuf,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::{runtime::Handle, select};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    AckReceipt, AuditSink, Config, Envelope, Error, Handler, NoopAudit, Outcome, PendingResponse,
    PolicyStore, RequestOptions, Result, RoutingPolicy, Subscription, Target,
    error::panic_message,
    internal::{PendingRequest, PendingTable, TargetRegistry, run_sweeper},
    topic::Topics,
    transport::local::{self, LocalTransport},
};

/// The privileged end of the bus.
///
/// - `emit(envelope)` runs the pipeline: correlation, validation, audit,
///   local handlers, forwarding.
/// - `request(envelope, options)` registers a pending entry and emits;
///   the returned [`PendingResponse`] settles exactly once.
/// - `ack(envelope)` emits and confirms acceptance without waiting for any
///   reply.
/// - `on`/`once`/`off` manage handlers running inside the broker itself.
/// - `register_target(name, target)` makes a target reachable by name, and
///   `connect(identity)` creates an in-process client transport.
/// - `start()` spawns the sweep; `shutdown()` settles everything pending and
///   stops background tasks.
///
/// The broker is cheap to clone; clones share state. Handlers that capture a
/// clone keep the broker alive until they are removed or the broker is shut
/// down.
///
/// See also: [`Client`](crate::Client), [`RoutingPolicy`].
#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    policy: Arc<PolicyStore>,
    audit: Box<dyn AuditSink>,
    topics: Topics,
    targets: Mutex<TargetRegistry>,
    pending: Mutex<PendingTable>,
    cancel_token: CancellationToken,
    started: AtomicBool,
}

#[derive(Clone)]
pub(crate) struct WeakBroker(Weak<Inner>);

impl WeakBroker {
    pub fn upgrade(&self) -> Option<Broker> {
        self.0.upgrade().map(|inner| Broker { inner })
    }
}

/// Assembles a [`Broker`] from configuration, policy and audit sink.
///
/// ```rust
/// use switchboard::{Broker, Config, RoutingPolicy, TracingAudit};
///
/// let broker = Broker::builder()
///     .config(Config::default().with_max_pending(500))
///     .policy(RoutingPolicy::new().allow("risk", ["RISK_CHECK"]))
///     .audit(TracingAudit)
///     .build();
/// ```
pub struct BrokerBuilder {
    config: Config,
    policy: Arc<PolicyStore>,
    audit: Box<dyn AuditSink>,
}

impl BrokerBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn policy(mut self, policy: RoutingPolicy) -> Self {
        self.policy = Arc::new(PolicyStore::new(policy));
        self
    }

    /// Share an existing store, e.g. one already reloaded from a file.
    pub fn policy_store(mut self, store: Arc<PolicyStore>) -> Self {
        self.policy = store;
        self
    }

    pub fn audit<A: AuditSink>(mut self, audit: A) -> Self {
        self.audit = Box::new(audit);
        self
    }

    pub fn build(self) -> Broker {
        Broker {
            inner: Arc::new(Inner {
                config: self.config,
                policy: self.policy,
                audit: self.audit,
                topics: Topics::default(),
                targets: Mutex::new(TargetRegistry::default()),
                pending: Mutex::new(PendingTable::default()),
                cancel_token: CancellationToken::new(),
                started: AtomicBool::new(false),
            }),
        }
    }
}

impl Default for BrokerBuilder {
    fn default() -> Self {
        Self {
            config: Config::default(),
            policy: Arc::new(PolicyStore::new(RoutingPolicy::new())),
            audit: Box::new(NoopAudit),
        }
    }
}

impl Broker {
    /// Create a broker with default configuration and no audit sink.
    pub fn new(policy: RoutingPolicy) -> Self {
        Self::builder().policy(policy).build()
    }

    pub fn builder() -> BrokerBuilder {
        BrokerBuilder::default()
    }

    pub(crate) fn downgrade(&self) -> WeakBroker {
        WeakBroker(Arc::downgrade(&self.inner))
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The broker's own identity, used as `source` of envelopes it emits.
    pub fn identity(&self) -> &str {
        &self.inner.config.identity
    }

    /// The store holding the active routing policy; reload through it.
    pub fn policy(&self) -> &Arc<PolicyStore> {
        &self.inner.policy
    }

    /// Spawn the sweep in a background task. Must be called within a Tokio
    /// runtime.
    pub fn start(&self) -> Result {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(Error::BrokerAlreadyStarted);
        }
        tokio::spawn(run_sweeper(
            self.downgrade(),
            self.inner.config.sweep_interval,
            self.inner.cancel_token.child_token(),
        ));
        info!(identity = %self.identity(), "broker started");
        Ok(())
    }

    /// Watch a policy file and reload it whenever it changes, keeping the
    /// previous policy when the new document is malformed. The watcher stops
    /// on [`shutdown`](Broker::shutdown).
    pub fn watch_policy(&self, path: impl Into<PathBuf>) {
        tokio::spawn(self.inner.policy.clone().watch(
            path.into(),
            self.inner.config.policy_poll_interval,
            self.inner.cancel_token.child_token(),
        ));
    }

    /// Stop background tasks, settle every pending request with `shutdown`,
    /// and drop all handlers and targets.
    pub fn shutdown(&self) {
        self.inner.cancel_token.cancel();
        let pending: Vec<_> = self.inner.pending.lock().drain().collect();
        for (_, request) in pending {
            request.resolve(Outcome::failure(&Error::Shutdown));
        }
        self.inner.topics.clear_all();
        self.inner.targets.lock().clear();
        info!(identity = %self.identity(), "broker shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.cancel_token.is_cancelled()
    }

    /// Make `target` reachable under `name`, replacing any previous target of
    /// that name. The target is removed automatically once it reports
    /// closure.
    pub fn register_target<T: Target>(&self, name: impl Into<Arc<str>>, target: T) {
        let name = name.into();
        let target: Arc<dyn Target> = Arc::new(target);
        let closed = target.closed();
        let generation = self.inner.targets.lock().insert(name.clone(), target);
        info!(name = %name, "target registered");

        let Ok(runtime) = Handle::try_current() else {
            warn!(name = %name, "no runtime, target won't be removed on closure");
            return;
        };
        let broker = self.downgrade();
        let cancel = self.inner.cancel_token.child_token();
        runtime.spawn(async move {
            select! {
                _ = cancel.cancelled() => {},
                _ = closed => {
                    if let Some(broker) = broker.upgrade() {
                        if broker.inner.targets.lock().remove_generation(&name, generation) {
                            info!(name = %name, "target closed and removed");
                        }
                    }
                }
            }
        });
    }

    pub fn unregister_target(&self, name: &str) -> bool {
        let removed = self.inner.targets.lock().remove(name);
        if removed {
            info!(name, "target unregistered");
        }
        removed
    }

    /// Names of the registered targets, sorted.
    pub fn target_names(&self) -> Vec<String> {
        self.inner.targets.lock().names()
    }

    /// Create an in-process transport for a client context bound to
    /// `identity`, and register that context as a target.
    ///
    /// Every envelope arriving through the transport has its `source`
    /// overwritten with `identity`. Must be called within a Tokio runtime.
    pub fn connect(&self, identity: impl Into<Arc<str>>) -> LocalTransport {
        local::connect(self, identity.into())
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel_token
    }

    /// Register a broker-local handler for `event_type`.
    pub fn on(&self, event_type: &str, handler: Handler) -> Subscription {
        self.inner.topics.on(event_type, handler)
    }

    /// Register a broker-local handler that runs at most once.
    pub fn once(&self, event_type: &str, handler: Handler) -> Subscription {
        self.inner.topics.once(event_type, handler)
    }

    /// Remove `handler` from `event_type`, or all of its handlers if `None`.
    pub fn off(&self, event_type: &str, handler: Option<&Handler>) {
        self.inner.topics.off(event_type, handler)
    }

    pub fn handler_count(&self, event_type: &str) -> usize {
        self.inner.topics.len(event_type)
    }

    /// Run an envelope through the pipeline.
    ///
    /// 1. A reply matching a pending request settles that request and stops.
    /// 2. The routing policy validates the envelope; a failure is returned
    ///    before any side effect.
    /// 3. The audit sink records it; audit failures are logged only.
    /// 4. Local handlers for its type run in registration order.
    /// 5. It is forwarded to every target (broadcast), to the named target if
    ///    registered, or nowhere if it has no target.
    pub fn emit(&self, envelope: Envelope) -> Result {
        if let Some(reply_to) = envelope.reply_to.as_deref() {
            let matched = self.inner.pending.lock().take(reply_to);
            if let Some(request) = matched {
                debug!(id = %envelope.id, reply_to, age = ?request.age(), "reply matched pending request");
                request.resolve(Outcome::success(envelope.payload));
                return Ok(());
            }
        }

        if let Err(e) = self.inner.policy.validate(&envelope) {
            debug!(
                id = %envelope.id,
                event_type = %envelope.event_type,
                domain = %envelope.domain,
                source = %envelope.source,
                error = %e,
                "envelope rejected"
            );
            return Err(e.into());
        }

        self.audit(&envelope);
        self.inner.topics.dispatch(&envelope);
        self.forward(&envelope);
        Ok(())
    }

    fn audit(&self, envelope: &Envelope) {
        let result = catch_unwind(AssertUnwindSafe(|| self.inner.audit.record(envelope)))
            .unwrap_or_else(|panic| Err(Error::AuditFailure(panic_message(panic))));
        if let Err(e) = result {
            warn!(id = %envelope.id, event_type = %envelope.event_type, error = %e, "audit failed");
        }
    }

    fn forward(&self, envelope: &Envelope) {
        let Some(destination) = &envelope.target else {
            return;
        };
        let targets = self.inner.targets.lock().resolve(destination);
        if targets.is_empty() && !destination.is_broadcast() {
            debug!(id = %envelope.id, destination = %destination, "target not registered, dropping");
            return;
        }
        for (name, target) in targets {
            if let Err(e) = target.deliver(envelope) {
                debug!(id = %envelope.id, name = %name, error = %e, "delivery failed");
            }
        }
    }

    /// Emit a request and wait for its reply.
    ///
    /// Assigns an id if the envelope has none. When the pending table is full
    /// the request is answered with `over_capacity` without being emitted.
    /// Otherwise the returned future settles with the reply's payload, with
    /// `timeout` once the timeout (or [`Config::default_timeout`]) elapses,
    /// or with the validation error if the envelope is rejected.
    ///
    /// Registration and emission happen before this function returns, so a
    /// reply can't overtake its request. Must be called within a Tokio
    /// runtime.
    pub fn request(&self, mut envelope: Envelope, options: RequestOptions) -> PendingResponse {
        envelope.ensure_id();
        let id: Arc<str> = Arc::from(envelope.id.as_str());
        let timeout = options.timeout.unwrap_or(self.inner.config.default_timeout);

        let receiver = {
            let mut pending = self.inner.pending.lock();
            if pending.len() >= self.inner.config.max_pending {
                warn!(id = %id, pending = pending.len(), "pending table full, rejecting request");
                return PendingResponse::settled(Outcome::failure(&Error::OverCapacity));
            }
            if pending.contains(&id) {
                return PendingResponse::settled(Outcome::failure(&Error::DuplicateRequest(
                    id.to_string(),
                )));
            }
            let (resolver, receiver) = tokio::sync::oneshot::channel();
            let timer = self.spawn_timer(id.clone(), timeout);
            pending.insert(id.clone(), PendingRequest::new(resolver, timeout).with_timer(timer));
            receiver
        };

        if let Err(e) = self.emit(envelope) {
            let rejected = self.inner.pending.lock().take(&id);
            if let Some(request) = rejected {
                request.resolve(Outcome::failure(&e));
            }
        }
        PendingResponse::waiting(receiver)
    }

    fn spawn_timer(&self, id: Arc<str>, timeout: std::time::Duration) -> tokio::task::AbortHandle {
        let broker = self.downgrade();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(broker) = broker.upgrade() else {
                return;
            };
            let expired = broker.inner.pending.lock().take(&id);
            if let Some(request) = expired {
                debug!(id = %id, ?timeout, "request timed out");
                request.expire();
            }
        })
        .abort_handle()
    }

    /// Emit an envelope and confirm acceptance into the pipeline.
    ///
    /// Never registers a pending entry and never waits for a reply. A
    /// rejected envelope yields a receipt carrying the error.
    pub fn ack(&self, mut envelope: Envelope) -> AckReceipt {
        let id = envelope.ensure_id().to_owned();
        match self.emit(envelope) {
            Ok(()) => AckReceipt::accepted(id),
            Err(e) => AckReceipt::rejected(id, &e),
        }
    }

    /// Reply to `request` from the broker itself.
    pub fn respond<P: Serialize>(&self, request: &Envelope, payload: P) -> Result {
        let reply = request.reply(self.identity(), serde_json::to_value(payload)?);
        self.emit(reply)
    }

    /// Evict pending requests past their expiry, settling their callers with
    /// `timeout`. Only catches entries whose timers failed to fire; returns
    /// how many were evicted.
    pub fn sweep(&self) -> usize {
        let expired = self
            .inner
            .pending
            .lock()
            .take_expired(tokio::time::Instant::now());
        let evicted = expired.len();
        for (id, request) in expired {
            debug!(id = %id, age = ?request.age(), "evicting expired request");
            request.resolve(Outcome::failure(&Error::Timeout));
        }
        evicted
    }

    /// Number of requests awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }
}
