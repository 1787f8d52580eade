use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, Ordering},
};

use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    AckReceipt, Destination, Draft, Envelope, Error, Exchange, Handler, Outcome, RequestOptions,
    Result, Subscription, Transport, topic::Topics,
};

/// The side of the bus living in an isolated context.
///
/// A client owns one [`Transport`] and multiplexes its single inbound
/// listener into per-type handler sets. The listener is installed lazily,
/// on the first [`on`](Client::on) or [`once`](Client::once), and exactly
/// once for the client's lifetime.
///
/// Handlers registered on a client must not capture a clone of it: the
/// client would own itself and never disconnect. Capture a [`WeakClient`]
/// from [`downgrade`](Client::downgrade) instead.
///
/// ```rust,no_run
/// use switchboard::{Broker, Client, Draft, RequestOptions, RoutingPolicy};
///
/// # async fn run() -> switchboard::Result {
/// let broker = Broker::new(RoutingPolicy::new().allow("risk", ["RISK_CHECK"]));
/// let client = Client::new("workbench", broker.connect("workbench"));
///
/// let outcome = client
///     .request(Draft::new("RISK_CHECK", "risk"), RequestOptions::default())
///     .await;
/// println!("passed? {:?}", outcome.data);
/// # Ok(())
/// # }
/// ```
pub struct Client<T: Transport> {
    inner: Arc<ClientInner<T>>,
}

struct ClientInner<T> {
    identity: Arc<str>,
    transport: T,
    topics: Topics,
    listening: AtomicBool,
}

impl<T: Transport> Clone for Client<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> Client<T> {
    pub fn new(identity: impl Into<Arc<str>>, transport: T) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                identity: identity.into(),
                transport,
                topics: Topics::default(),
                listening: AtomicBool::new(false),
            }),
        }
    }

    pub fn identity(&self) -> &str {
        &self.inner.identity
    }

    pub fn downgrade(&self) -> WeakClient<T> {
        WeakClient {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    fn ensure_listening(&self) -> Result {
        if self.inner.listening.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let topics = self.inner.topics.clone();
        let listener = Box::new(move |envelope: Envelope| {
            topics.dispatch(&envelope);
        });
        if let Err(e) = self.inner.transport.listen(listener) {
            self.inner.listening.store(false, Ordering::Release);
            return Err(e);
        }
        debug!(identity = %self.inner.identity, "listening for inbound envelopes");
        Ok(())
    }

    /// Register a handler for envelopes of `event_type` forwarded to this
    /// context.
    pub fn on(&self, event_type: &str, handler: Handler) -> Result<Subscription> {
        self.ensure_listening()?;
        Ok(self.inner.topics.on(event_type, handler))
    }

    /// Register a handler that runs at most once.
    pub fn once(&self, event_type: &str, handler: Handler) -> Result<Subscription> {
        self.ensure_listening()?;
        Ok(self.inner.topics.once(event_type, handler))
    }

    /// Remove `handler` from `event_type`, or all of its handlers if `None`.
    pub fn off(&self, event_type: &str, handler: Option<&Handler>) {
        self.inner.topics.off(event_type, handler)
    }

    pub fn handler_count(&self, event_type: &str) -> usize {
        self.inner.topics.len(event_type)
    }

    /// Send one way. The broker may still reject the envelope; use
    /// [`ack`](Client::ack) to find out.
    pub fn emit(&self, draft: Draft) -> Result {
        self.inner.transport.send(draft.stamp(&self.inner.identity))
    }

    /// Send and wait until the broker has accepted or rejected the envelope.
    pub async fn ack(&self, draft: Draft) -> Result<AckReceipt> {
        self.inner
            .transport
            .ack(draft.stamp(&self.inner.identity))
            .await
    }

    /// Send a request and wait for its settled outcome.
    ///
    /// Never fails outright: a broken transport settles as a failed outcome
    /// too.
    pub async fn request(&self, draft: Draft, options: RequestOptions) -> Outcome {
        let envelope = draft.stamp(&self.inner.identity);
        let id = envelope.id.clone();
        match self.inner.transport.request(envelope, options).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(identity = %self.inner.identity, id = %id, error = %e, "request failed");
                Outcome::failure(&e)
            }
        }
    }

    /// Send a typed request and decode its reply.
    pub async fn request_typed<M: Exchange>(
        &self,
        message: &M,
        destination: Option<Destination>,
        options: RequestOptions,
    ) -> Result<M::Response> {
        let mut draft = Draft::message(message)?;
        draft.target = destination;
        self.request(draft, options).await.decode()
    }

    /// Reply to an envelope received through this client.
    pub fn respond<P: Serialize>(&self, request: &Envelope, payload: P) -> Result {
        let reply = request.reply(&*self.inner.identity, serde_json::to_value(payload)?);
        self.inner.transport.send(reply)
    }
}

/// A handle to a [`Client`] that doesn't keep it alive.
pub struct WeakClient<T: Transport> {
    inner: Weak<ClientInner<T>>,
}

impl<T: Transport> Clone for WeakClient<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> WeakClient<T> {
    pub fn upgrade(&self) -> Option<Client<T>> {
        self.inner.upgrade().map(|inner| Client { inner })
    }

    /// Reply through the client, failing with [`Error::TransportClosed`] once
    /// it is gone.
    pub fn respond<P: Serialize>(&self, request: &Envelope, payload: P) -> Result {
        self.upgrade()
            .ok_or(Error::TransportClosed)?
            .respond(request, payload)
    }
}
