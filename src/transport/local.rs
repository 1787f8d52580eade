use std::{
    collections::HashMap,
    future::Future,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use tokio::{
    select,
    sync::{
        mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
        oneshot,
    },
};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

use super::{CallId, Frame, Listener, Transport};
use crate::{
    AckReceipt, Broker, ChannelTarget, Envelope, Error, Outcome, RequestOptions, Result,
    error::panic_message,
};

type SharedListener = Arc<dyn Fn(Envelope) + Send + Sync>;

/// In-process [`Transport`] created by [`Broker::connect`].
///
/// Frames travel over unbounded channels. Dropping the transport stops its
/// reader, which closes the broker-side target so the broker forgets this
/// context. Calls still awaiting an answer then fail with
/// [`Error::TransportClosed`].
pub struct LocalTransport {
    shared: Arc<Shared>,
    _reader: DropGuard,
}

struct Shared {
    identity: Arc<str>,
    outbound: UnboundedSender<Frame>,
    calls: Mutex<HashMap<CallId, oneshot::Sender<Frame>>>,
    next_call: AtomicU64,
    listeners: Mutex<Vec<SharedListener>>,
}

impl Shared {
    /// Send a call frame and return the receiver its answer is routed to.
    fn call(&self, frame: impl FnOnce(CallId) -> Frame) -> Result<oneshot::Receiver<Frame>> {
        let call = self.next_call.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.calls.lock().insert(call, tx);
        if let Err(e) = self.outbound.send(frame(call)) {
            self.calls.lock().remove(&call);
            return Err(e.into());
        }
        Ok(rx)
    }

    fn route(&self, frame: Frame) {
        match frame {
            Frame::Push { envelope } => {
                let listeners = self.listeners.lock().clone();
                for listener in listeners {
                    let envelope = envelope.clone();
                    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(envelope))) {
                        warn!(identity = %self.identity, error = %panic_message(panic), "listener panicked");
                    }
                }
            }
            Frame::Acked { call, .. } | Frame::Response { call, .. } => {
                let waiting = self.calls.lock().remove(&call);
                match waiting {
                    Some(tx) => {
                        let _ = tx.send(frame);
                    }
                    None => debug!(identity = %self.identity, call, "answer for abandoned call"),
                }
            }
            other => {
                warn!(identity = %self.identity, kind = other.kind(), "unexpected frame from broker")
            }
        }
    }
}

impl LocalTransport {
    fn new(
        identity: Arc<str>,
        outbound: UnboundedSender<Frame>,
        inbound: UnboundedReceiver<Frame>,
    ) -> Self {
        let shared = Arc::new(Shared {
            identity,
            outbound,
            calls: Mutex::new(HashMap::new()),
            next_call: AtomicU64::new(0),
            listeners: Mutex::new(Vec::new()),
        });
        let cancel = CancellationToken::new();
        tokio::spawn(read(Arc::downgrade(&shared), inbound, cancel.clone()));
        Self {
            shared,
            _reader: cancel.drop_guard(),
        }
    }

    /// The identity the broker stamps on everything sent through this
    /// transport.
    pub fn identity(&self) -> &str {
        &self.shared.identity
    }
}

async fn read(shared: Weak<Shared>, mut inbound: UnboundedReceiver<Frame>, cancel: CancellationToken) {
    loop {
        let frame = select! {
            _ = cancel.cancelled() => break,
            frame = inbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.route(frame);
    }
    if let Some(shared) = shared.upgrade() {
        // Unblocks every caller still waiting for an answer
        shared.calls.lock().clear();
        debug!(identity = %shared.identity, "transport reader stopped");
    }
}

impl Transport for LocalTransport {
    fn send(&self, envelope: Envelope) -> Result {
        self.shared.outbound.send(Frame::OneWay { envelope })?;
        Ok(())
    }

    fn ack(&self, envelope: Envelope) -> impl Future<Output = Result<AckReceipt>> + Send {
        let answer = self.shared.call(|call| Frame::Ack { call, envelope });
        async move {
            match answer?.await {
                Ok(Frame::Acked { receipt, .. }) => Ok(receipt),
                Ok(other) => Err(Error::external(format!("unexpected {} frame", other.kind()))),
                Err(_) => Err(Error::TransportClosed),
            }
        }
    }

    fn request(
        &self,
        envelope: Envelope,
        options: RequestOptions,
    ) -> impl Future<Output = Result<Outcome>> + Send {
        let answer = self.shared.call(|call| Frame::Request {
            call,
            envelope,
            timeout_ms: options.timeout_ms(),
        });
        async move {
            match answer?.await {
                Ok(Frame::Response { outcome, .. }) => Ok(outcome),
                Ok(other) => Err(Error::external(format!("unexpected {} frame", other.kind()))),
                Err(_) => Err(Error::TransportClosed),
            }
        }
    }

    fn listen(&self, listener: Listener) -> Result {
        self.shared.listeners.lock().push(Arc::from(listener));
        Ok(())
    }
}

/// Wire a new client context to `broker` under `identity`.
pub(crate) fn connect(broker: &Broker, identity: Arc<str>) -> LocalTransport {
    let (to_broker, from_client) = unbounded_channel();
    let (to_client, from_broker) = unbounded_channel();

    broker.register_target(identity.clone(), ChannelTarget::<Frame>::new(to_client.clone()));
    tokio::spawn(serve(
        broker.clone(),
        identity.clone(),
        from_client,
        to_client,
        broker.cancel_token().child_token(),
    ));
    LocalTransport::new(identity, to_broker, from_broker)
}

/// Broker side of a local transport: run client frames through the broker
/// with `source` forced to the bound identity.
async fn serve(
    broker: Broker,
    identity: Arc<str>,
    mut inbound: UnboundedReceiver<Frame>,
    outbound: UnboundedSender<Frame>,
    cancel: CancellationToken,
) {
    loop {
        let frame = select! {
            _ = cancel.cancelled() => break,
            frame = inbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        match frame {
            Frame::OneWay { mut envelope } => {
                envelope.source = identity.to_string();
                if let Err(e) = broker.emit(envelope) {
                    warn!(identity = %identity, error = %e, "envelope rejected");
                }
            }
            Frame::Ack { call, mut envelope } => {
                envelope.source = identity.to_string();
                let receipt = broker.ack(envelope);
                if outbound.send(Frame::Acked { call, receipt }).is_err() {
                    break;
                }
            }
            Frame::Request {
                call,
                mut envelope,
                timeout_ms,
            } => {
                envelope.source = identity.to_string();
                let response = broker.request(envelope, RequestOptions::from_millis(timeout_ms));
                let outbound = outbound.clone();
                tokio::spawn(async move {
                    let outcome = response.await;
                    // The client may be gone by now
                    let _ = outbound.send(Frame::Response { call, outcome });
                });
            }
            other => warn!(identity = %identity, kind = other.kind(), "unexpected frame from client"),
        }
    }
    debug!(identity = %identity, "transport closed");
}
