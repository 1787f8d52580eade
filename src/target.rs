use futures_util::{FutureExt, future::BoxFuture};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use crate::{Envelope, Error, Result};

/// A named endpoint the broker forwards envelopes to, such as a client
/// context behind a transport.
///
/// Registered with [`Broker::register_target`](crate::Broker::register_target).
/// The broker removes the target as soon as the future returned by
/// [`closed`](Target::closed) completes.
pub trait Target: Send + Sync + 'static {
    /// Hand an envelope over to the endpoint. Must not block.
    fn deliver(&self, envelope: &Envelope) -> Result;

    /// Completes once the endpoint is gone for good.
    fn closed(&self) -> BoxFuture<'static, ()>;
}

/// A [`Target`] feeding an unbounded channel.
///
/// Each delivered envelope is converted into `M`, so the same target serves
/// plain envelope consumers and transports that wrap envelopes in frames.
/// The target is closed once the receiving half is dropped.
#[derive(Debug)]
pub struct ChannelTarget<M = Envelope> {
    sender: UnboundedSender<M>,
}

impl<M: From<Envelope> + Send + 'static> ChannelTarget<M> {
    pub fn new(sender: UnboundedSender<M>) -> Self {
        Self { sender }
    }

    /// Create a target together with the receiver it delivers to.
    pub fn channel() -> (Self, UnboundedReceiver<M>) {
        let (tx, rx) = unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl<M: From<Envelope> + Send + 'static> Target for ChannelTarget<M> {
    fn deliver(&self, envelope: &Envelope) -> Result {
        self.sender
            .send(M::from(envelope.clone()))
            .map_err(|_| Error::TargetClosed)
    }

    fn closed(&self) -> BoxFuture<'static, ()> {
        let sender = self.sender.clone();
        async move { sender.closed().await }.boxed()
    }
}
