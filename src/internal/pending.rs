use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use tokio::{sync::oneshot, task::AbortHandle, time::Instant};

use crate::{Error, Outcome};

/// Deadline used when `created_at + timeout` would overflow.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// A request awaiting its reply.
///
/// Consumed by exactly one of: a matching reply, its timer, the sweep or a
/// broker shutdown. The resolver is a oneshot sender, so an entry can settle
/// its caller only once.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    resolver: oneshot::Sender<Outcome>,
    timer: Option<AbortHandle>,
    created_at: Instant,
    expires_at: Instant,
}

impl PendingRequest {
    pub fn new(resolver: oneshot::Sender<Outcome>, timeout: Duration) -> Self {
        let created_at = Instant::now();
        Self {
            resolver,
            timer: None,
            created_at,
            expires_at: created_at
                .checked_add(timeout)
                .unwrap_or_else(|| created_at + FAR_FUTURE),
        }
    }

    pub fn with_timer(mut self, timer: AbortHandle) -> Self {
        self.timer = Some(timer);
        self
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }

    /// Settle the caller and cancel the timer.
    pub fn resolve(mut self, outcome: Outcome) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        // The caller may have stopped waiting; nothing to do then.
        let _ = self.resolver.send(outcome);
    }

    /// Settle the caller from the timer task itself.
    pub fn expire(self) {
        let _ = self.resolver.send(Outcome::failure(&Error::Timeout));
    }
}

/// Correlation table keyed by request id.
#[derive(Debug, Default)]
pub(crate) struct PendingTable {
    entries: HashMap<Arc<str>, PendingRequest>,
}

impl PendingTable {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn insert(&mut self, id: Arc<str>, request: PendingRequest) {
        self.entries.insert(id, request);
    }

    pub fn take(&mut self, id: &str) -> Option<PendingRequest> {
        self.entries.remove(id)
    }

    /// Remove and return every entry past its expiry.
    pub fn take_expired(&mut self, now: Instant) -> Vec<(Arc<str>, PendingRequest)> {
        let expired: Vec<Arc<str>> = self
            .entries
            .iter()
            .filter(|(_, request)| request.is_expired(now))
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|request| (id, request)))
            .collect()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (Arc<str>, PendingRequest)> + '_ {
        self.entries.drain()
    }
}

/// Future returned by [`Broker::request`](crate::Broker::request).
///
/// Always settles: with the reply's data, or with a failure such as
/// `timeout`, `over_capacity` or `shutdown`.
#[derive(Debug)]
pub struct PendingResponse {
    state: State,
}

#[derive(Debug)]
enum State {
    Settled(Option<Outcome>),
    Waiting(oneshot::Receiver<Outcome>),
}

impl PendingResponse {
    pub(crate) fn settled(outcome: Outcome) -> Self {
        Self {
            state: State::Settled(Some(outcome)),
        }
    }

    pub(crate) fn waiting(receiver: oneshot::Receiver<Outcome>) -> Self {
        Self {
            state: State::Waiting(receiver),
        }
    }
}

impl Future for PendingResponse {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            State::Settled(outcome) => Poll::Ready(
                outcome
                    .take()
                    .unwrap_or_else(|| Outcome::failure(&Error::Shutdown)),
            ),
            // A dropped resolver means the entry was discarded unsettled
            State::Waiting(receiver) => Pin::new(receiver)
                .poll(cx)
                .map(|result| result.unwrap_or_else(|_| Outcome::failure(&Error::Shutdown))),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_take_expired() {
        let mut table = PendingTable::default();
        let (short_tx, short_rx) = oneshot::channel();
        let (long_tx, _long_rx) = oneshot::channel();
        table.insert(Arc::from("short"), PendingRequest::new(short_tx, Duration::from_millis(100)));
        table.insert(Arc::from("long"), PendingRequest::new(long_tx, Duration::from_secs(10)));

        tokio::time::advance(Duration::from_millis(150)).await;
        let expired = table.take_expired(Instant::now());

        assert_eq!(expired.len(), 1);
        assert_eq!(&*expired[0].0, "short");
        assert!(table.contains("long"));
        assert!(!table.contains("short"));

        for (_, request) in expired {
            request.resolve(Outcome::failure(&Error::Timeout));
        }
        assert!(short_rx.await.unwrap().is_timeout());
    }

    #[tokio::test]
    async fn test_pending_response_resolves_once() {
        let (tx, rx) = oneshot::channel();
        let request = PendingRequest::new(tx, Duration::from_secs(1));
        request.resolve(Outcome::success(json!(1)));
        assert_eq!(PendingResponse::waiting(rx).await, Outcome::success(json!(1)));
    }

    #[tokio::test]
    async fn test_dropped_resolver_settles_as_shutdown() {
        let (tx, rx) = oneshot::channel::<Outcome>();
        drop(tx);
        let outcome = PendingResponse::waiting(rx).await;
        assert_eq!(outcome.error.as_deref(), Some("shutdown"));
    }
}
