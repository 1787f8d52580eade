mod jsonl;

use tracing::info;

use crate::{Envelope, Result};

pub use jsonl::JsonlAudit;

/// Receives every envelope that passes validation, before local handlers run
/// and before it is forwarded.
///
/// Errors (and panics) from [`record`](AuditSink::record) are logged by the
/// broker and never stop delivery. Closures of the right shape implement the
/// trait:
///
/// ```rust
/// use switchboard::{AuditSink, Envelope};
///
/// let sink = |envelope: &Envelope| -> switchboard::Result {
///     println!("audit {} {}", envelope.event_type, envelope.id);
///     Ok(())
/// };
/// # fn assert_sink(_: impl AuditSink) {}
/// # assert_sink(sink);
/// ```
pub trait AuditSink: Send + Sync + 'static {
    fn record(&self, envelope: &Envelope) -> Result;
}

impl<F> AuditSink for F
where
    F: Fn(&Envelope) -> Result + Send + Sync + 'static,
{
    fn record(&self, envelope: &Envelope) -> Result {
        self(envelope)
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAudit;

impl AuditSink for NoopAudit {
    fn record(&self, _envelope: &Envelope) -> Result {
        Ok(())
    }
}

/// Records accepted envelopes as `tracing` events at `INFO` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAudit;

impl AuditSink for TracingAudit {
    fn record(&self, envelope: &Envelope) -> Result {
        info!(
            id = %envelope.id,
            event_type = %envelope.event_type,
            domain = %envelope.domain,
            source = %envelope.source,
            destination = envelope.target.as_ref().map(|t| t.as_str()),
            reply_to = envelope.reply_to.as_deref(),
            "audit"
        );
        Ok(())
    }
}
