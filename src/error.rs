use std::{any::Any, sync::Arc};

use tokio::sync::mpsc::error::SendError;

use crate::{Frame, ValidationError};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("over_capacity")]
    OverCapacity,

    #[error("timeout")]
    Timeout,

    #[error("shutdown")]
    Shutdown,

    #[error("Request with id '{0}' is already pending")]
    DuplicateRequest(String),

    #[error("Handler failed: {0}")]
    HandlerFailure(Arc<str>),

    #[error("Audit sink failed: {0}")]
    AuditFailure(Arc<str>),

    #[error("Invalid routing policy: {0}")]
    InvalidPolicy(String),

    #[error("Broker has already started.")]
    BrokerAlreadyStarted,

    #[error("Transport channel is closed")]
    TransportClosed,

    #[error("Target is closed")]
    TargetClosed,

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Error external to Switchboard occurred: {0}")]
    External(Arc<str>),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),
}

impl Error {
    /// Wrap an arbitrary failure reported by a handler, sink or target.
    pub fn external(msg: impl Into<Arc<str>>) -> Self {
        Error::External(msg.into())
    }

    /// Map an error string received in an [`Outcome`](crate::Outcome) or
    /// [`AckReceipt`](crate::AckReceipt) back to a typed error.
    pub(crate) fn from_wire(error: &str) -> Self {
        match error {
            "timeout" => Error::Timeout,
            "over_capacity" => Error::OverCapacity,
            "shutdown" => Error::Shutdown,
            other => Error::Rejected(other.to_owned()),
        }
    }
}

impl From<SendError<Frame>> for Error {
    fn from(_: SendError<Frame>) -> Self {
        Error::TransportClosed
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> Arc<str> {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        Arc::from(*msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        Arc::from(msg.as_str())
    } else {
        Arc::from("panic")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_codes_round_trip() {
        assert!(matches!(Error::from_wire(&Error::Timeout.to_string()), Error::Timeout));
        assert!(matches!(
            Error::from_wire(&Error::OverCapacity.to_string()),
            Error::OverCapacity
        ));
        assert!(matches!(Error::from_wire("nope"), Error::Rejected(msg) if msg == "nope"));
    }

    #[test]
    fn test_panic_message() {
        let payload = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(&*panic_message(payload), "boom");
    }
}
