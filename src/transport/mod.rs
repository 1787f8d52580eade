//! The boundary between the broker and client contexts.
//!
//! Only plain data crosses it: every message is a [`Frame`], which serializes
//! to JSON. Callbacks, handles and other live objects never travel over a
//! transport.

pub mod local;

use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::{AckReceipt, Envelope, Outcome, RequestOptions, Result};

/// Correlates a call frame with the frame answering it. Scoped to one
/// transport.
pub type CallId = u64;

/// The single inbound callback a client installs on its transport.
pub type Listener = Box<dyn Fn(Envelope) + Send + Sync>;

/// Unit of exchange between a client transport and the broker.
///
/// Client to broker: [`OneWay`](Frame::OneWay), [`Ack`](Frame::Ack),
/// [`Request`](Frame::Request).
/// Broker to client: [`Acked`](Frame::Acked), [`Response`](Frame::Response),
/// [`Push`](Frame::Push).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    OneWay {
        envelope: Envelope,
    },
    Ack {
        call: CallId,
        envelope: Envelope,
    },
    Request {
        call: CallId,
        envelope: Envelope,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    Acked {
        call: CallId,
        receipt: AckReceipt,
    },
    Response {
        call: CallId,
        outcome: Outcome,
    },
    Push {
        envelope: Envelope,
    },
}

impl Frame {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Frame> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Frame::OneWay { .. } => "one_way",
            Frame::Ack { .. } => "ack",
            Frame::Request { .. } => "request",
            Frame::Acked { .. } => "acked",
            Frame::Response { .. } => "response",
            Frame::Push { .. } => "push",
        }
    }
}

/// Envelopes forwarded to a client context arrive as pushes.
impl From<Envelope> for Frame {
    fn from(envelope: Envelope) -> Self {
        Frame::Push { envelope }
    }
}

/// What a client needs from the channel to the broker.
///
/// Implementations carry envelopes and their settled results, nothing else.
/// The envelope's `source` is only advisory: the broker stamps the identity
/// the transport is bound to.
pub trait Transport: Send + Sync + 'static {
    /// Fire and forget.
    fn send(&self, envelope: Envelope) -> Result;

    /// Resolve once the broker has accepted or rejected the envelope.
    fn ack(&self, envelope: Envelope) -> impl Future<Output = Result<AckReceipt>> + Send;

    /// Resolve with the request's settled outcome.
    fn request(
        &self,
        envelope: Envelope,
        options: RequestOptions,
    ) -> impl Future<Output = Result<Outcome>> + Send;

    /// Install the callback receiving envelopes forwarded to this context.
    fn listen(&self, listener: Listener) -> Result;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_frame_wire_shape() {
        let envelope = Envelope::new("RISK_CHECK", "risk", "workbench");
        let frame = Frame::Request {
            call: 7,
            envelope: envelope.clone(),
            timeout_ms: Some(500),
        };
        let value: serde_json::Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(value["kind"], "request");
        assert_eq!(value["call"], 7);
        assert_eq!(value["timeout_ms"], 500);
        assert_eq!(value["envelope"]["type"], "RISK_CHECK");

        let response = Frame::Response {
            call: 7,
            outcome: Outcome::success(json!({"passed": true})),
        };
        let decoded = Frame::decode(&response.encode().unwrap()).unwrap();
        assert_eq!(decoded, response);
        assert_eq!(decoded.kind(), "response");
    }

    #[test]
    fn test_envelope_becomes_push() {
        let envelope = Envelope::new("CALL_START", "call", "dialer");
        assert_eq!(Frame::from(envelope.clone()), Frame::Push { envelope });
    }
}
