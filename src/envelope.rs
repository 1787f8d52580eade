use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Deserializer, Serialize, Serializer, de::DeserializeOwned};
use serde_json::Value;
use uuid::Uuid;

use crate::{Error, Message, Result};

/// Target value meaning "deliver to every registered target".
pub const BROADCAST: &str = "*";

/// Where the broker forwards an envelope after running its local handlers.
///
/// Serialized as a plain string: `"*"` for [`Destination::Broadcast`], the
/// target's name otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    Broadcast,
    Named(String),
}

impl Destination {
    pub fn named(name: impl Into<String>) -> Self {
        Destination::Named(name.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            Destination::Broadcast => BROADCAST,
            Destination::Named(name) => name,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self, Destination::Broadcast)
    }
}

impl From<&str> for Destination {
    fn from(value: &str) -> Self {
        if value == BROADCAST {
            Destination::Broadcast
        } else {
            Destination::Named(value.to_owned())
        }
    }
}

impl From<String> for Destination {
    fn from(value: String) -> Self {
        if value == BROADCAST {
            Destination::Broadcast
        } else {
            Destination::Named(value)
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Destination {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Destination {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        String::deserialize(deserializer).map(Destination::from)
    }
}

pub(crate) fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Milliseconds since the Unix epoch. A clock set before the epoch yields 0,
/// which validation rejects as a missing timestamp.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// The unit of communication on the bus.
///
/// - `id`: unique identifier, also the correlation key for replies.
/// - `event_type`: event kind (`type` on the wire); selects local handlers and
///   the routing rules applied to the envelope.
/// - `domain`: category the type must belong to.
/// - `source`: identity of the sending context. Clients stamp it, and the
///   broker overwrites it with the identity a transport is bound to.
/// - `target`: optional [`Destination`]; `None` keeps the envelope inside the
///   broker.
/// - `payload`: opaque JSON data.
/// - `ts`: send time in milliseconds since the Unix epoch.
/// - `reply_to`: id of the request this envelope answers (`replyTo` on the
///   wire).
///
/// Every field deserializes with a default so that incomplete envelopes reach
/// validation and are rejected there as malformed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub event_type: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Destination>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub ts: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl Envelope {
    /// Create an envelope with a fresh id and the current timestamp.
    pub fn new(
        event_type: impl Into<String>,
        domain: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Envelope {
            id: new_id(),
            event_type: event_type.into(),
            domain: domain.into(),
            source: source.into(),
            target: None,
            payload: Value::Null,
            ts: now_millis(),
            reply_to: None,
        }
    }

    /// Create an envelope for a typed message.
    pub fn message<M: Message>(message: &M, source: impl Into<String>) -> Result<Self> {
        Ok(Envelope::new(M::TYPE, M::DOMAIN, source).with_payload(serde_json::to_value(message)?))
    }

    pub fn to(mut self, destination: impl Into<Destination>) -> Self {
        self.target = Some(destination.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn in_reply_to(mut self, request_id: impl Into<String>) -> Self {
        self.reply_to = Some(request_id.into());
        self
    }

    /// Whether this envelope answers an earlier request.
    #[inline]
    pub fn is_reply(&self) -> bool {
        self.reply_to.is_some()
    }

    /// Assign a fresh id if the envelope has none.
    pub fn ensure_id(&mut self) -> &str {
        if self.id.is_empty() {
            self.id = new_id();
        }
        &self.id
    }

    /// Build the reply to this envelope: fresh id, same type and domain,
    /// `reply_to` set to this envelope's id.
    pub fn reply(&self, source: impl Into<String>, payload: Value) -> Envelope {
        Envelope {
            id: new_id(),
            event_type: self.event_type.clone(),
            domain: self.domain.clone(),
            source: source.into(),
            target: None,
            payload,
            ts: now_millis(),
            reply_to: Some(self.id.clone()),
        }
    }

    /// Deserialize the payload into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(T::deserialize(&self.payload)?)
    }

    /// Whether the envelope carries message type `M`.
    pub fn is<M: Message>(&self) -> bool {
        self.event_type == M::TYPE && self.domain == M::DOMAIN
    }
}

/// An envelope before the sender stamps `source` and `ts`.
///
/// This is what clients compose; [`Draft::stamp`] turns it into an
/// [`Envelope`] carrying the client's identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Draft {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Destination>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl Draft {
    pub fn new(event_type: impl Into<String>, domain: impl Into<String>) -> Self {
        Draft {
            id: new_id(),
            event_type: event_type.into(),
            domain: domain.into(),
            target: None,
            payload: Value::Null,
            reply_to: None,
        }
    }

    /// Compose a draft for a typed message.
    pub fn message<M: Message>(message: &M) -> Result<Self> {
        Ok(Draft::new(M::TYPE, M::DOMAIN).with_payload(serde_json::to_value(message)?))
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn to(mut self, destination: impl Into<Destination>) -> Self {
        self.target = Some(destination.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn in_reply_to(mut self, request_id: impl Into<String>) -> Self {
        self.reply_to = Some(request_id.into());
        self
    }

    /// Stamp `source` and the current time.
    pub fn stamp(self, source: &str) -> Envelope {
        let mut envelope = Envelope {
            id: self.id,
            event_type: self.event_type,
            domain: self.domain,
            source: source.to_owned(),
            target: self.target,
            payload: self.payload,
            ts: now_millis(),
            reply_to: self.reply_to,
        };
        envelope.ensure_id();
        envelope
    }
}

/// Settled result of a correlated request: `{ok, data?, error?}` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Outcome {
    pub fn success(data: Value) -> Self {
        Outcome {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(error: &Error) -> Self {
        Outcome {
            ok: false,
            data: None,
            error: Some(error.to_string()),
        }
    }

    pub fn is_timeout(&self) -> bool {
        !self.ok && self.error.as_deref() == Some("timeout")
    }

    /// Convert into the reply payload, mapping failures to typed errors.
    pub fn into_result(self) -> Result<Value> {
        if self.ok {
            Ok(self.data.unwrap_or(Value::Null))
        } else {
            Err(Error::from_wire(self.error.as_deref().unwrap_or("unknown")))
        }
    }

    /// Convert into a typed reply payload.
    pub fn decode<T: DeserializeOwned>(self) -> Result<T> {
        Ok(serde_json::from_value(self.into_result()?)?)
    }
}

/// Confirmation that the broker accepted (or rejected) an envelope into its
/// pipeline: `{id}` or `{id, error}` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckReceipt {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AckReceipt {
    pub fn accepted(id: impl Into<String>) -> Self {
        AckReceipt {
            id: id.into(),
            error: None,
        }
    }

    pub fn rejected(id: impl Into<String>, error: &Error) -> Self {
        AckReceipt {
            id: id.into(),
            error: Some(error.to_string()),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.error.is_none()
    }

    pub fn into_result(self) -> Result<String> {
        match self.error {
            None => Ok(self.id),
            Some(error) => Err(Error::from_wire(&error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = Envelope::new("CALL_START", "call", "dialer")
            .to("workbench")
            .with_payload(json!({"caller": "10086"}))
            .in_reply_to("req-1");
        let value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(value["type"], "CALL_START");
        assert_eq!(value["target"], "workbench");
        assert_eq!(value["replyTo"], "req-1");
        assert_eq!(value["payload"]["caller"], "10086");
        assert!(value.get("event_type").is_none());
    }

    #[test]
    fn test_broadcast_marker() {
        let envelope: Envelope = serde_json::from_value(json!({
            "id": "1", "type": "BROADCAST", "domain": "demo",
            "source": "renderer", "target": "*", "ts": 1
        }))
        .unwrap();
        assert_eq!(envelope.target, Some(Destination::Broadcast));
        assert_eq!(serde_json::to_value(&envelope).unwrap()["target"], "*");
    }

    #[test]
    fn test_missing_fields_deserialize_empty() {
        let envelope: Envelope = serde_json::from_value(json!({"type": "LOG"})).unwrap();
        assert!(envelope.id.is_empty());
        assert!(envelope.source.is_empty());
        assert_eq!(envelope.ts, 0);
        assert_eq!(envelope.target, None);
    }

    #[test]
    fn test_reply_correlates_to_request() {
        let request = Envelope::new("LOCK_CUSTOMER", "crm", "workbench").to("main");
        let reply = request.reply("main", json!({"locked": true}));

        assert_ne!(reply.id, request.id);
        assert_eq!(reply.reply_to.as_deref(), Some(request.id.as_str()));
        assert_eq!(reply.event_type, "LOCK_CUSTOMER");
        assert_eq!(reply.domain, "crm");
        assert_eq!(reply.target, None);
    }

    #[test]
    fn test_draft_stamp() {
        let draft = Draft::new("PING", "demo").with_id("").to(BROADCAST);
        let envelope = draft.stamp("renderer");
        assert!(!envelope.id.is_empty());
        assert_eq!(envelope.source, "renderer");
        assert!(envelope.ts > 0);
        assert!(envelope.target.unwrap().is_broadcast());
    }

    #[test]
    fn test_outcome_into_result() {
        let ok = Outcome::success(json!({"passed": true}));
        assert_eq!(ok.into_result().unwrap(), json!({"passed": true}));

        let timeout = Outcome::failure(&Error::Timeout);
        assert!(timeout.is_timeout());
        assert_eq!(
            serde_json::to_value(&timeout).unwrap(),
            json!({"ok": false, "error": "timeout"})
        );
        assert!(matches!(timeout.into_result(), Err(Error::Timeout)));
    }

    #[test]
    fn test_ack_receipt() {
        let accepted = AckReceipt::accepted("a1");
        assert_eq!(serde_json::to_value(&accepted).unwrap(), json!({"id": "a1"}));
        assert_eq!(accepted.into_result().unwrap(), "a1");

        let rejected = AckReceipt::rejected("a2", &Error::OverCapacity);
        assert!(!rejected.is_accepted());
    }
}
