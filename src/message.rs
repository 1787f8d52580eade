use serde::{Serialize, de::DeserializeOwned};

/// A payload type statically bound to an event type and domain.
///
/// The bus itself dispatches on the `type` string; `Message` layers static
/// typing on top, so producers and handlers agree on the payload shape at
/// compile time. Use [`RoutingPolicy::admits`](crate::RoutingPolicy::admits)
/// to check the binding against the active policy.
///
/// Usually derived:
///
/// ```rust,ignore
/// #[derive(Serialize, Deserialize, Message)]
/// #[message(event = "CALL_START", domain = "call")]
/// struct CallStart { caller: String, ticket_id: String }
/// ```
pub trait Message: Serialize + DeserializeOwned + Send + 'static {
    /// The envelope `type` this payload travels under.
    const TYPE: &'static str;
    /// The routing domain `TYPE` belongs to.
    const DOMAIN: &'static str;
}

/// A message that expects a reply, pairing the request payload with the
/// payload carried back in the reply envelope.
pub trait Exchange: Message {
    type Response: Serialize + DeserializeOwned + Send + 'static;
}
