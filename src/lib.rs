//! Switchboard - broker/client message bus
//!
//! A process-local publish/subscribe and request/response bus connecting one
//! privileged [`Broker`] to any number of isolated [`Client`] contexts over a
//! [`Transport`] that only carries plain serializable [`Frame`]s.
//!
//! - The broker validates every [`Envelope`] against a hot-reloadable
//!   [`RoutingPolicy`], records it through an [`AuditSink`], runs its local
//!   handlers and forwards it to one or all registered [`Target`]s.
//! - Requests are correlated by id: a reply carrying `replyTo` settles the
//!   caller's [`PendingResponse`], otherwise it times out. A periodic sweep
//!   evicts entries whose timers never ran.
//! - Clients multiplex a single transport subscription into per-type handler
//!   sets.
//!
//! See `demos/workbench.rs`.

mod audit;
mod broker;
mod client;
mod config;
mod envelope;
mod error;
mod message;
mod policy;
mod target;
mod topic;
mod transport;

mod internal;

pub use audit::{AuditSink, JsonlAudit, NoopAudit, TracingAudit};
pub use broker::{Broker, BrokerBuilder};
pub use client::{Client, WeakClient};
pub use config::{Config, RequestOptions};
pub use envelope::{AckReceipt, BROADCAST, Destination, Draft, Envelope, Outcome};
pub use error::Error;
pub use internal::PendingResponse;
pub use message::{Exchange, Message};
pub use policy::{DomainRule, PolicyDocument, PolicyStore, RoutingPolicy, TypeRule, ValidationError};
pub use target::{ChannelTarget, Target};
pub use topic::{Handler, Subscription, TopicRegistry};
pub use transport::{CallId, Frame, Listener, Transport, local::LocalTransport};

#[cfg(feature = "macros")]
pub use switchboard_macros::Message;

pub type Result<T = ()> = std::result::Result<T, Error>;
