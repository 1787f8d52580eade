mod pending;
mod sweeper;
mod targets;

pub use pending::PendingResponse;
pub(crate) use pending::{PendingRequest, PendingTable};
pub(crate) use sweeper::{run_sweeper, ticker};
pub(crate) use targets::TargetRegistry;
