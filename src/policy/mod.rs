mod rules;
mod store;

pub use rules::{DomainRule, PolicyDocument, RoutingPolicy, TypeRule, ValidationError};
pub use store::PolicyStore;
