use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::{Envelope, Error, Message, Result};

/// Reasons the routing policy refuses an envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Malformed envelope: missing `{0}`")]
    MalformedEnvelope(&'static str),

    #[error("Unknown domain '{0}'")]
    UnknownDomain(String),

    #[error("Event type '{event_type}' does not belong to domain '{domain}'")]
    DomainTypeMismatch { event_type: String, domain: String },

    #[error("Source '{sender}' may not emit '{event_type}'")]
    UnauthorizedSource { event_type: String, sender: String },

    #[error("Target '{target}' may not receive '{event_type}'")]
    UnauthorizedTarget { event_type: String, target: String },
}

/// Serialized form of a routing policy.
///
/// ```json
/// {
///   "domains": { "risk": { "types": ["RISK_CHECK"] } },
///   "types":   { "RISK_CHECK": { "sources": ["workbench"], "targets": ["main"] } }
/// }
/// ```
///
/// A type without an entry in `types`, or an entry without `sources` /
/// `targets`, is unrestricted in that dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyDocument {
    #[serde(default)]
    pub domains: BTreeMap<String, DomainRule>,
    #[serde(default)]
    pub types: BTreeMap<String, TypeRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DomainRule {
    pub types: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TypeRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targets: Option<Vec<String>>,
}

/// Declarative rules deciding which envelopes may flow through the broker.
///
/// Built either in code:
///
/// ```rust
/// use switchboard::RoutingPolicy;
///
/// let policy = RoutingPolicy::new()
///     .allow("risk", ["RISK_CHECK"])
///     .restrict_sources("RISK_CHECK", ["workbench", "partner:risk"])
///     .restrict_targets("RISK_CHECK", ["main"]);
/// ```
///
/// or from a [`PolicyDocument`] (see [`RoutingPolicy::from_json`]).
/// A broadcast is authorized against restricted targets only if `"*"` is
/// listed among them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingPolicy {
    domains: HashMap<String, HashSet<String>>,
    sources: HashMap<String, HashSet<String>>,
    targets: HashMap<String, HashSet<String>>,
}

impl RoutingPolicy {
    /// An empty policy. It knows no domains, so it rejects every envelope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow `types` in `domain`, creating the domain if needed.
    pub fn allow<I, S>(mut self, domain: impl Into<String>, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.domains
            .entry(domain.into())
            .or_default()
            .extend(types.into_iter().map(Into::into));
        self
    }

    /// Only let the listed identities emit `event_type`.
    pub fn restrict_sources<I, S>(mut self, event_type: impl Into<String>, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources
            .entry(event_type.into())
            .or_default()
            .extend(sources.into_iter().map(Into::into));
        self
    }

    /// Only let `event_type` be forwarded to the listed targets.
    pub fn restrict_targets<I, S>(mut self, event_type: impl Into<String>, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.targets
            .entry(event_type.into())
            .or_default()
            .extend(targets.into_iter().map(Into::into));
        self
    }

    pub fn from_document(document: PolicyDocument) -> Result<Self> {
        let mut policy = RoutingPolicy::new();
        for (domain, rule) in document.domains {
            if domain.is_empty() {
                return Err(Error::InvalidPolicy("empty domain name".into()));
            }
            if let Some(empty) = rule.types.iter().position(String::is_empty) {
                return Err(Error::InvalidPolicy(format!(
                    "empty event type at index {empty} of domain '{domain}'"
                )));
            }
            policy = policy.allow(domain, rule.types);
        }
        for (event_type, rule) in document.types {
            if event_type.is_empty() {
                return Err(Error::InvalidPolicy("empty event type name".into()));
            }
            if let Some(sources) = rule.sources {
                policy = policy.restrict_sources(event_type.clone(), sources);
            }
            if let Some(targets) = rule.targets {
                policy = policy.restrict_targets(event_type, targets);
            }
        }
        Ok(policy)
    }

    /// Parse a JSON [`PolicyDocument`].
    pub fn from_json(json: &str) -> Result<Self> {
        let document: PolicyDocument =
            serde_json::from_str(json).map_err(|e| Error::InvalidPolicy(e.to_string()))?;
        Self::from_document(document)
    }

    /// Export the policy, with sorted lists, e.g. to persist it.
    pub fn to_document(&self) -> PolicyDocument {
        fn sorted(set: &HashSet<String>) -> Vec<String> {
            let mut list: Vec<String> = set.iter().cloned().collect();
            list.sort();
            list
        }

        let domains = self
            .domains
            .iter()
            .map(|(domain, types)| (domain.clone(), DomainRule { types: sorted(types) }))
            .collect();

        let mut types: BTreeMap<String, TypeRule> = BTreeMap::new();
        for (event_type, sources) in &self.sources {
            types.entry(event_type.clone()).or_default().sources = Some(sorted(sources));
        }
        for (event_type, targets) in &self.targets {
            types.entry(event_type.clone()).or_default().targets = Some(sorted(targets));
        }

        PolicyDocument { domains, types }
    }

    /// Check an envelope against the policy.
    ///
    /// Checks run in order: required fields, domain membership, source
    /// authorization, target authorization. The first failure is returned.
    pub fn validate(&self, envelope: &Envelope) -> std::result::Result<(), ValidationError> {
        Self::check_structure(envelope)?;

        let types = self
            .domains
            .get(&envelope.domain)
            .ok_or_else(|| ValidationError::UnknownDomain(envelope.domain.clone()))?;
        if !types.contains(&envelope.event_type) {
            return Err(ValidationError::DomainTypeMismatch {
                event_type: envelope.event_type.clone(),
                domain: envelope.domain.clone(),
            });
        }

        if let Some(allowed) = self.sources.get(&envelope.event_type) {
            if !allowed.contains(&envelope.source) {
                return Err(ValidationError::UnauthorizedSource {
                    event_type: envelope.event_type.clone(),
                    sender: envelope.source.clone(),
                });
            }
        }

        if let (Some(allowed), Some(target)) =
            (self.targets.get(&envelope.event_type), &envelope.target)
        {
            if !allowed.contains(target.as_str()) {
                return Err(ValidationError::UnauthorizedTarget {
                    event_type: envelope.event_type.clone(),
                    target: target.to_string(),
                });
            }
        }

        Ok(())
    }

    fn check_structure(envelope: &Envelope) -> std::result::Result<(), ValidationError> {
        let missing = if envelope.id.is_empty() {
            Some("id")
        } else if envelope.event_type.is_empty() {
            Some("type")
        } else if envelope.domain.is_empty() {
            Some("domain")
        } else if envelope.source.is_empty() {
            Some("source")
        } else if envelope.ts == 0 {
            Some("ts")
        } else {
            None
        };
        missing.map_or(Ok(()), |field| Err(ValidationError::MalformedEnvelope(field)))
    }

    /// Whether the policy lists `M::TYPE` under `M::DOMAIN`.
    pub fn admits<M: Message>(&self) -> bool {
        self.allows_type(M::DOMAIN, M::TYPE)
    }

    pub fn allows_type(&self, domain: &str, event_type: &str) -> bool {
        self.domains
            .get(domain)
            .is_some_and(|types| types.contains(event_type))
    }

    pub fn domain_names(&self) -> impl Iterator<Item = &str> {
        self.domains.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BROADCAST, Envelope};

    fn policy() -> RoutingPolicy {
        RoutingPolicy::new()
            .allow("risk", ["RISK_CHECK"])
            .allow("credit", ["CREDIT_APPLY", "CREDIT_APPROVE"])
            .allow("demo", ["BROADCAST", "LOG"])
            .restrict_sources("CREDIT_APPROVE", ["partner:credit"])
            .restrict_targets("RISK_CHECK", ["main"])
    }

    #[test]
    fn test_valid_envelope() {
        let envelope = Envelope::new("RISK_CHECK", "risk", "workbench").to("main");
        assert_eq!(policy().validate(&envelope), Ok(()));
    }

    #[test]
    fn test_missing_fields_are_malformed() {
        let mut envelope = Envelope::new("LOG", "demo", "renderer");
        envelope.id.clear();
        assert_eq!(
            policy().validate(&envelope),
            Err(ValidationError::MalformedEnvelope("id"))
        );

        let mut envelope = Envelope::new("LOG", "demo", "");
        assert_eq!(
            policy().validate(&envelope),
            Err(ValidationError::MalformedEnvelope("source"))
        );

        envelope.source = "renderer".into();
        envelope.ts = 0;
        assert_eq!(
            policy().validate(&envelope),
            Err(ValidationError::MalformedEnvelope("ts"))
        );
    }

    #[test]
    fn test_structure_checked_before_domain() {
        let envelope = Envelope::new("", "nowhere", "renderer");
        assert_eq!(
            policy().validate(&envelope),
            Err(ValidationError::MalformedEnvelope("type"))
        );
    }

    #[test]
    fn test_unknown_domain() {
        let envelope = Envelope::new("LOG", "cti", "renderer");
        assert_eq!(
            policy().validate(&envelope),
            Err(ValidationError::UnknownDomain("cti".into()))
        );
    }

    #[test]
    fn test_domain_type_mismatch() {
        let envelope = Envelope::new("RISK_CHECK", "credit", "workbench");
        assert_eq!(
            policy().validate(&envelope),
            Err(ValidationError::DomainTypeMismatch {
                event_type: "RISK_CHECK".into(),
                domain: "credit".into()
            })
        );
    }

    #[test]
    fn test_source_restriction() {
        let denied = Envelope::new("CREDIT_APPROVE", "credit", "workbench");
        assert!(matches!(
            policy().validate(&denied),
            Err(ValidationError::UnauthorizedSource { sender, .. }) if sender == "workbench"
        ));

        let allowed = Envelope::new("CREDIT_APPROVE", "credit", "partner:credit");
        assert_eq!(policy().validate(&allowed), Ok(()));

        // No source rule for CREDIT_APPLY
        let open = Envelope::new("CREDIT_APPLY", "credit", "anyone");
        assert_eq!(policy().validate(&open), Ok(()));
    }

    #[test]
    fn test_target_restriction() {
        let denied = Envelope::new("RISK_CHECK", "risk", "workbench").to("dialer");
        assert!(matches!(
            policy().validate(&denied),
            Err(ValidationError::UnauthorizedTarget { target, .. }) if target == "dialer"
        ));

        let broadcast = Envelope::new("RISK_CHECK", "risk", "workbench").to(BROADCAST);
        assert!(policy().validate(&broadcast).is_err());

        // Restricted targets don't apply when no target is set
        let internal = Envelope::new("RISK_CHECK", "risk", "workbench");
        assert_eq!(policy().validate(&internal), Ok(()));
    }

    #[test]
    fn test_from_json() {
        let policy = RoutingPolicy::from_json(
            r#"{
                "domains": { "crm": { "types": ["LOCK_CUSTOMER"] } },
                "types": { "LOCK_CUSTOMER": { "sources": ["workbench"] } }
            }"#,
        )
        .unwrap();
        assert!(policy.allows_type("crm", "LOCK_CUSTOMER"));
        let envelope = Envelope::new("LOCK_CUSTOMER", "crm", "dialer");
        assert!(matches!(
            policy.validate(&envelope),
            Err(ValidationError::UnauthorizedSource { .. })
        ));
    }

    #[test]
    fn test_from_json_rejects_malformed_documents() {
        assert!(matches!(
            RoutingPolicy::from_json("{ not json"),
            Err(Error::InvalidPolicy(_))
        ));
        assert!(matches!(
            RoutingPolicy::from_json(r#"{"domains": {"crm": {"types": [""]}}}"#),
            Err(Error::InvalidPolicy(_))
        ));
        assert!(matches!(
            RoutingPolicy::from_json(r#"{"routes": {}}"#),
            Err(Error::InvalidPolicy(_))
        ));
    }

    #[test]
    fn test_document_round_trip() {
        let original = policy();
        let restored = RoutingPolicy::from_document(original.to_document()).unwrap();
        assert_eq!(original, restored);
    }
}
