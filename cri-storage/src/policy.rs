//! Signature policy gating which sources may be pulled.

use std::collections::BTreeMap;

use references::RegistryImageReference;
use serde::Deserialize;

use crate::error::{Error, Result};

/// What a policy scope requires of an image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyRequirement {
    /// Accept the image without checking signatures.
    #[default]
    InsecureAcceptAnything,
    /// Refuse the image.
    Reject,
}

/// Requirements per registry scope.
///
/// A scope is a registry host, a `registry/repository` prefix at a path
/// boundary, or a full reference. The most specific matching scope wins,
/// and [`SignaturePolicy::default`] applies when none matches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SignaturePolicy {
    /// Requirement for sources no scope matches.
    #[serde(default)]
    pub default: PolicyRequirement,

    /// Requirements for the registry transport, by scope.
    #[serde(default)]
    pub transports: BTreeMap<String, PolicyRequirement>,
}

impl SignaturePolicy {
    /// The requirement that applies to `reference`.
    pub fn requirement_for(&self, reference: &RegistryImageReference) -> PolicyRequirement {
        let full = reference.string_for_out_of_process_consumption_only();
        if let Some(requirement) = self.transports.get(&full) {
            return *requirement;
        }

        let mut scope = reference.name();
        loop {
            if let Some(requirement) = self.transports.get(&scope) {
                return *requirement;
            }
            match scope.rfind('/') {
                Some(i) => scope.truncate(i),
                None => return self.default,
            }
        }
    }

    /// Fail with [`Error::PolicyRejected`] unless `reference` may be pulled.
    pub fn check(&self, reference: &RegistryImageReference) -> Result<()> {
        match self.requirement_for(reference) {
            PolicyRequirement::InsecureAcceptAnything => Ok(()),
            PolicyRequirement::Reject => Err(Error::PolicyRejected(
                reference.string_for_out_of_process_consumption_only(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(s: &str) -> RegistryImageReference {
        RegistryImageReference::parse_normalized(s).unwrap()
    }

    fn policy(default: PolicyRequirement, scopes: &[(&str, PolicyRequirement)]) -> SignaturePolicy {
        SignaturePolicy {
            default,
            transports: scopes
                .iter()
                .map(|(scope, req)| (scope.to_string(), *req))
                .collect(),
        }
    }

    #[test]
    fn default_accepts_everything() {
        let policy = SignaturePolicy::default();
        assert!(policy.check(&reference("busybox")).is_ok());
    }

    #[test]
    fn most_specific_scope_wins() {
        use PolicyRequirement::*;
        let policy = policy(
            Reject,
            &[
                ("docker.io", InsecureAcceptAnything),
                ("docker.io/evil", Reject),
                ("docker.io/evil/allowed:v1", InsecureAcceptAnything),
            ],
        );

        assert_eq!(policy.requirement_for(&reference("busybox")), InsecureAcceptAnything);
        assert_eq!(policy.requirement_for(&reference("evil/thing")), Reject);
        assert_eq!(
            policy.requirement_for(&reference("evil/allowed:v1")),
            InsecureAcceptAnything
        );
        assert_eq!(policy.requirement_for(&reference("evil/allowed:v2")), Reject);
        assert_eq!(policy.requirement_for(&reference("quay.io/a/b")), Reject);
    }

    #[test]
    fn scopes_match_at_path_boundaries() {
        use PolicyRequirement::*;
        let policy = policy(InsecureAcceptAnything, &[("quay.io/team", Reject)]);
        assert_eq!(policy.requirement_for(&reference("quay.io/team/app")), Reject);
        assert_eq!(
            policy.requirement_for(&reference("quay.io/teammate/app")),
            InsecureAcceptAnything
        );
    }

    #[test]
    fn rejection_names_the_reference() {
        let policy = policy(PolicyRequirement::Reject, &[]);
        let err = policy.check(&reference("alpine:3.19")).unwrap_err();
        assert!(matches!(
            err,
            Error::PolicyRejected(ref name) if name == "docker.io/library/alpine:3.19"
        ));
    }
}
