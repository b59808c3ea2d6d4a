//! Ownership and trusted-publisher authorization.
//!
//! Pure decision logic over a package's current ownership state; the store
//! loads that state, this module decides, and the coordinator acts on the
//! decision within its transaction. Keeping this free of I/O makes the
//! authorization rules themselves exhaustively unit-testable.

use crate::error::{ForbiddenReason, RegistryError};
use crate::identity::Principal;

/// A rule permitting a federated principal to publish without being an
/// explicit collaborator, matched against the principal's claims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustedPublisher {
    pub provider: String,
    pub repository: String,
    pub workflow: Option<String>,
    pub environment: Option<String>,
}

impl TrustedPublisher {
    fn matches(&self, principal: &Principal) -> bool {
        let Principal::Federated { provider, repository, workflow, environment, .. } = principal else {
            return false;
        };
        if &self.provider != provider || &self.repository != repository {
            return false;
        }
        if let Some(expected) = &self.workflow {
            if workflow.as_deref() != Some(expected.as_str()) {
                return false;
            }
        }
        if let Some(expected) = &self.environment {
            if environment.as_deref() != Some(expected.as_str()) {
                return false;
            }
        }
        true
    }
}

/// The ownership state of an existing package, as loaded from the store.
#[derive(Debug, Clone)]
pub struct OwnershipRecord {
    pub owner: String,
    pub collaborators: Vec<String>,
    pub trusted_publishers: Vec<TrustedPublisher>,
}

/// Outcome of an authorization check: either the package already exists and
/// the principal may act on it, or this is a first publish establishing a
/// new claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    Claim,
    Authorized,
}

/// Decide whether `principal` may publish or yank under `package_name`,
/// given `existing` ownership state (`None` if the package has never been
/// published).
pub fn authorize(
    principal: &Principal,
    existing: Option<&OwnershipRecord>,
) -> Result<Authorization, RegistryError> {
    let Some(record) = existing else {
        return Ok(Authorization::Claim);
    };

    let key = principal.key();
    if record.owner == key || record.collaborators.iter().any(|c| c == &key) {
        return Ok(Authorization::Authorized);
    }

    if record.trusted_publishers.iter().any(|rule| rule.matches(principal)) {
        return Ok(Authorization::Authorized);
    }

    Err(RegistryError::Forbidden(ForbiddenReason::NoMatchingTrustedPublisher))
}

/// Only the owner may mutate collaborators or trusted-publisher rules.
pub fn authorize_ownership_mutation(
    principal: &Principal,
    record: &OwnershipRecord,
) -> Result<(), RegistryError> {
    if record.owner == principal.key() {
        Ok(())
    } else {
        Err(RegistryError::Forbidden(ForbiddenReason::NotOwner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner_principal() -> Principal {
        Principal::ApiToken("alice".into())
    }

    fn collaborator_principal() -> Principal {
        Principal::ApiToken("bob".into())
    }

    fn stranger_principal() -> Principal {
        Principal::ApiToken("mallory".into())
    }

    fn federated(repo: &str, workflow: Option<&str>) -> Principal {
        Principal::Federated {
            provider: "github".into(),
            repository: repo.into(),
            workflow: workflow.map(str::to_string),
            environment: None,
            commit: None,
        }
    }

    #[test]
    fn first_publish_is_a_claim() {
        assert_eq!(authorize(&owner_principal(), None).unwrap(), Authorization::Claim);
    }

    #[test]
    fn owner_is_authorized() {
        let record = OwnershipRecord { owner: "alice".into(), collaborators: vec![], trusted_publishers: vec![] };
        assert_eq!(authorize(&owner_principal(), Some(&record)).unwrap(), Authorization::Authorized);
    }

    #[test]
    fn collaborator_is_authorized() {
        let record =
            OwnershipRecord { owner: "alice".into(), collaborators: vec!["bob".into()], trusted_publishers: vec![] };
        assert_eq!(authorize(&collaborator_principal(), Some(&record)).unwrap(), Authorization::Authorized);
    }

    #[test]
    fn stranger_is_forbidden() {
        let record = OwnershipRecord { owner: "alice".into(), collaborators: vec![], trusted_publishers: vec![] };
        let err = authorize(&stranger_principal(), Some(&record)).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Forbidden(ForbiddenReason::NoMatchingTrustedPublisher)
        ));
    }

    #[test]
    fn matching_trusted_publisher_is_authorized() {
        let record = OwnershipRecord {
            owner: "alice".into(),
            collaborators: vec![],
            trusted_publishers: vec![TrustedPublisher {
                provider: "github".into(),
                repository: "alice/emerald-world".into(),
                workflow: Some("release.yml".into()),
                environment: None,
            }],
        };
        let principal = federated("alice/emerald-world", Some("release.yml"));
        assert_eq!(authorize(&principal, Some(&record)).unwrap(), Authorization::Authorized);
    }

    #[test]
    fn mismatched_workflow_is_forbidden() {
        let record = OwnershipRecord {
            owner: "alice".into(),
            collaborators: vec![],
            trusted_publishers: vec![TrustedPublisher {
                provider: "github".into(),
                repository: "alice/emerald-world".into(),
                workflow: Some("release.yml".into()),
                environment: None,
            }],
        };
        let principal = federated("alice/emerald-world", Some("untrusted.yml"));
        assert!(authorize(&principal, Some(&record)).is_err());
    }

    #[test]
    fn only_owner_may_mutate_ownership() {
        let record = OwnershipRecord { owner: "alice".into(), collaborators: vec!["bob".into()], trusted_publishers: vec![] };
        assert!(authorize_ownership_mutation(&owner_principal(), &record).is_ok());
        let err = authorize_ownership_mutation(&collaborator_principal(), &record).unwrap_err();
        assert!(matches!(err, RegistryError::Forbidden(ForbiddenReason::NotOwner)));
    }
}
