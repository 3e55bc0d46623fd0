//! Rules enforced at the admission boundary before an object reaches the
//! reconcilers. The validating/defaulting webhook deployment is packaged
//! separately; it shares these functions so the reconcilers and the webhook
//! agree on what a well-formed object is.

use k8s_openapi::api::admissionregistration::v1::RuleWithOperations;

use crate::policies::common::PolicyMode;
use crate::policies::Policy;
use crate::policy_server::PolicyServerSpec;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("field \"{0}\" cannot be changed after creation")]
    ImmutableField(&'static str),

    #[error("field \"mode\" cannot transition from protect to monitor; recreate the policy in monitor mode instead")]
    ProtectToMonitor,

    #[error("timeoutSeconds must be within 1 and 30, got {0}")]
    TimeoutOutOfBounds(i32),

    #[error("one of minAvailable or maxUnavailable must be set, not both")]
    MinAvailableAndMaxUnavailable,
}

/// Rules applied when a policy is updated. `module` and `policyServer` are
/// identity components and never change; `mode` ratchets monitor → protect.
pub fn validate_policy_update<P: Policy>(old: &P, new: &P) -> Result<(), ValidationError> {
    if old.module() != new.module() {
        return Err(ValidationError::ImmutableField("module"));
    }
    if old.policy_server() != new.policy_server() {
        return Err(ValidationError::ImmutableField("policyServer"));
    }
    if old.mode() == PolicyMode::Protect && new.mode() == PolicyMode::Monitor {
        return Err(ValidationError::ProtectToMonitor);
    }
    validate_policy_create(new)
}

/// Rules applied when a policy is created.
pub fn validate_policy_create<P: Policy>(policy: &P) -> Result<(), ValidationError> {
    let timeout = policy.timeout_seconds();
    if !(1..=30).contains(&timeout) {
        return Err(ValidationError::TimeoutOutOfBounds(timeout));
    }
    Ok(())
}

/// Rules applied to a PolicyServer spec.
pub fn validate_policy_server_spec(spec: &PolicyServerSpec) -> Result<(), ValidationError> {
    if spec.min_available.is_some() && spec.max_unavailable.is_some() {
        return Err(ValidationError::MinAvailableAndMaxUnavailable);
    }
    Ok(())
}

/// Namespaced policies can only match namespaced resources: the scope of
/// every rule is forced to `Namespaced`, whatever the user wrote.
pub fn force_namespaced_scope(rules: &mut [RuleWithOperations]) {
    for rule in rules {
        rule.scope = Some("Namespaced".to_string());
    }
}
