//! Helpers around `metav1.Condition`: constructors plus the standard
//! "preserve lastTransitionTime when the status did not flip" merge.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

pub fn true_condition(type_: &str, reason: &str, message: &str) -> Condition {
    new_condition(type_, "True", reason, message)
}

pub fn false_condition(type_: &str, reason: &str, message: &str) -> Condition {
    new_condition(type_, "False", reason, message)
}

pub fn unknown_condition(type_: &str, reason: &str, message: &str) -> Condition {
    new_condition(type_, "Unknown", reason, message)
}

fn new_condition(type_: &str, status: &str, reason: &str, message: &str) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: Time(k8s_openapi::jiff::Timestamp::now()),
        observed_generation: None,
    }
}

/// Upserts a condition by type. The transition timestamp only moves when
/// the status actually changes.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    if let Some(existing) = conditions
        .iter_mut()
        .find(|existing| existing.type_ == condition.type_)
    {
        if existing.status == condition.status {
            condition.last_transition_time = existing.last_transition_time.clone();
        }
        *existing = condition;
    } else {
        conditions.push(condition);
    }
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|condition| condition.type_ == type_)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_condition_preserves_transition_time_when_status_is_stable() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            true_condition("PolicyActive", "PolicyActive", ""),
        );
        let first_transition = conditions[0].last_transition_time.clone();

        set_condition(
            &mut conditions,
            true_condition("PolicyActive", "PolicyActive", "still active"),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, first_transition);
        assert_eq!(conditions[0].message, "still active");
    }

    #[test]
    fn set_condition_replaces_on_status_flip() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            false_condition(
                "PolicyUniquelyReachable",
                "LatestReplicaSetIsNotUniquelyReachable",
                "",
            ),
        );
        set_condition(
            &mut conditions,
            true_condition(
                "PolicyUniquelyReachable",
                "LatestReplicaSetIsUniquelyReachable",
                "",
            ),
        );

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, "True");
    }

    #[test]
    fn conditions_accumulate_by_type() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, true_condition("A", "r", ""));
        set_condition(&mut conditions, false_condition("B", "r", ""));
        assert_eq!(conditions.len(), 2);
        assert!(find_condition(&conditions, "A").is_some());
        assert!(find_condition(&conditions, "C").is_none());
    }
}
