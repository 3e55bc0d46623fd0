//! The reverse index answering "which policies reference policy server W?"
//! without listing the cluster. Each policy controller maintains one: the
//! reconciler records the binding it observes, and the watch mappers read it
//! to fan child events out to the affected policies.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use kube::runtime::reflector::ObjectRef;
use kube::Resource;

pub struct PolicyIndex<P>
where
    P: Resource,
    P::DynamicType: std::hash::Hash + Eq,
{
    by_server: RwLock<HashMap<String, HashSet<ObjectRef<P>>>>,
    by_policy: RwLock<HashMap<ObjectRef<P>, String>>,
}

impl<P> Default for PolicyIndex<P>
where
    P: Resource,
    P::DynamicType: std::hash::Hash + Eq,
{
    fn default() -> Self {
        PolicyIndex {
            by_server: RwLock::new(HashMap::new()),
            by_policy: RwLock::new(HashMap::new()),
        }
    }
}

impl<P> PolicyIndex<P>
where
    P: Resource,
    P::DynamicType: std::hash::Hash + Eq + Clone,
{
    /// Records that `policy` is bound to `policy_server`, dropping any
    /// previous binding of the same policy.
    pub fn bind(&self, policy_server: &str, policy: ObjectRef<P>) {
        self.unbind(&policy);

        self.by_policy
            .write()
            .expect("policy index poisoned")
            .insert(policy.clone(), policy_server.to_string());
        self.by_server
            .write()
            .expect("policy index poisoned")
            .entry(policy_server.to_string())
            .or_default()
            .insert(policy);
    }

    pub fn unbind(&self, policy: &ObjectRef<P>) {
        let previous = self
            .by_policy
            .write()
            .expect("policy index poisoned")
            .remove(policy);
        if let Some(previous_server) = previous {
            let mut by_server = self.by_server.write().expect("policy index poisoned");
            if let Some(policies) = by_server.get_mut(&previous_server) {
                policies.remove(policy);
                if policies.is_empty() {
                    by_server.remove(&previous_server);
                }
            }
        }
    }

    pub fn policies_for(&self, policy_server: &str) -> Vec<ObjectRef<P>> {
        self.by_server
            .read()
            .expect("policy index poisoned")
            .get(policy_server)
            .map(|policies| policies.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubewarden_crds::ClusterAdmissionPolicy;

    fn policy_ref(name: &str) -> ObjectRef<ClusterAdmissionPolicy> {
        ObjectRef::new(name)
    }

    #[test]
    fn bind_and_lookup() {
        let index = PolicyIndex::<ClusterAdmissionPolicy>::default();
        index.bind("default", policy_ref("p1"));
        index.bind("default", policy_ref("p2"));
        index.bind("other", policy_ref("p3"));

        let mut bound = index.policies_for("default");
        bound.sort_by_key(|reference| reference.name.clone());
        assert_eq!(bound.len(), 2);
        assert_eq!(bound[0].name, "p1");
        assert!(index.policies_for("missing").is_empty());
    }

    #[test]
    fn rebinding_moves_the_policy() {
        let index = PolicyIndex::<ClusterAdmissionPolicy>::default();
        index.bind("default", policy_ref("p1"));
        index.bind("other", policy_ref("p1"));

        assert!(index.policies_for("default").is_empty());
        assert_eq!(index.policies_for("other").len(), 1);
    }

    #[test]
    fn unbind_clears_empty_buckets() {
        let index = PolicyIndex::<ClusterAdmissionPolicy>::default();
        index.bind("default", policy_ref("p1"));
        index.unbind(&policy_ref("p1"));
        assert!(index.policies_for("default").is_empty());
    }
}
