pub mod policies;
pub mod policy_server;
pub mod validation;

pub use policies::admission_policy::{AdmissionPolicy, AdmissionPolicySpec};
pub use policies::admission_policy_group::{AdmissionPolicyGroup, AdmissionPolicyGroupSpec};
pub use policies::cluster_admission_policy::{ClusterAdmissionPolicy, ClusterAdmissionPolicySpec};
pub use policies::cluster_admission_policy_group::{
    ClusterAdmissionPolicyGroup, ClusterAdmissionPolicyGroupSpec,
};
pub use policies::common::{
    ContextAwareResource, FailurePolicy, MatchPolicy, PolicyGroupMember,
    PolicyGroupMemberWithContext, PolicyMode, PolicyModeStatus, PolicyStatus, PolicyStatusPhase,
    SideEffects,
};
pub use policies::{Policy, PolicyScope};
pub use policy_server::{PolicyServer, PolicyServerSecurity, PolicyServerSpec, PolicyServerStatus};
