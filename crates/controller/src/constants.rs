/// Field manager used for every server-side apply issued by the controller.
pub const FIELD_MANAGER: &str = "kubewarden-controller";

// Labels.
pub const PART_OF_LABEL_KEY: &str = "app.kubernetes.io/part-of";
pub const PART_OF_LABEL_VALUE: &str = "kubewarden";
pub const COMPONENT_LABEL_KEY: &str = "app.kubernetes.io/component";
pub const COMPONENT_LABEL_VALUE: &str = "policy-server";
pub const POLICY_SERVER_LABEL_KEY: &str = "kubewarden/policy-server";
pub const POLICY_SCOPE_LABEL_KEY: &str = "kubewarden.io/policy-scope";
pub const POD_TEMPLATE_HASH_LABEL_KEY: &str = "pod-template-hash";

// Annotations.
pub const POLICY_NAME_ANNOTATION: &str = "kubewarden.io/policy-name";
pub const POLICY_NAMESPACE_ANNOTATION: &str = "kubewarden.io/policy-namespace";
pub const POLICY_GROUP_ANNOTATION: &str = "kubewarden.io/policy-group";
pub const CONFIG_VERSION_ANNOTATION: &str = "kubewarden.io/config-version";
pub const DEPLOYMENT_REVISION_ANNOTATION: &str = "deployment.kubernetes.io/revision";

// Finalizers. Only the domain-qualified one is ever added; the legacy one is
// stripped on deletion for objects created before the migration.
pub const KUBEWARDEN_FINALIZER: &str = "kubewarden.io/finalizer";
pub const LEGACY_FINALIZER: &str = "kubewarden";

// Policy server wiring.
pub const POLICY_SERVER_PORT: i32 = 8443;
pub const POLICY_SERVER_PORT_NAME: &str = "https";
pub const POLICY_SERVER_LEGACY_PORT: i32 = 443;
pub const POLICY_SERVER_LEGACY_PORT_NAME: &str = "https-legacy";
pub const POLICY_SERVER_METRICS_PORT: i32 = 8080;
pub const POLICY_SERVER_METRICS_PORT_NAME: &str = "metrics";
pub const POLICY_SERVER_READINESS_PROBE_PATH: &str = "/readiness";

// Keys of the policy-server configmap.
pub const POLICIES_CONFIG_KEY: &str = "policies.yml";
pub const SOURCES_CONFIG_KEY: &str = "sources.yml";

// Mount points inside the policy-server container.
pub const CERTS_MOUNT_PATH: &str = "/pki";
pub const CONFIG_MOUNT_PATH: &str = "/config";
pub const POLICY_STORE_MOUNT_PATH: &str = "/policy-store";
pub const SIGSTORE_CACHE_MOUNT_PATH: &str = "/tmp/sigstore-data";
pub const VERIFICATION_CONFIG_MOUNT_PATH: &str = "/verification";
pub const VERIFICATION_CONFIG_FILENAME: &str = "verification-config.yml";
pub const DOCKER_CONFIG_MOUNT_PATH: &str = "/home/kubewarden/.docker";
pub const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";
pub const DOCKER_CONFIG_FILENAME: &str = "config.json";

// Keys of the root CA secret.
pub const CA_ROOT_CERT_KEY: &str = "caRootCert";
pub const CA_ROOT_PRIVATE_KEY_KEY: &str = "caRootPrivateKey";
pub const OLD_CA_ROOT_CERT_KEY: &str = "oldCARootCert";

// Keys of the server certificate secrets.
pub const SERVER_CERT_KEY: &str = "serverCert";
pub const SERVER_PRIVATE_KEY_KEY: &str = "serverPrivateKey";

// Inner webhook names end with this suffix: `<uniqueName>.kubewarden.admission`.
pub const WEBHOOK_NAME_SUFFIX: &str = ".kubewarden.admission";

// Condition types.
pub const CONDITION_POLICY_ACTIVE: &str = "PolicyActive";
pub const CONDITION_POLICY_UNIQUELY_REACHABLE: &str = "PolicyUniquelyReachable";
pub const CONDITION_POLICY_SERVER_CONFIGURATION_UP_TO_DATE: &str =
    "PolicyServerConfigurationUpToDate";
pub const CONDITION_CONFIGMAP_RECONCILED: &str = "ConfigMapReconciled";
pub const CONDITION_DEPLOYMENT_RECONCILED: &str = "DeploymentReconciled";
pub const CONDITION_SERVICE_RECONCILED: &str = "ServiceReconciled";
pub const CONDITION_CERT_SECRET_RECONCILED: &str = "CertSecretReconciled";
pub const CONDITION_CA_ROOT_SECRET_RECONCILED: &str = "CARootSecretReconciled";
pub const CONDITION_PDB_RECONCILED: &str = "PodDisruptionBudgetReconciled";

// Condition reasons.
pub const REASON_POLICY_ACTIVE: &str = "PolicyActive";
pub const REASON_POLICY_SERVER_NOT_REACHED: &str = "PolicyServerNotReached";
pub const REASON_UNIQUELY_REACHABLE: &str = "LatestReplicaSetIsUniquelyReachable";
pub const REASON_NOT_UNIQUELY_REACHABLE: &str = "LatestReplicaSetIsNotUniquelyReachable";
pub const REASON_CONFIGURATION_VERSION_MATCH: &str = "ConfigurationVersionMatch";
pub const REASON_CONFIGURATION_VERSION_MISMATCH: &str = "ConfigurationVersionMismatch";
pub const REASON_UNKNOWN_CONFIGURATION_VERSION: &str = "UnknownConfigurationVersion";
pub const REASON_RECONCILIATION_SUCCEEDED: &str = "ReconciliationSucceeded";
pub const REASON_RECONCILIATION_FAILED: &str = "ReconciliationFailed";
