use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, EnvVar,
    HTTPGetAction, KeyToPath, PodSpec, PodTemplateSpec, Probe, SecretVolumeSource,
    SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kubewarden_crds::PolicyServer;

use crate::config::Config;
use crate::constants::{
    CERTS_MOUNT_PATH, CONFIG_MOUNT_PATH, CONFIG_VERSION_ANNOTATION, DOCKER_CONFIG_FILENAME,
    DOCKER_CONFIG_JSON_KEY, DOCKER_CONFIG_MOUNT_PATH, POLICIES_CONFIG_KEY,
    POLICY_SERVER_METRICS_PORT, POLICY_SERVER_METRICS_PORT_NAME, POLICY_SERVER_PORT,
    POLICY_SERVER_PORT_NAME, POLICY_SERVER_READINESS_PROBE_PATH, POLICY_STORE_MOUNT_PATH,
    SERVER_CERT_KEY, SERVER_PRIVATE_KEY_KEY, SIGSTORE_CACHE_MOUNT_PATH, SOURCES_CONFIG_KEY,
    VERIFICATION_CONFIG_FILENAME, VERIFICATION_CONFIG_MOUNT_PATH,
};
use crate::resources::{child_labels, owner_reference, pod_selector};

const CONTAINER_NAME: &str = "policy-server";
const CERTS_VOLUME: &str = "certs";
const CONFIG_VOLUME: &str = "config";
const POLICY_STORE_VOLUME: &str = "policy-store";
const SIGSTORE_CACHE_VOLUME: &str = "sigstore-cache";
const VERIFICATION_CONFIG_VOLUME: &str = "verification-config";
const DOCKER_CONFIG_VOLUME: &str = "docker-config";

/// The policy-server deployment. The configmap's `resourceVersion` is
/// written as the config-version annotation on both the deployment and its
/// pod template: a rollout can then be matched to the exact policy set it
/// serves, which is what the uniqueness barrier keys on.
pub fn desired_deployment(
    policy_server: &PolicyServer,
    config: &Config,
    config_version: &str,
) -> Deployment {
    let name = policy_server.name_with_prefix();

    let mut deployment_annotations = BTreeMap::new();
    deployment_annotations.insert(
        CONFIG_VERSION_ANNOTATION.to_string(),
        config_version.to_string(),
    );

    let mut pod_annotations = policy_server.spec.annotations.clone().unwrap_or_default();
    pod_annotations.insert(
        CONFIG_VERSION_ANNOTATION.to_string(),
        config_version.to_string(),
    );

    Deployment {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(config.deployment_namespace.clone()),
            labels: Some(child_labels(policy_server)),
            annotations: Some(deployment_annotations),
            owner_references: Some(owner_reference(policy_server)),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(policy_server.spec.replicas),
            selector: LabelSelector {
                match_labels: Some(pod_selector(policy_server)),
                match_expressions: None,
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(child_labels(policy_server)),
                    annotations: Some(pod_annotations),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container(policy_server, config)],
                    volumes: Some(volumes(policy_server, &name)),
                    service_account_name: policy_server.spec.service_account_name.clone(),
                    affinity: policy_server.spec.affinity.clone(),
                    tolerations: policy_server.spec.tolerations.clone(),
                    security_context: policy_server
                        .spec
                        .security_contexts
                        .as_ref()
                        .and_then(|contexts| contexts.pod.clone()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn container(policy_server: &PolicyServer, config: &Config) -> Container {
    let mut ports = vec![ContainerPort {
        container_port: POLICY_SERVER_PORT,
        name: Some(POLICY_SERVER_PORT_NAME.to_string()),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }];
    if config.enable_metrics {
        ports.push(ContainerPort {
            container_port: POLICY_SERVER_METRICS_PORT,
            name: Some(POLICY_SERVER_METRICS_PORT_NAME.to_string()),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        });
    }

    Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(policy_server.spec.image.clone()),
        env: Some(container_env(policy_server, config)),
        ports: Some(ports),
        volume_mounts: Some(volume_mounts(policy_server)),
        resources: policy_server.spec.resources.clone(),
        readiness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some(POLICY_SERVER_READINESS_PROBE_PATH.to_string()),
                port: IntOrString::Int(POLICY_SERVER_PORT),
                scheme: Some("HTTPS".to_string()),
                ..Default::default()
            }),
            initial_delay_seconds: Some(5),
            ..Default::default()
        }),
        security_context: Some(
            policy_server
                .spec
                .security_contexts
                .as_ref()
                .and_then(|contexts| contexts.container.clone())
                .unwrap_or_else(default_container_security_context),
        ),
        ..Default::default()
    }
}

fn default_container_security_context() -> SecurityContext {
    SecurityContext {
        allow_privilege_escalation: Some(false),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".to_string()]),
            add: None,
        }),
        privileged: Some(false),
        read_only_root_filesystem: Some(true),
        run_as_non_root: Some(true),
        ..Default::default()
    }
}

/// The environment contract between the control plane and the data plane:
/// the policy-server reads exactly these variables.
fn container_env(policy_server: &PolicyServer, config: &Config) -> Vec<EnvVar> {
    let literal = |name: &str, value: String| EnvVar {
        name: name.to_string(),
        value: Some(value),
        value_from: None,
    };

    let mut env = vec![
        literal(
            "KUBEWARDEN_CERT_FILE",
            format!("{CERTS_MOUNT_PATH}/{SERVER_CERT_KEY}"),
        ),
        literal(
            "KUBEWARDEN_KEY_FILE",
            format!("{CERTS_MOUNT_PATH}/{SERVER_PRIVATE_KEY_KEY}"),
        ),
        literal("KUBEWARDEN_PORT", POLICY_SERVER_PORT.to_string()),
        literal(
            "KUBEWARDEN_POLICIES",
            format!("{CONFIG_MOUNT_PATH}/{POLICIES_CONFIG_KEY}"),
        ),
        literal(
            "KUBEWARDEN_SOURCES_PATH",
            format!("{CONFIG_MOUNT_PATH}/{SOURCES_CONFIG_KEY}"),
        ),
        literal(
            "KUBEWARDEN_POLICIES_DOWNLOAD_DIR",
            POLICY_STORE_MOUNT_PATH.to_string(),
        ),
        literal(
            "KUBEWARDEN_SIGSTORE_CACHE_DIR",
            SIGSTORE_CACHE_MOUNT_PATH.to_string(),
        ),
    ];

    if policy_server.spec.verification_config.is_some() {
        env.push(literal(
            "KUBEWARDEN_VERIFICATION_CONFIG_PATH",
            format!("{VERIFICATION_CONFIG_MOUNT_PATH}/{VERIFICATION_CONFIG_FILENAME}"),
        ));
    }
    if policy_server.spec.image_pull_secret.is_some() {
        env.push(literal(
            "KUBEWARDEN_DOCKER_CONFIG_JSON_PATH",
            format!("{DOCKER_CONFIG_MOUNT_PATH}/{DOCKER_CONFIG_FILENAME}"),
        ));
    }
    if let Some(namespace) = &config.always_accept_admission_reviews_on_namespace {
        env.push(literal(
            "KUBEWARDEN_ALWAYS_ACCEPT_ADMISSION_REVIEWS_ON_NAMESPACE",
            namespace.clone(),
        ));
    }
    if config.enable_metrics {
        env.push(literal("KUBEWARDEN_ENABLE_METRICS", "true".to_string()));
    }
    if config.enable_tracing {
        env.push(literal("KUBEWARDEN_LOG_FMT", "otlp".to_string()));
    }
    for (name, value) in &config.otlp_env {
        env.push(literal(name, value.clone()));
    }

    // user-provided variables are appended last, without overriding the
    // contract above
    if let Some(user_env) = &policy_server.spec.env {
        for variable in user_env {
            if !env.iter().any(|existing| existing.name == variable.name) {
                env.push(variable.clone());
            }
        }
    }

    env
}

fn volume_mounts(policy_server: &PolicyServer) -> Vec<VolumeMount> {
    let read_only = |name: &str, path: &str| VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: Some(true),
        ..Default::default()
    };
    let writable = |name: &str, path: &str| VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    };

    let mut mounts = vec![
        read_only(CERTS_VOLUME, CERTS_MOUNT_PATH),
        read_only(CONFIG_VOLUME, CONFIG_MOUNT_PATH),
        writable(POLICY_STORE_VOLUME, POLICY_STORE_MOUNT_PATH),
        writable(SIGSTORE_CACHE_VOLUME, SIGSTORE_CACHE_MOUNT_PATH),
    ];
    if policy_server.spec.verification_config.is_some() {
        mounts.push(read_only(
            VERIFICATION_CONFIG_VOLUME,
            VERIFICATION_CONFIG_MOUNT_PATH,
        ));
    }
    if policy_server.spec.image_pull_secret.is_some() {
        mounts.push(read_only(DOCKER_CONFIG_VOLUME, DOCKER_CONFIG_MOUNT_PATH));
    }
    mounts
}

fn volumes(policy_server: &PolicyServer, name: &str) -> Vec<Volume> {
    let mut volumes = vec![
        Volume {
            name: CERTS_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(name.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: CONFIG_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: name.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: POLICY_STORE_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
        Volume {
            name: SIGSTORE_CACHE_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    ];

    if let Some(verification_config) = &policy_server.spec.verification_config {
        volumes.push(Volume {
            name: VERIFICATION_CONFIG_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: verification_config.clone(),
                items: Some(vec![KeyToPath {
                    key: VERIFICATION_CONFIG_FILENAME.to_string(),
                    path: VERIFICATION_CONFIG_FILENAME.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    if let Some(image_pull_secret) = &policy_server.spec.image_pull_secret {
        volumes.push(Volume {
            name: DOCKER_CONFIG_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(image_pull_secret.clone()),
                items: Some(vec![KeyToPath {
                    key: DOCKER_CONFIG_JSON_KEY.to_string(),
                    path: DOCKER_CONFIG_FILENAME.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    volumes
}
