use anyhow::Result;
use clap::ArgMatches;
use lazy_static::lazy_static;
use std::env;

pub static SERVICE_NAME: &str = "kubewarden-controller";

lazy_static! {
    pub(crate) static ref HOSTNAME: String =
        env::var("HOSTNAME").unwrap_or_else(|_| String::from("unknown"));
}

#[derive(Clone, Debug)]
pub struct Config {
    pub deployment_namespace: String,
    pub webhook_service_name: String,
    pub root_ca_secret_name: String,
    pub webhook_cert_secret_name: String,
    pub enable_metrics: bool,
    pub enable_tracing: bool,
    pub always_accept_admission_reviews_on_namespace: Option<String>,
    /// OTLP environment variables the controller itself was launched with,
    /// forwarded verbatim to every policy-server pod.
    pub otlp_env: Vec<(String, String)>,
    pub log_level: String,
    pub log_fmt: String,
    pub log_no_color: bool,
}

impl Config {
    pub fn from_args(matches: &ArgMatches) -> Result<Self> {
        let deployment_namespace = matches
            .get_one::<String>("deployment-namespace")
            .expect("clap should have set a default value")
            .to_owned();
        let webhook_service_name = matches
            .get_one::<String>("webhook-service-name")
            .expect("clap should have set a default value")
            .to_owned();
        let root_ca_secret_name = matches
            .get_one::<String>("root-ca-secret-name")
            .expect("clap should have set a default value")
            .to_owned();
        let webhook_cert_secret_name = matches
            .get_one::<String>("webhook-cert-secret-name")
            .expect("clap should have set a default value")
            .to_owned();
        let enable_metrics = matches
            .get_one::<bool>("enable-metrics")
            .expect("clap should have set a default value")
            .to_owned();
        let enable_tracing = matches
            .get_one::<bool>("enable-tracing")
            .expect("clap should have set a default value")
            .to_owned();
        let always_accept_admission_reviews_on_namespace = matches
            .get_one::<String>("always-accept-admission-reviews-on-namespace")
            .map(|namespace| namespace.to_owned());

        let log_level = matches
            .get_one::<String>("log-level")
            .expect("clap should have set a default value")
            .to_owned();
        let log_fmt = matches
            .get_one::<String>("log-fmt")
            .expect("clap should have set a default value")
            .to_owned();
        let log_no_color = matches
            .get_one::<bool>("log-no-color")
            .expect("clap should have set a default value")
            .to_owned();

        Ok(Self {
            deployment_namespace,
            webhook_service_name,
            root_ca_secret_name,
            webhook_cert_secret_name,
            enable_metrics,
            enable_tracing,
            always_accept_admission_reviews_on_namespace,
            otlp_env: otlp_environment(),
            log_level,
            log_fmt,
            log_no_color,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            deployment_namespace: "kubewarden".to_string(),
            webhook_service_name: "kubewarden-controller-webhook-service".to_string(),
            root_ca_secret_name: "kubewarden-root-ca".to_string(),
            webhook_cert_secret_name: "kubewarden-webhook-server-cert".to_string(),
            enable_metrics: false,
            enable_tracing: false,
            always_accept_admission_reviews_on_namespace: None,
            otlp_env: Vec::new(),
            log_level: "info".to_string(),
            log_fmt: "text".to_string(),
            log_no_color: false,
        }
    }
}

fn otlp_environment() -> Vec<(String, String)> {
    env::vars()
        .filter(|(name, _)| name.starts_with("OTEL_"))
        .collect()
}
