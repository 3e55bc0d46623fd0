use clap::builder::PossibleValue;
use clap::{crate_authors, crate_description, crate_name, crate_version, Arg, ArgAction, Command};

pub fn build_cli() -> Command {
    let mut args = vec![
        Arg::new("log-level")
            .long("log-level")
            .value_name("LOG_LEVEL")
            .env("KUBEWARDEN_LOG_LEVEL")
            .default_value("info")
            .value_parser([
                PossibleValue::new("trace"),
                PossibleValue::new("debug"),
                PossibleValue::new("info"),
                PossibleValue::new("warn"),
                PossibleValue::new("error"),
            ])
            .help("Log level"),
        Arg::new("log-fmt")
            .long("log-fmt")
            .value_name("LOG_FMT")
            .env("KUBEWARDEN_LOG_FMT")
            .default_value("text")
            .value_parser([PossibleValue::new("text"), PossibleValue::new("json")])
            .help("Log output format"),
        Arg::new("log-no-color")
            .long("log-no-color")
            .env("NO_COLOR")
            .action(ArgAction::SetTrue)
            .help("Disable colored output for logs"),
        Arg::new("deployment-namespace")
            .long("deployment-namespace")
            .value_name("NAMESPACE")
            .env("KUBEWARDEN_DEPLOYMENT_NAMESPACE")
            .default_value("kubewarden")
            .help("Namespace where the Kubewarden stack (and every policy server) is deployed"),
        Arg::new("webhook-service-name")
            .long("webhook-service-name")
            .value_name("SERVICE_NAME")
            .env("KUBEWARDEN_WEBHOOK_SERVICE_NAME")
            .default_value("kubewarden-controller-webhook-service")
            .help("Name of the service exposing the controller's own webhook server"),
        Arg::new("root-ca-secret-name")
            .long("root-ca-secret-name")
            .value_name("SECRET_NAME")
            .env("KUBEWARDEN_ROOT_CA_SECRET_NAME")
            .default_value("kubewarden-root-ca")
            .help("Name of the secret holding the root certificate authority"),
        Arg::new("webhook-cert-secret-name")
            .long("webhook-cert-secret-name")
            .value_name("SECRET_NAME")
            .env("KUBEWARDEN_WEBHOOK_CERT_SECRET_NAME")
            .default_value("kubewarden-webhook-server-cert")
            .help("Name of the secret holding the controller's webhook server certificate"),
        Arg::new("enable-metrics")
            .long("enable-metrics")
            .env("KUBEWARDEN_ENABLE_METRICS")
            .action(ArgAction::SetTrue)
            .help("Enable metrics collection on all policy servers"),
        Arg::new("enable-tracing")
            .long("enable-tracing")
            .env("KUBEWARDEN_ENABLE_TRACING")
            .action(ArgAction::SetTrue)
            .help("Enable OpenTelemetry log forwarding on all policy servers"),
        Arg::new("always-accept-admission-reviews-on-namespace")
            .long("always-accept-admission-reviews-on-namespace")
            .value_name("NAMESPACE")
            .env("KUBEWARDEN_ALWAYS_ACCEPT_ADMISSION_REVIEWS_ON_NAMESPACE")
            .required(false)
            .help("Tell policy servers to always accept AdmissionReviews that target the given namespace"),
    ];
    args.sort_by(|a, b| a.get_id().cmp(b.get_id()));

    Command::new(crate_name!())
        .author(crate_authors!())
        .version(crate_version!())
        .about(crate_description!())
        .args(args)
}
