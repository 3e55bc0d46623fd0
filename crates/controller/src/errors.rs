use crate::certs::CertificateError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("cannot serialize policy server configuration: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Certificate(#[from] CertificateError),

    #[error("secret {secret}: missing key {key}")]
    MalformedSecret { secret: String, key: String },

    #[error("lost leadership of lease {0}")]
    LeadershipLost(String),

    #[error("timed out waiting for the API server")]
    ApiTimeout(#[from] tokio::time::error::Elapsed),
}

impl Error {
    /// Conflicts are not failures: the work-queue will observe the newer
    /// object state and run the reconcile again.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(response)) if response.code == 409)
    }
}
