use thiserror::Error;

/// Expose all controller components used by main
pub mod operator;
pub mod resources;

/// Process-wide configuration and cluster facts
pub mod cluster;
pub mod config;

/// Hooks offered to the vendored engine operator
pub mod hooks;

/// Lease based leader election
pub mod leader;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;
pub use metrics::Metrics;

// Internal only
mod reconcilers;

#[cfg(test)]
mod testing;

/// Name of the singleton `GitopsService` and of the backend workload
pub const SERVICE_NAME: &str = "cluster";

/// Namespace hosting the default engine instance and most workloads
pub const ENGINE_NAMESPACE: &str = "openshift-gitops";

/// Backend namespace on 4.6 clusters
pub const DEPRECATED_BACKEND_NAMESPACE: &str = "openshift-pipelines-app-delivery";

/// Name of the default engine instance
pub const ENGINE_INSTANCE_NAME: &str = "openshift-gitops";

/// Field manager and `app.kubernetes.io/managed-by` value
pub const OPERATOR_NAME: &str = "gitops-operator";

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    #[error("Hook failed for {0}: {1}")]
    HookError(String, #[source] Box<Error>),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Gave up on {0} after {1} conflicting writes")]
    ConflictRetriesExhausted(String, usize),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::KubeError(kube::Error::Api(e)) => format!("kubeerror_{}", e.reason.to_lowercase()),
            Error::KubeError(_) => "kubeerror".into(),
            Error::MissingObjectKey(key) => format!("missingobjectkey_{key}"),
            Error::HookError(..) => "hookerror".into(),
            Error::InvalidConfig(_) => "invalidconfig".into(),
            Error::ConflictRetriesExhausted(..) => "conflictretriesexhausted".into(),
        }
    }

    /// Whether the error is an API status with the given HTTP code
    pub fn is_status(&self, code: u16) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(e)) if e.code == code)
    }
}
