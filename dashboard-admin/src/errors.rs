use crate::settings::ClusterSettings;

/// Extension methods for Kubernetes API errors.
pub(crate) trait ExtKubeApiError {
    fn is_not_found(&self) -> bool;
    /// The message reported by the API server, falls back to the error's
    /// display representation for non-API errors.
    fn api_message(&self) -> String;
}

impl ExtKubeApiError for kube::Error {
    fn is_not_found(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 404 || e.code == 410 => true,
            _ => false,
        }
    }

    fn api_message(&self) -> String {
        match self {
            kube::Error::Api(e) if !e.message.is_empty() => e.message.clone(),
            e => e.to_string(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum DashboardError {
    /// The request could not be parsed (query parameters or body).
    #[error("{0}")]
    InvalidRequest(String),
    /// A group referenced by name does not exist. Callers usually treat this
    /// as "not configured" rather than as a failure.
    #[error("group {0} does not exist")]
    MissingGroup(String),
    /// The authoritative settings store could not be read. `partial` holds
    /// the defaults overlaid with whatever could be read.
    #[error("Unable to retrieve cluster settings. {}", .source.api_message())]
    SettingsUnavailable {
        partial: Box<ClusterSettings>,
        source: kube::Error,
    },
    /// Writing the groups configuration failed.
    #[error("Failed to update groups config: {0}")]
    GroupsUpdate(String),
    /// Kubernetes API error
    #[error("{0}")]
    KubeApi(#[from] kube::Error),
}

impl DashboardError {
    /// Human readable message for the UI, preferring the API server's message
    /// over the client's error formatting.
    pub(crate) fn message(&self) -> String {
        match self {
            DashboardError::KubeApi(e) => e.api_message(),
            e => e.to_string(),
        }
    }

    pub(crate) fn is_missing_group(&self) -> bool {
        match self {
            DashboardError::MissingGroup(_) => true,
            _ => false,
        }
    }
}
