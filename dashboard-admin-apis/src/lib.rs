use kube::{CustomResource, ResourceExt};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Name of the cluster-singleton dashboard configuration object.
pub const DEFAULT_DASHBOARD_CONFIG_NAME: &'static str = "odh-dashboard-config";

/// Dashboard-wide configuration. Only the fields read or written by the
/// administration API are modelled, all other fields are ignored on read and
/// never written back.
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "opendatahub.io",
    version = "v1alpha",
    kind = "OdhDashboardConfig",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct OdhDashboardConfigSpec {
    /// Notebook controller settings, selects which ConfigMap holds the cluster settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notebook_controller: Option<NotebookControllerConfig>,
    /// Admin and allowed groups of the dashboard.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups_config: Option<GroupsConfig>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NotebookControllerConfig {
    /// If `true` the notebook controller is in charge of culling and storage,
    /// otherwise the legacy jupyterhub deployment is.
    #[serde(default)]
    pub enabled: bool,
    /// Default size of notebook PVCs, e.g. `20Gi`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc_size: Option<String>,
}

/// Admin and allowed groups, each a comma separated list of group names.
/// Always written as a pair.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GroupsConfig {
    #[serde(default)]
    pub admin_groups: String,
    #[serde(default)]
    pub allowed_groups: String,
}

fn split_group_names(groups: &str) -> Vec<&str> {
    groups
        .split(',')
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .collect()
}

impl GroupsConfig {
    pub fn admin_group_names(&self) -> Vec<&str> {
        split_group_names(&self.admin_groups)
    }

    pub fn allowed_group_names(&self) -> Vec<&str> {
        split_group_names(&self.allowed_groups)
    }
}

impl OdhDashboardConfigSpec {
    pub fn notebook_controller_enabled(&self) -> bool {
        self.notebook_controller
            .as_ref()
            .map_or(false, |v| v.enabled)
    }

    pub fn notebook_pvc_size(&self) -> Option<&str> {
        self.notebook_controller
            .as_ref()
            .map(|v| v.pvc_size.as_deref())
            .flatten()
    }

    /// The configured groups, empty strings if not yet configured.
    pub fn groups_config(&self) -> GroupsConfig {
        self.groups_config.clone().unwrap_or_default()
    }
}

impl OdhDashboardConfig {
    pub fn id(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or(""),
            self.name_any(),
        )
    }
}
