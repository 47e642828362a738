use std::{collections::BTreeMap, future::Future};

use dashboard_admin_apis::OdhDashboardConfig;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{
    Api, Client, ResourceExt,
    api::{
        ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, ObjectMeta, Patch,
        PatchParams, PostParams,
    },
};
use serde_json::json;

use crate::{
    MANAGER,
    rollout::{Rollout, rollout_deployment, rollout_deployment_config},
};

/// The Kubernetes operations the dashboard administration API relies on,
/// scoped to the dashboard's namespace.
///
/// Not-found conditions are reported as [`kube::Error::Api`] with code 404 so
/// callers can decide whether absence is benign.
pub(crate) trait ClusterApi: Send + Sync {
    fn get_config_map(&self, name: &str) -> impl Future<Output = kube::Result<ConfigMap>> + Send;

    /// Merge `data` into the `data` field of an existing ConfigMap.
    fn patch_config_map_data(
        &self,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> impl Future<Output = kube::Result<ConfigMap>> + Send;

    fn create_config_map(
        &self,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> impl Future<Output = kube::Result<ConfigMap>> + Send;

    fn delete_config_map(&self, name: &str) -> impl Future<Output = kube::Result<()>> + Send;

    /// Request a restart of the given workload without waiting for it to complete.
    fn rollout(&self, rollout: &Rollout) -> impl Future<Output = kube::Result<()>> + Send;

    /// Users of an OpenShift group.
    fn get_group_users(
        &self,
        name: &str,
    ) -> impl Future<Output = kube::Result<Vec<String>>> + Send;

    /// Names of all OpenShift groups.
    fn list_groups(&self) -> impl Future<Output = kube::Result<Vec<String>>> + Send;

    /// Merge patch the named dashboard configuration.
    fn patch_dashboard_config(
        &self,
        name: &str,
        patch: serde_json::Value,
    ) -> impl Future<Output = kube::Result<OdhDashboardConfig>> + Send;
}

/// [`ClusterApi`] backed by a real Kubernetes API server.
#[derive(Clone)]
pub(crate) struct KubeCluster {
    client: Client,
    namespace: String,
}

impl KubeCluster {
    pub(crate) fn new(client: Client, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
        }
    }

    fn config_maps(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), self.namespace.as_str())
    }

    fn groups(&self) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk("user.openshift.io", "v1", "Group");
        Api::all_with(self.client.clone(), &ApiResource::from_gvk(&gvk))
    }

    fn patch_params() -> PatchParams {
        PatchParams {
            field_manager: Some(MANAGER.to_string()),
            ..Default::default()
        }
    }
}

/// OpenShift groups keep their members in a top-level `users` array which
/// may be `null` for empty groups.
fn group_users(group: &DynamicObject) -> Vec<String> {
    group
        .data
        .get("users")
        .and_then(|v| v.as_array())
        .map(|users| {
            users
                .iter()
                .filter_map(|u| u.as_str().map(|u| u.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

impl ClusterApi for KubeCluster {
    async fn get_config_map(&self, name: &str) -> kube::Result<ConfigMap> {
        self.config_maps().get(name).await
    }

    async fn patch_config_map_data(
        &self,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> kube::Result<ConfigMap> {
        let patch = json!({ "data": data });
        self.config_maps()
            .patch(name, &Self::patch_params(), &Patch::Merge(&patch))
            .await
    }

    async fn create_config_map(
        &self,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> kube::Result<ConfigMap> {
        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };
        self.config_maps()
            .create(
                &PostParams {
                    field_manager: Some(MANAGER.to_string()),
                    ..Default::default()
                },
                &config_map,
            )
            .await
    }

    async fn delete_config_map(&self, name: &str) -> kube::Result<()> {
        self.config_maps()
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn rollout(&self, rollout: &Rollout) -> kube::Result<()> {
        match rollout {
            Rollout::Deployment(name) => {
                rollout_deployment(self.client.clone(), self.namespace.as_str(), name).await
            }
            Rollout::DeploymentConfig(name) => {
                rollout_deployment_config(self.client.clone(), self.namespace.as_str(), name).await
            }
        }
    }

    async fn get_group_users(&self, name: &str) -> kube::Result<Vec<String>> {
        let group = self.groups().get(name).await?;
        Ok(group_users(&group))
    }

    async fn list_groups(&self) -> kube::Result<Vec<String>> {
        let groups = self.groups().list(&ListParams::default()).await?;
        Ok(groups.items.iter().map(|g| g.name_any()).collect())
    }

    async fn patch_dashboard_config(
        &self,
        name: &str,
        patch: serde_json::Value,
    ) -> kube::Result<OdhDashboardConfig> {
        let api: Api<OdhDashboardConfig> =
            Api::namespaced(self.client.clone(), self.namespace.as_str());
        api.patch(name, &Self::patch_params(), &Patch::Merge(&patch))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn group(users: serde_json::Value) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "user.openshift.io/v1",
            "kind": "Group",
            "metadata": { "name": "odh-admins" },
            "users": users,
        }))
        .unwrap()
    }

    #[test]
    fn users_of_group() {
        assert_eq!(
            vec!["alice".to_string(), "bob".to_string()],
            group_users(&group(json!(["alice", "bob"])))
        );
    }

    #[test]
    fn users_of_empty_group() {
        assert!(group_users(&group(json!(null))).is_empty());
        assert!(group_users(&group(json!([]))).is_empty());
    }
}
