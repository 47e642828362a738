use k8s_openapi::{api::apps::v1::Deployment, chrono::Utc};
use kube::{
    Api, Client,
    api::{ApiResource, DynamicObject, GroupVersionKind, Patch, PatchParams, PostParams},
};
use serde_json::{Value, json};

use crate::MANAGER;

/// Pod template annotation used by `kubectl rollout restart`.
pub(crate) const RESTARTED_AT_ANNOTATION: &'static str = "kubectl.kubernetes.io/restartedAt";

/// A workload to restart so it picks up changed configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Rollout {
    /// A `apps/v1` Deployment, restarted by bumping its pod template annotation.
    Deployment(&'static str),
    /// An OpenShift `apps.openshift.io/v1` DeploymentConfig, restarted by
    /// requesting a new instantiation.
    DeploymentConfig(&'static str),
}

impl Rollout {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Rollout::Deployment(name) => name,
            Rollout::DeploymentConfig(name) => name,
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Rollout::Deployment(_) => "Deployment",
            Rollout::DeploymentConfig(_) => "DeploymentConfig",
        }
    }
}

impl std::fmt::Display for Rollout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind(), self.name())
    }
}

fn restart_patch(restarted_at: &str) -> Value {
    json!({
        "spec": {
            "template": {
                "metadata": {
                    "annotations": {
                        RESTARTED_AT_ANNOTATION: restarted_at
                    }
                }
            }
        }
    })
}

fn deployment_request(name: &str) -> Value {
    json!({
        "kind": "DeploymentRequest",
        "apiVersion": "apps.openshift.io/v1",
        "name": name,
        "latest": true,
        "force": true,
    })
}

/// Restart a Deployment. Returns as soon as the API server accepted the
/// change, the rollout itself is not awaited.
pub(crate) async fn rollout_deployment(
    client: Client,
    namespace: &str,
    name: &str,
) -> kube::Result<()> {
    let api: Api<Deployment> = Api::namespaced(client, namespace);
    let now = Utc::now().to_rfc3339();
    api.patch(
        name,
        &PatchParams {
            field_manager: Some(MANAGER.to_string()),
            ..Default::default()
        },
        &Patch::Merge(restart_patch(now.as_str())),
    )
    .await?;
    Ok(())
}

/// Trigger a new deployment of an OpenShift DeploymentConfig via its
/// `instantiate` subresource. The rollout itself is not awaited.
pub(crate) async fn rollout_deployment_config(
    client: Client,
    namespace: &str,
    name: &str,
) -> kube::Result<()> {
    let gvk = GroupVersionKind::gvk("apps.openshift.io", "v1", "DeploymentConfig");
    let api_resource = ApiResource::from_gvk(&gvk);
    let api: Api<DynamicObject> = Api::namespaced_with(client, namespace, &api_resource);
    let request =
        serde_json::to_vec(&deployment_request(name)).map_err(|e| kube::Error::SerdeError(e))?;
    let _: DynamicObject = api
        .create_subresource(
            "instantiate",
            name,
            &PostParams {
                field_manager: Some(MANAGER.to_string()),
                ..Default::default()
            },
            request,
        )
        .await?;
    Ok(())
}
