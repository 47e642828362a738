//! In-memory [`ClusterApi`] for unit tests.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Mutex,
};

use dashboard_admin_apis::{
    DEFAULT_DASHBOARD_CONFIG_NAME, NotebookControllerConfig, OdhDashboardConfig,
    OdhDashboardConfigSpec,
};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ObjectMeta;

use crate::{
    cluster::ClusterApi,
    dashboard_config::{ConfigSource, DashboardConfig},
    rollout::Rollout,
};

pub(crate) const NAMESPACE: &'static str = "opendatahub";

pub(crate) fn api_error(code: u16, message: &str) -> kube::Error {
    let reason = match code {
        403 => "Forbidden",
        404 => "NotFound",
        409 => "AlreadyExists",
        410 => "Gone",
        _ => "InternalError",
    };
    kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: reason.to_string(),
        code,
    })
}

pub(crate) fn not_found(resource: &str, name: &str) -> kube::Error {
    api_error(404, &format!("{} \"{}\" not found", resource, name))
}

fn injected_error(resource: &str, name: &str, code: u16) -> kube::Error {
    match code {
        403 => api_error(code, &format!("{} \"{}\" is forbidden", resource, name)),
        404 => not_found(resource, name),
        _ => api_error(code, &format!("internal error on {} \"{}\"", resource, name)),
    }
}

fn mode(enabled: bool) -> DashboardConfig {
    DashboardConfig {
        name: DEFAULT_DASHBOARD_CONFIG_NAME.to_string(),
        spec: OdhDashboardConfigSpec {
            notebook_controller: Some(NotebookControllerConfig {
                enabled,
                pvc_size: None,
            }),
            groups_config: None,
        },
    }
}

pub(crate) fn notebook_controller_mode() -> DashboardConfig {
    mode(true)
}

pub(crate) fn legacy_mode() -> DashboardConfig {
    mode(false)
}

impl ConfigSource for DashboardConfig {
    fn snapshot(&self) -> DashboardConfig {
        self.clone()
    }
}

#[derive(Default)]
struct FakeState {
    config_maps: BTreeMap<String, BTreeMap<String, String>>,
    groups: BTreeMap<String, Vec<String>>,
    /// Stored as sent to the API server, fields missing from the raw object
    /// stay missing.
    dashboard_config: Option<serde_json::Value>,
    rollouts: Vec<Rollout>,
    /// Successful mutations, e.g. `patch jupyterhub-cfg`.
    writes: Vec<String>,
    failing_reads: BTreeMap<String, u16>,
    failing_writes: BTreeMap<String, u16>,
    failing_groups: Option<u16>,
    vanishing: BTreeSet<String>,
}

/// Fake cluster holding ConfigMaps, groups and the dashboard configuration in
/// memory and recording mutations and rollouts.
#[derive(Default)]
pub(crate) struct FakeCluster {
    state: Mutex<FakeState>,
}

impl FakeCluster {
    fn with(self, f: impl FnOnce(&mut FakeState)) -> Self {
        f(&mut self.state.lock().unwrap());
        self
    }

    pub(crate) fn with_config_map(self, name: &str, data: BTreeMap<String, String>) -> Self {
        self.with(|s| {
            s.config_maps.insert(name.to_string(), data);
        })
    }

    pub(crate) fn with_group(self, name: &str, users: &[&str]) -> Self {
        self.with(|s| {
            s.groups.insert(
                name.to_string(),
                users.iter().map(|u| u.to_string()).collect(),
            );
        })
    }

    pub(crate) fn with_dashboard_config(self, config: &DashboardConfig) -> Self {
        let obj = OdhDashboardConfig {
            metadata: ObjectMeta {
                name: Some(config.name.clone()),
                namespace: Some(NAMESPACE.to_string()),
                ..Default::default()
            },
            spec: config.spec.clone(),
        };
        self.with_raw_dashboard_config(serde_json::to_value(obj).unwrap())
    }

    pub(crate) fn with_raw_dashboard_config(self, obj: serde_json::Value) -> Self {
        self.with(|s| s.dashboard_config = Some(obj))
    }

    /// Reads of the named ConfigMap fail with the given HTTP status code.
    pub(crate) fn failing_reads(self, name: &str, code: u16) -> Self {
        self.with(|s| {
            s.failing_reads.insert(name.to_string(), code);
        })
    }

    /// Mutations of the named ConfigMap fail with the given HTTP status code.
    pub(crate) fn failing_writes(self, name: &str, code: u16) -> Self {
        self.with(|s| {
            s.failing_writes.insert(name.to_string(), code);
        })
    }

    pub(crate) fn failing_groups(self, code: u16) -> Self {
        self.with(|s| s.failing_groups = Some(code))
    }

    /// The named ConfigMap disappears right after it has been patched.
    pub(crate) fn vanishing_after_patch(self, name: &str) -> Self {
        self.with(|s| {
            s.vanishing.insert(name.to_string());
        })
    }

    pub(crate) fn has_config_map(&self, name: &str) -> bool {
        self.state.lock().unwrap().config_maps.contains_key(name)
    }

    pub(crate) fn config_map_data(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.state.lock().unwrap().config_maps.get(name).cloned()
    }

    pub(crate) fn config_map_value(&self, name: &str, key: &str) -> Option<String> {
        self.config_map_data(name)
            .map(|data| data.get(key).cloned())
            .flatten()
    }

    pub(crate) fn rollouts(&self) -> Vec<Rollout> {
        self.state.lock().unwrap().rollouts.clone()
    }

    pub(crate) fn writes(&self) -> Vec<String> {
        self.state.lock().unwrap().writes.clone()
    }

    pub(crate) fn dashboard_config(&self) -> Option<OdhDashboardConfig> {
        self.state
            .lock()
            .unwrap()
            .dashboard_config
            .clone()
            .map(|obj| serde_json::from_value(obj).unwrap())
    }
}

fn config_map(name: &str, data: &BTreeMap<String, String>) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        data: Some(data.clone()),
        ..Default::default()
    }
}

impl FakeState {
    fn check_write(&self, name: &str) -> kube::Result<()> {
        match self.failing_writes.get(name) {
            Some(code) => Err(injected_error("configmaps", name, *code)),
            None => Ok(()),
        }
    }
}

impl ClusterApi for FakeCluster {
    async fn get_config_map(&self, name: &str) -> kube::Result<ConfigMap> {
        let state = self.state.lock().unwrap();
        if let Some(code) = state.failing_reads.get(name) {
            return Err(injected_error("configmaps", name, *code));
        }
        state
            .config_maps
            .get(name)
            .map(|data| config_map(name, data))
            .ok_or_else(|| not_found("configmaps", name))
    }

    async fn patch_config_map_data(
        &self,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> kube::Result<ConfigMap> {
        let mut state = self.state.lock().unwrap();
        state.check_write(name)?;
        let existing = state
            .config_maps
            .get_mut(name)
            .ok_or_else(|| not_found("configmaps", name))?;
        existing.extend(data);
        let patched = config_map(name, existing);
        state.writes.push(format!("patch {}", name));
        if state.vanishing.contains(name) {
            state.config_maps.remove(name);
        }
        Ok(patched)
    }

    async fn create_config_map(
        &self,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> kube::Result<ConfigMap> {
        let mut state = self.state.lock().unwrap();
        state.check_write(name)?;
        if state.config_maps.contains_key(name) {
            return Err(api_error(
                409,
                &format!("configmaps \"{}\" already exists", name),
            ));
        }
        let created = config_map(name, &data);
        state.config_maps.insert(name.to_string(), data);
        state.writes.push(format!("create {}", name));
        Ok(created)
    }

    async fn delete_config_map(&self, name: &str) -> kube::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check_write(name)?;
        match state.config_maps.remove(name) {
            Some(_) => {
                state.writes.push(format!("delete {}", name));
                Ok(())
            }
            None => Err(not_found("configmaps", name)),
        }
    }

    async fn rollout(&self, rollout: &Rollout) -> kube::Result<()> {
        self.state.lock().unwrap().rollouts.push(rollout.clone());
        Ok(())
    }

    async fn get_group_users(&self, name: &str) -> kube::Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        if let Some(code) = state.failing_groups {
            return Err(injected_error("groups.user.openshift.io", name, code));
        }
        state
            .groups
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("groups.user.openshift.io", name))
    }

    async fn list_groups(&self) -> kube::Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        if let Some(code) = state.failing_groups {
            return Err(api_error(code, "unable to list groups"));
        }
        Ok(state.groups.keys().cloned().collect())
    }

    async fn patch_dashboard_config(
        &self,
        name: &str,
        patch: serde_json::Value,
    ) -> kube::Result<OdhDashboardConfig> {
        let mut state = self.state.lock().unwrap();
        let stored = state
            .dashboard_config
            .as_mut()
            .filter(|obj| obj.pointer("/metadata/name").and_then(|n| n.as_str()) == Some(name))
            .ok_or_else(|| not_found("odhdashboardconfigs.opendatahub.io", name))?;
        json_patch::merge(stored, &patch);
        let patched: OdhDashboardConfig =
            serde_json::from_value(stored.clone()).map_err(kube::Error::SerdeError)?;
        state.writes.push(format!("patch {}", name));
        Ok(patched)
    }
}
