//! Cluster settings: notebook PVC size, idle notebook culling and user tracking.
//!
//! PVC size and culling timeout live in one of two ConfigMaps, depending on
//! whether the notebook controller or the legacy jupyterhub deployment is in
//! charge (see [`BackingStore`]). The user tracking flag always lives in its
//! own ConfigMap.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use opentelemetry::{KeyValue, global};
use serde::{Deserialize, Serialize};

use crate::{
    cluster::ClusterApi,
    dashboard_config::DashboardConfig,
    errors::{DashboardError, ExtKubeApiError},
    rollout::Rollout,
    utils::metric_name,
};

pub(crate) const DEFAULT_PVC_SIZE: i64 = 20;
/// One year in seconds, a culler timeout of this value means "no culling".
pub(crate) const CULLER_DISABLED_TIMEOUT: i64 = 31_536_000;
/// Minutes between two idleness checks of the notebook controller culler.
pub(crate) const DEFAULT_IDLENESS_CHECK_PERIOD: &'static str = "1";

pub(crate) const CULLING_CONFIG_MAP: &'static str = "notebook-controller-culler-config";
pub(crate) const ENABLE_CULLING: &'static str = "ENABLE_CULLING";
pub(crate) const CULL_IDLE_TIME: &'static str = "CULL_IDLE_TIME";
pub(crate) const IDLENESS_CHECK_PERIOD: &'static str = "IDLENESS_CHECK_PERIOD";

pub(crate) const LEGACY_CONFIG_MAP: &'static str = "jupyterhub-cfg";
pub(crate) const SINGLEUSER_PVC_SIZE: &'static str = "singleuser_pvc_size";
pub(crate) const CULLER_TIMEOUT: &'static str = "culler_timeout";

pub(crate) const TRACKING_CONFIG_MAP: &'static str = "odh-segment-key-config";
pub(crate) const SEGMENT_KEY_ENABLED: &'static str = "segmentKeyEnabled";

pub(crate) const NOTEBOOK_CONTROLLER_DEPLOYMENT: &'static str = "notebook-controller-deployment";
pub(crate) const CULLER_DEPLOYMENT_CONFIG: &'static str = "jupyterhub-idle-culler";
pub(crate) const JUPYTERHUB_DEPLOYMENT_CONFIG: &'static str = "jupyterhub";

/// Marker sent by the UI for "leave user tracking unchanged".
const NULL_MARKER: &'static str = "null";
const PVC_SIZE_UNIT: &'static str = "Gi";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ClusterSettings {
    /// Notebook PVC size in GiB.
    pub pvc_size: i64,
    /// Idle time in seconds after which notebooks are culled,
    /// [`CULLER_DISABLED_TIMEOUT`] if culling is off.
    pub culler_timeout: i64,
    /// `None` if the tracking flag could not be read.
    pub user_tracking_enabled: Option<bool>,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            pvc_size: DEFAULT_PVC_SIZE,
            culler_timeout: CULLER_DISABLED_TIMEOUT,
            user_tracking_enabled: None,
        }
    }
}

/// The ConfigMap which is authoritative for PVC size and culler timeout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BackingStore {
    /// `notebook-controller-culler-config`, PVC size comes from the dashboard configuration.
    NotebookController,
    /// `jupyterhub-cfg`
    Legacy,
}

impl BackingStore {
    pub(crate) fn select(config: &DashboardConfig) -> Self {
        if config.notebook_controller_enabled() {
            BackingStore::NotebookController
        } else {
            BackingStore::Legacy
        }
    }
}

/// PVC size and culler timeout, only ever updated together.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct StorageSettings {
    pub pvc_size: i64,
    pub culler_timeout: i64,
}

impl StorageSettings {
    pub(crate) fn culling_enabled(&self) -> bool {
        self.culler_timeout != CULLER_DISABLED_TIMEOUT
    }
}

/// Requested changes, every field is optional.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct SettingsUpdate {
    pub pvc_size: Option<i64>,
    pub culler_timeout: Option<i64>,
    pub user_tracking_enabled: Option<bool>,
}

fn parse_positive(name: &str, value: &str) -> Result<i64, DashboardError> {
    match value.trim().parse::<i64>() {
        Ok(v) if v > 0 => Ok(v),
        _ => Err(DashboardError::InvalidRequest(format!(
            "{} must be a positive integer, got '{}'",
            name, value
        ))),
    }
}

impl SettingsUpdate {
    /// Parse the query string of a settings update request. Empty values are
    /// treated as absent.
    pub(crate) fn from_query(query: Option<&str>) -> Result<Self, DashboardError> {
        let mut update = SettingsUpdate::default();
        let query = match query {
            Some(q) => q,
            None => return Ok(update),
        };
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if value.trim().is_empty() {
                continue;
            }
            match key.as_ref() {
                "pvcSize" => update.pvc_size = Some(parse_positive("pvcSize", &value)?),
                "cullerTimeout" => {
                    update.culler_timeout = Some(parse_positive("cullerTimeout", &value)?)
                }
                "userTrackingEnabled" => {
                    update.user_tracking_enabled = match value.trim() {
                        NULL_MARKER => None,
                        "true" => Some(true),
                        "false" => Some(false),
                        v => {
                            return Err(DashboardError::InvalidRequest(format!(
                                "userTrackingEnabled must be true, false or null, got '{}'",
                                v
                            )));
                        }
                    }
                }
                other => debug!("ignoring unknown cluster settings parameter {}", other),
            }
        }
        Ok(update)
    }

    /// PVC size and culler timeout, if both were requested.
    pub(crate) fn storage(&self) -> Option<StorageSettings> {
        match (self.pvc_size, self.culler_timeout) {
            (Some(pvc_size), Some(culler_timeout)) => Some(StorageSettings {
                pvc_size,
                culler_timeout,
            }),
            _ => None,
        }
    }
}

/// Result of a settings update as reported to the UI.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub(crate) struct UpdateOutcome {
    pub success: bool,
    pub error: Option<String>,
}

impl UpdateOutcome {
    pub(crate) fn success() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub(crate) fn failure(message: String) -> Self {
        Self {
            success: false,
            error: Some(message),
        }
    }
}

/// Change to apply to the authoritative backing store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum StorePatch {
    /// Turn culling off by removing the culling ConfigMap.
    DeleteCulling,
    /// Merge into the culling ConfigMap, creating it if missing.
    ApplyCulling(BTreeMap<String, String>),
    /// Merge into the legacy ConfigMap.
    PatchLegacy(BTreeMap<String, String>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct SettingsPlan {
    pub patch: StorePatch,
    pub rollouts: Vec<Rollout>,
}

/// PVC size and culler timeout as found in the legacy ConfigMap.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct LegacyValues {
    pub pvc_size: Option<i64>,
    pub culler_timeout: Option<i64>,
}

impl From<&ConfigMap> for LegacyValues {
    fn from(cm: &ConfigMap) -> Self {
        Self {
            pvc_size: config_map_value(cm, SINGLEUSER_PVC_SIZE).and_then(parse_pvc_size),
            culler_timeout: config_map_value(cm, CULLER_TIMEOUT)
                .and_then(|v| v.trim().parse::<i64>().ok()),
        }
    }
}

fn config_map_value<'a>(cm: &'a ConfigMap, key: &str) -> Option<&'a str> {
    cm.data
        .as_ref()
        .map(|data| data.get(key))
        .flatten()
        .map(|v| v.as_str())
}

/// Parse a PVC size such as `20Gi` (or a bare `20`) into GiB.
pub(crate) fn parse_pvc_size(value: &str) -> Option<i64> {
    let value = value.trim();
    value
        .strip_suffix(PVC_SIZE_UNIT)
        .unwrap_or(value)
        .trim()
        .parse::<i64>()
        .ok()
}

/// The culling ConfigMap stores minutes, the API speaks seconds. Timeouts
/// below one minute are rounded up to one minute.
fn timeout_minutes(seconds: i64) -> i64 {
    (seconds / 60).max(1)
}

fn culler_timeout_from(cm: &ConfigMap) -> i64 {
    if config_map_value(cm, ENABLE_CULLING).map(|v| v.trim()) != Some("true") {
        return CULLER_DISABLED_TIMEOUT;
    }
    match config_map_value(cm, CULL_IDLE_TIME).map(|v| v.trim().parse::<i64>()) {
        Some(Ok(minutes)) => match minutes.checked_mul(60).filter(|_| minutes > 0) {
            Some(seconds) => seconds,
            None => {
                warn!(
                    "{} of {} minutes in ConfigMap {} out of range, treating culling as disabled",
                    CULL_IDLE_TIME, minutes, CULLING_CONFIG_MAP
                );
                CULLER_DISABLED_TIMEOUT
            }
        },
        Some(Err(e)) => {
            warn!(
                "invalid {} in ConfigMap {}: {}, treating culling as disabled",
                CULL_IDLE_TIME, CULLING_CONFIG_MAP, e
            );
            CULLER_DISABLED_TIMEOUT
        }
        None => {
            warn!(
                "culling enabled but {} missing in ConfigMap {}, treating culling as disabled",
                CULL_IDLE_TIME, CULLING_CONFIG_MAP
            );
            CULLER_DISABLED_TIMEOUT
        }
    }
}

/// Notebook controller mode: write the culling ConfigMap (or delete it to
/// disable culling) and always restart the controller.
pub(crate) fn plan_notebook_controller(desired: StorageSettings) -> SettingsPlan {
    let patch = if desired.culling_enabled() {
        let mut data = BTreeMap::new();
        data.insert(ENABLE_CULLING.to_string(), true.to_string());
        data.insert(
            CULL_IDLE_TIME.to_string(),
            timeout_minutes(desired.culler_timeout).to_string(),
        );
        StorePatch::ApplyCulling(data)
    } else {
        StorePatch::DeleteCulling
    };
    SettingsPlan {
        patch,
        rollouts: vec![Rollout::Deployment(NOTEBOOK_CONTROLLER_DEPLOYMENT)],
    }
}

/// Legacy mode: write both fields to `jupyterhub-cfg` and restart only the
/// workloads whose setting actually changed.
pub(crate) fn plan_legacy(current: &LegacyValues, desired: StorageSettings) -> SettingsPlan {
    let mut data = BTreeMap::new();
    data.insert(
        SINGLEUSER_PVC_SIZE.to_string(),
        format!("{}{}", desired.pvc_size, PVC_SIZE_UNIT),
    );
    data.insert(
        CULLER_TIMEOUT.to_string(),
        desired.culler_timeout.to_string(),
    );
    let mut rollouts = vec![];
    if current.culler_timeout != Some(desired.culler_timeout) {
        rollouts.push(Rollout::DeploymentConfig(CULLER_DEPLOYMENT_CONFIG));
    }
    if current.pvc_size != Some(desired.pvc_size) {
        rollouts.push(Rollout::DeploymentConfig(JUPYTERHUB_DEPLOYMENT_CONFIG));
    }
    SettingsPlan {
        patch: StorePatch::PatchLegacy(data),
        rollouts,
    }
}

async fn read_user_tracking<C: ClusterApi>(cluster: &C) -> Option<bool> {
    match cluster.get_config_map(TRACKING_CONFIG_MAP).await {
        Ok(cm) => match config_map_value(&cm, SEGMENT_KEY_ENABLED) {
            Some(v) => Some(v.trim() == "true"),
            None => {
                warn!(
                    "{} missing in ConfigMap {}",
                    SEGMENT_KEY_ENABLED, TRACKING_CONFIG_MAP
                );
                None
            }
        },
        Err(e) => {
            error!("Error retrieving segment key enabled: {}", e);
            None
        }
    }
}

/// Read the current cluster settings from the backing store selected by `config`.
///
/// In legacy mode a failure to read `jupyterhub-cfg` is reported as
/// [`DashboardError::SettingsUnavailable`], which still carries the settings
/// that could be determined.
pub(crate) async fn read_settings<C: ClusterApi>(
    cluster: &C,
    config: &DashboardConfig,
) -> Result<ClusterSettings, DashboardError> {
    let mut settings = ClusterSettings::default();
    settings.user_tracking_enabled = read_user_tracking(cluster).await;
    match BackingStore::select(config) {
        BackingStore::NotebookController => {
            if let Some(size) = config.spec.notebook_pvc_size() {
                match parse_pvc_size(size) {
                    Some(size) => settings.pvc_size = size,
                    None => warn!(
                        "invalid notebook PVC size '{}' in dashboard configuration {}",
                        size, config.name
                    ),
                }
            }
            match cluster.get_config_map(CULLING_CONFIG_MAP).await {
                Ok(cm) => settings.culler_timeout = culler_timeout_from(&cm),
                Err(e) if e.is_not_found() => {
                    debug!(
                        "ConfigMap {} does not exist, culling is disabled",
                        CULLING_CONFIG_MAP
                    );
                    settings.culler_timeout = CULLER_DISABLED_TIMEOUT;
                }
                Err(e) => Err(e)?,
            }
        }
        BackingStore::Legacy => match cluster.get_config_map(LEGACY_CONFIG_MAP).await {
            Ok(cm) => {
                let values = LegacyValues::from(&cm);
                match values.pvc_size {
                    Some(v) => settings.pvc_size = v,
                    None => warn!(
                        "{} missing or invalid in ConfigMap {}",
                        SINGLEUSER_PVC_SIZE, LEGACY_CONFIG_MAP
                    ),
                }
                match values.culler_timeout {
                    Some(v) => settings.culler_timeout = v,
                    None => warn!(
                        "{} missing or invalid in ConfigMap {}",
                        CULLER_TIMEOUT, LEGACY_CONFIG_MAP
                    ),
                }
            }
            Err(e) => {
                error!("Error retrieving cluster settings: {}", e);
                return Err(DashboardError::SettingsUnavailable {
                    partial: Box::new(settings),
                    source: e,
                });
            }
        },
    }
    Ok(settings)
}

async fn apply_store_patch<C: ClusterApi>(
    cluster: &C,
    patch: &StorePatch,
) -> Result<(), DashboardError> {
    match patch {
        StorePatch::DeleteCulling => match cluster.delete_config_map(CULLING_CONFIG_MAP).await {
            Ok(()) => info!("deleted ConfigMap {}, culling disabled", CULLING_CONFIG_MAP),
            Err(e) if e.is_not_found() => {
                debug!("ConfigMap {} already absent", CULLING_CONFIG_MAP)
            }
            Err(e) => Err(e)?,
        },
        StorePatch::ApplyCulling(data) => {
            match cluster
                .patch_config_map_data(CULLING_CONFIG_MAP, data.clone())
                .await
            {
                Ok(_) => info!("patched ConfigMap {}", CULLING_CONFIG_MAP),
                Err(e) if e.is_not_found() => {
                    let mut data = data.clone();
                    data.insert(
                        IDLENESS_CHECK_PERIOD.to_string(),
                        DEFAULT_IDLENESS_CHECK_PERIOD.to_string(),
                    );
                    cluster
                        .create_config_map(CULLING_CONFIG_MAP, data)
                        .await?;
                    info!("created ConfigMap {}", CULLING_CONFIG_MAP);
                }
                Err(e) => Err(e)?,
            }
        }
        StorePatch::PatchLegacy(data) => {
            cluster
                .patch_config_map_data(LEGACY_CONFIG_MAP, data.clone())
                .await?;
            info!("patched ConfigMap {}", LEGACY_CONFIG_MAP);
        }
    }
    Ok(())
}

fn record_rollout(rollout: &Rollout) {
    let counter = global::meter("settings")
        .u64_counter(metric_name("rollouts_total"))
        .with_description("Count of workload rollouts triggered by settings changes")
        .build();
    counter.add(
        1,
        &[
            KeyValue::new("kind", rollout.kind()),
            KeyValue::new("name", rollout.name()),
        ],
    );
}

async fn apply_update<C: ClusterApi>(
    cluster: &C,
    config: &DashboardConfig,
    update: &SettingsUpdate,
) -> Result<(), DashboardError> {
    if let Some(enabled) = update.user_tracking_enabled {
        let mut data = BTreeMap::new();
        data.insert(SEGMENT_KEY_ENABLED.to_string(), enabled.to_string());
        cluster
            .patch_config_map_data(TRACKING_CONFIG_MAP, data)
            .await?;
        info!("user tracking enabled set to {}", enabled);
    }
    let desired = match update.storage() {
        Some(desired) => desired,
        None => {
            if update.pvc_size.is_some() || update.culler_timeout.is_some() {
                warn!("ignoring PVC size / culler timeout update, both values are required");
            }
            return Ok(());
        }
    };
    let store = BackingStore::select(config);
    let plan = match store {
        BackingStore::NotebookController => plan_notebook_controller(desired),
        BackingStore::Legacy => {
            let current = match cluster.get_config_map(LEGACY_CONFIG_MAP).await {
                Ok(cm) => LegacyValues::from(&cm),
                Err(e) if e.is_not_found() => LegacyValues::default(),
                Err(e) => Err(e)?,
            };
            plan_legacy(&current, desired)
        }
    };
    debug!("applying {:?} settings plan {:?}", store, plan);
    apply_store_patch(cluster, &plan.patch).await?;
    if store == BackingStore::Legacy {
        match cluster.get_config_map(LEGACY_CONFIG_MAP).await {
            Ok(_) => (),
            Err(e) if e.is_not_found() => {
                info!(
                    "ConfigMap {} not found after patching, skipping rollout",
                    LEGACY_CONFIG_MAP
                );
                return Ok(());
            }
            Err(e) => Err(e)?,
        }
    }
    for rollout in &plan.rollouts {
        cluster.rollout(rollout).await?;
        info!("rolled out {}", rollout);
        record_rollout(rollout);
    }
    Ok(())
}

/// Apply the requested changes and restart affected workloads.
///
/// Never fails, errors are reported in the returned [`UpdateOutcome`].
pub(crate) async fn update_settings<C: ClusterApi>(
    cluster: &C,
    config: &DashboardConfig,
    update: &SettingsUpdate,
) -> UpdateOutcome {
    match apply_update(cluster, config, update).await {
        Ok(()) => UpdateOutcome::success(),
        Err(e) => {
            error!("Setting cluster settings error: {}", e);
            UpdateOutcome::failure(format!("Unable to update cluster settings. {}", e.message()))
        }
    }
}
