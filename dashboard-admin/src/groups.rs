use dashboard_admin_apis::GroupsConfig;
use serde::Serialize;
use serde_json::json;

use crate::{
    cluster::ClusterApi,
    dashboard_config::DashboardConfig,
    errors::{DashboardError, ExtKubeApiError},
};

/// Virtual groups maintained by the API server itself, they never exist as
/// `Group` objects.
const VIRTUAL_GROUP_PREFIX: &'static str = "system:";

/// Users of the named group, fails with [`DashboardError::MissingGroup`] if
/// the group does not exist.
pub(crate) async fn get_group<C: ClusterApi>(
    cluster: &C,
    name: &str,
) -> Result<Vec<String>, DashboardError> {
    match cluster.get_group_users(name).await {
        Ok(users) => Ok(users),
        Err(e) if e.is_not_found() => Err(DashboardError::MissingGroup(name.to_string())),
        Err(e) => Err(e.into()),
    }
}

pub(crate) async fn get_all_groups<C: ClusterApi>(
    cluster: &C,
) -> Result<Vec<String>, DashboardError> {
    Ok(cluster.list_groups().await?)
}

pub(crate) fn get_groups_cr(config: &DashboardConfig) -> GroupsConfig {
    config.spec.groups_config()
}

/// Replace admin and allowed groups of the dashboard configuration and
/// return the groups as stored by the API server. Both fields are written
/// together with a merge patch, so the stored object wins over a stale
/// snapshot.
pub(crate) async fn update_groups_cr<C: ClusterApi>(
    cluster: &C,
    config: &DashboardConfig,
    groups: &GroupsConfig,
) -> Result<GroupsConfig, DashboardError> {
    let patch = json!({
        "spec": {
            "groupsConfig": {
                "adminGroups": groups.admin_groups,
                "allowedGroups": groups.allowed_groups,
            }
        }
    });
    let updated = cluster
        .patch_dashboard_config(config.name.as_str(), patch)
        .await
        .map_err(|e| {
            error!("failed to update groups of {}: {}", config.name, e);
            DashboardError::GroupsUpdate(e.api_message())
        })?;
    info!("updated groups of {}", updated.id());
    Ok(updated.spec.groups_config())
}

/// Groups configuration as shown by the UI, flagging configured groups which
/// do not exist.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GroupsConfigStatus {
    #[serde(flatten)]
    pub groups: GroupsConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_admin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_user: Option<String>,
}

async fn missing_groups<C: ClusterApi>(
    cluster: &C,
    names: Vec<&str>,
) -> Result<Option<String>, DashboardError> {
    let mut missing = vec![];
    for name in names {
        if name.starts_with(VIRTUAL_GROUP_PREFIX) {
            continue;
        }
        match get_group(cluster, name).await {
            Ok(_) => (),
            Err(e) if e.is_missing_group() => missing.push(name),
            Err(e) => Err(e)?,
        }
    }
    if missing.is_empty() {
        Ok(None)
    } else {
        Ok(Some(format!(
            "The following groups no longer exist: {}",
            missing.join(", ")
        )))
    }
}

pub(crate) async fn describe_groups<C: ClusterApi>(
    cluster: &C,
    config: &DashboardConfig,
) -> Result<GroupsConfigStatus, DashboardError> {
    let groups = get_groups_cr(config);
    let error_admin = missing_groups(cluster, groups.admin_group_names()).await?;
    let error_user = missing_groups(cluster, groups.allowed_group_names()).await?;
    Ok(GroupsConfigStatus {
        groups,
        error_admin,
        error_user,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeCluster, NAMESPACE, legacy_mode};

    fn groups(admin: &str, allowed: &str) -> GroupsConfig {
        GroupsConfig {
            admin_groups: admin.to_string(),
            allowed_groups: allowed.to_string(),
        }
    }

    #[tokio::test]
    async fn group_users() {
        let cluster = FakeCluster::default().with_group("odh-admins", &["alice", "bob"]);
        assert_eq!(
            vec!["alice".to_string(), "bob".to_string()],
            get_group(&cluster, "odh-admins").await.unwrap()
        );
    }

    #[tokio::test]
    async fn missing_group_is_typed() {
        let cluster = FakeCluster::default();
        match get_group(&cluster, "nope").await {
            Err(DashboardError::MissingGroup(name)) => assert_eq!("nope", name),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn other_group_errors_are_generic() {
        let cluster = FakeCluster::default().failing_groups(500);
        let e = get_group(&cluster, "odh-admins").await.unwrap_err();
        assert!(!e.is_missing_group());
        assert!(get_all_groups(&cluster).await.is_err());
    }

    #[tokio::test]
    async fn all_groups() {
        let cluster = FakeCluster::default()
            .with_group("odh-admins", &["alice"])
            .with_group("odh-users", &[]);
        assert_eq!(
            vec!["odh-admins".to_string(), "odh-users".to_string()],
            get_all_groups(&cluster).await.unwrap()
        );
    }

    #[tokio::test]
    async fn update_groups() {
        let config = legacy_mode();
        let cluster = FakeCluster::default().with_dashboard_config(&config);
        let desired = groups("odh-admins", "system:authenticated");
        let updated = update_groups_cr(&cluster, &config, &desired).await.unwrap();
        assert_eq!(desired, updated);
        assert_eq!(Some(desired), cluster.dashboard_config().map(|c| c.spec.groups_config()));
    }

    #[tokio::test]
    async fn update_groups_with_partially_stored_config() {
        let config = legacy_mode();
        let cluster = FakeCluster::default().with_raw_dashboard_config(json!({
            "apiVersion": "opendatahub.io/v1alpha",
            "kind": "OdhDashboardConfig",
            "metadata": { "name": config.name, "namespace": NAMESPACE },
            "spec": {
                "notebookController": { "enabled": false },
                "groupsConfig": { "adminGroups": "odh-admins" }
            }
        }));
        let desired = groups("odh-admins", "odh-users");
        let updated = update_groups_cr(&cluster, &config, &desired).await.unwrap();
        assert_eq!(desired, updated);
        let stored = cluster.dashboard_config().unwrap();
        assert_eq!(desired, stored.spec.groups_config());
        assert!(!stored.spec.notebook_controller_enabled());
        assert_eq!(vec!["patch odh-dashboard-config".to_string()], cluster.writes());
    }

    #[tokio::test]
    async fn stale_snapshot_still_writes() {
        let mut stale = legacy_mode();
        stale.spec.groups_config = Some(groups("odh-admins", "odh-users"));
        let mut stored = legacy_mode();
        stored.spec.groups_config = Some(groups("other-admins", "odh-users"));
        let cluster = FakeCluster::default().with_dashboard_config(&stored);
        let updated = update_groups_cr(&cluster, &stale, &groups("odh-admins", "odh-users"))
            .await
            .unwrap();
        assert_eq!(groups("odh-admins", "odh-users"), updated);
        assert_eq!(vec!["patch odh-dashboard-config".to_string()], cluster.writes());
    }

    #[tokio::test]
    async fn update_failures_are_wrapped() {
        let config = legacy_mode();
        let cluster = FakeCluster::default();
        let e = update_groups_cr(&cluster, &config, &groups("a", "b"))
            .await
            .unwrap_err();
        assert!(matches!(e, DashboardError::GroupsUpdate(_)));
        assert!(e.message().starts_with("Failed to update groups config: "));
    }

    #[tokio::test]
    async fn describe_flags_missing_groups() {
        let mut config = legacy_mode();
        config.spec.groups_config = Some(groups("odh-admins,gone", "system:authenticated"));
        let cluster = FakeCluster::default().with_group("odh-admins", &["alice"]);
        let status = describe_groups(&cluster, &config).await.unwrap();
        assert_eq!(
            Some("The following groups no longer exist: gone".to_string()),
            status.error_admin
        );
        assert_eq!(None, status.error_user);
        assert_eq!(
            r#"{"adminGroups":"odh-admins,gone","allowedGroups":"system:authenticated","errorAdmin":"The following groups no longer exist: gone"}"#,
            serde_json::to_string(&status).unwrap()
        );
    }
}
