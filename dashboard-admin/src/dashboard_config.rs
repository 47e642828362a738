use std::future::Future;

use dashboard_admin_apis::{OdhDashboardConfig, OdhDashboardConfigSpec};
use futures::TryStreamExt;
use kube::{Api, Client};
use kube_runtime::{
    WatchStreamExt,
    reflector::{ObjectRef, Store, reflector, store::Writer},
    watcher,
};

/// Immutable view of the dashboard configuration taken at the start of a
/// request and passed explicitly to every operation.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct DashboardConfig {
    /// Name of the `OdhDashboardConfig` object the snapshot was taken from.
    pub name: String,
    pub spec: OdhDashboardConfigSpec,
}

impl DashboardConfig {
    pub(crate) fn notebook_controller_enabled(&self) -> bool {
        self.spec.notebook_controller_enabled()
    }
}

/// Source of [`DashboardConfig`] snapshots.
pub(crate) trait ConfigSource: Send + Sync {
    fn snapshot(&self) -> DashboardConfig;
}

/// Reflector backed cache of the cluster-singleton `OdhDashboardConfig` object.
#[derive(Clone)]
pub(crate) struct DashboardConfigCache {
    store: Store<OdhDashboardConfig>,
    name: String,
    namespace: String,
}

impl DashboardConfigCache {
    /// Create the cache and the future driving its reflector. The cache is
    /// empty until the future has been polled and the initial list completed.
    pub(crate) fn new(
        client: Client,
        namespace: &str,
        name: &str,
    ) -> (Self, impl Future<Output = Result<(), watcher::Error>>) {
        let api = Api::<OdhDashboardConfig>::namespaced(client, namespace);
        let config = watcher::Config::default().fields(&format!("metadata.name={}", name));
        let writer: Writer<OdhDashboardConfig> = Default::default();
        let store = writer.as_reader();
        let reflector = reflector(writer, watcher::watcher(api, config))
            .default_backoff()
            .applied_objects()
            .try_for_each(|o| async move {
                info!("dashboard configuration {} changed", o.id());
                Ok(())
            });
        let cache = Self {
            store,
            name: name.to_string(),
            namespace: namespace.to_string(),
        };
        (cache, reflector)
    }
}

impl ConfigSource for DashboardConfigCache {
    fn snapshot(&self) -> DashboardConfig {
        let key = ObjectRef::<OdhDashboardConfig>::new(self.name.as_str())
            .within(self.namespace.as_str());
        match self.store.get(&key) {
            Some(obj) => DashboardConfig {
                name: self.name.clone(),
                spec: obj.spec.clone(),
            },
            None => {
                warn!(
                    "dashboard configuration {}/{} not found, using defaults",
                    self.namespace, self.name
                );
                DashboardConfig {
                    name: self.name.clone(),
                    spec: Default::default(),
                }
            }
        }
    }
}
