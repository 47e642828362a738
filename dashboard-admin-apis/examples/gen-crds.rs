use dashboard_admin_apis::OdhDashboardConfig;
use kube::CustomResourceExt;
use serde_yaml;

pub fn main() {
    println!(
        "{}",
        serde_yaml::to_string(&OdhDashboardConfig::crd()).unwrap()
    );
}
