use std::{collections::BTreeMap, path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use k8s_openapi::{
    api::{
        core::v1::{ConfigMap, Namespace},
        rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject},
    },
    apimachinery::pkg::{apis::meta::v1::LabelSelector, util::intstr::IntOrString},
};
use kube::{runtime::controller::Action, Api, Client, ResourceExt};
use tracing::{error, info};

use crate::{
    resources::{
        labels, meta, owner_reference, ArgoCD, Endpoint, PrometheusRule, PrometheusRuleSpec,
        Rule, RuleGroup, ServiceMonitor, ServiceMonitorSpec,
    },
    Error, Result,
};

use super::{ensure, ensure_exists, ensure_namespace, Context, Reconcile};

/// Name of the alerting rules created next to every instance
pub const ALERT_RULE_NAME: &str = "gitops-operator-argocd-alerts";

/// Namespace the console reads monitoring dashboards from
pub const DASHBOARD_NAMESPACE: &str = "openshift-config-managed";

const DASHBOARD_LABEL: &str = "console.openshift.io/dashboard";

/// Dashboards shipped with the operator, by file name
const DASHBOARDS: &[(&str, &str)] = &[
    (
        "gitops-overview.json",
        include_str!("../../dashboards/gitops-overview.json"),
    ),
    (
        "gitops-components.json",
        include_str!("../../dashboards/gitops-components.json"),
    ),
];

#[async_trait]
impl Reconcile for ArgoCD {
    const CONTROLLER: &'static str = "argocd-metrics";

    async fn reconcile(&self, context: Arc<Context>) -> Result<Action> {
        let client = context.client.clone();
        let name = self.name_any();
        let namespace = self
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;

        // Gone already, garbage collection takes care of the rest
        let namespaces = Api::<Namespace>::all(client.clone());
        if namespaces
            .get_opt(&namespace)
            .await
            .map_err(Error::KubeError)?
            .is_none()
        {
            return Ok(Action::await_change());
        }
        let instances = Api::<ArgoCD>::namespaced(client.clone(), &namespace);
        let Some(instance) = instances.get_opt(&name).await.map_err(Error::KubeError)? else {
            return Ok(Action::await_change());
        };

        ensure_namespace(client.clone(), &namespace).await?;
        instance.reconcile_read_access(client.clone()).await?;

        let monitors = Api::<ServiceMonitor>::namespaced(client.clone(), &namespace);
        for (monitor, app) in [
            (name.clone(), format!("{name}-metrics")),
            (format!("{name}-server"), format!("{name}-server-metrics")),
            (format!("{name}-repo-server"), format!("{name}-repo-server")),
        ] {
            ensure_exists(&monitors, &instance.service_monitor(&monitor, &app)?).await?;
        }

        let rules = Api::<PrometheusRule>::namespaced(client.clone(), &namespace);
        ensure_exists(&rules, &instance.sync_alert()?).await?;

        reconcile_dashboards(client).await;

        info!(r#"Monitoring in place for "{namespace}/{name}""#);
        Ok(Action::requeue(Duration::from_secs(60 * 60)))
    }
}

impl ArgoCD {
    /// Let the cluster's prometheus read the instance's endpoints
    async fn reconcile_read_access(&self, client: Client) -> Result<()> {
        let namespace = self
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let role_name = format!("{namespace}-read");
        let owners = vec![owner_reference(self)?];

        let roles = Api::<Role>::namespaced(client.clone(), &namespace);
        let role = Role {
            metadata: meta! {
                owners: owners.clone(),
                name: Some(role_name.clone()),
                namespace: Some(namespace.clone()),
            },
            rules: Some(vec![PolicyRule {
                api_groups: Some(vec!["".into()]),
                resources: Some(vec!["endpoints".into(), "services".into(), "pods".into()]),
                verbs: vec!["get".into(), "list".into(), "watch".into()],
                ..Default::default()
            }]),
        };
        ensure_exists(&roles, &role).await?;

        let bindings = Api::<RoleBinding>::namespaced(client, &namespace);
        let binding = RoleBinding {
            metadata: meta! {
                owners: owners,
                name: Some(format!("{namespace}-prometheus-k8s-read-binding")),
                namespace: Some(namespace.clone()),
            },
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".into(),
                kind: "Role".into(),
                name: role_name,
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".into(),
                name: "prometheus-k8s".into(),
                namespace: Some("openshift-monitoring".into()),
                ..Default::default()
            }]),
        };
        ensure_exists(&bindings, &binding).await?;

        Ok(())
    }

    /// Scrape the `metrics` port of services named `app`
    fn service_monitor(&self, name: &str, app: &str) -> Result<ServiceMonitor> {
        let mut monitor = ServiceMonitor::new(
            name,
            ServiceMonitorSpec {
                selector: LabelSelector {
                    match_labels: Some(labels!("app.kubernetes.io/name" => app)),
                    ..Default::default()
                },
                endpoints: vec![Endpoint {
                    port: Some("metrics".into()),
                }],
            },
        );
        monitor.metadata = meta! {
            owners: vec![owner_reference(self)?],
            name: Some(name.into()),
            namespace: self.namespace(),
            labels: Some(labels!("release" => "prometheus-operator")),
        };
        Ok(monitor)
    }

    /// Alert on applications of this instance staying out of sync
    fn sync_alert(&self) -> Result<PrometheusRule> {
        let namespace = self
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let expr = format!(r#"argocd_app_info{{namespace="{namespace}",sync_status="OutOfSync"}} > 0"#);

        let mut rule = PrometheusRule::new(
            ALERT_RULE_NAME,
            PrometheusRuleSpec {
                groups: vec![RuleGroup {
                    name: "GitOpsOperatorArgoCD".into(),
                    rules: vec![Rule {
                        alert: Some("ArgoCDSyncAlert".into()),
                        expr: IntOrString::String(expr),
                        for_: Some("5m".into()),
                        labels: labels!("severity" => "warning"),
                        annotations: labels!(
                            "message" => "ArgoCD application {{ $labels.name }} is out of sync"
                        ),
                    }],
                }],
            },
        );
        rule.metadata = meta! {
            owners: vec![owner_reference(self)?],
            name: Some(ALERT_RULE_NAME.into()),
            namespace: Some(namespace),
        };
        Ok(rule)
    }
}

/// The config map carrying dashboard `file`
pub fn dashboard_config_map(file: &str, content: &str) -> ConfigMap {
    let name = Path::new(file)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(file);

    ConfigMap {
        metadata: meta! {
            name: Some(name.into()),
            namespace: Some(DASHBOARD_NAMESPACE.into()),
            labels: Some(labels!(DASHBOARD_LABEL => "true")),
        },
        data: Some(BTreeMap::from([(file.to_string(), content.to_string())])),
        ..Default::default()
    }
}

/// Install the console dashboards when the cluster can show them.
///
/// Only the dashboard content is enforced, so a label edit disabling one
/// sticks. Failures are logged and the next dashboard is tried.
pub async fn reconcile_dashboards(client: Client) {
    let namespaces = Api::<Namespace>::all(client.clone());
    match namespaces.get_opt(DASHBOARD_NAMESPACE).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            info!("No {DASHBOARD_NAMESPACE} namespace, skipping dashboards");
            return;
        }
        Err(e) => {
            error!("Could not look up {DASHBOARD_NAMESPACE}: {e}");
            return;
        }
    }

    let config_maps = Api::<ConfigMap>::namespaced(client, DASHBOARD_NAMESPACE);
    for (file, content) in DASHBOARDS {
        let desired = dashboard_config_map(file, content);
        let result = ensure(&config_maps, &desired, |current, _| {
            let data = current.data.get_or_insert_with(BTreeMap::new);
            if data.get(*file).map(String::as_str) == Some(*content) {
                return false;
            }
            data.insert(file.to_string(), content.to_string());
            true
        })
        .await;

        if let Err(e) = result {
            error!("Failed to reconcile dashboard {file}: {e}");
        }
    }
}
