use std::{fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{Container, Namespace, PodSpec, PodTemplateSpec, Volume},
    },
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use kube::{
    api::{DeleteParams, PostParams},
    runtime::controller::Action,
    Api, Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::{
    cluster::ClusterFacts,
    config::Settings,
    operator::Diagnostics,
    resources::{
        add_seccomp_profile, has_labels, labels, meta, owner_reference, GitopsService,
        CLUSTER_MONITORING_LABEL,
    },
    Error, Metrics, Result,
};

pub mod argocd_metrics;
pub mod console_link;
pub mod console_plugin;
pub mod gitops_service;
pub mod kam;

/// Attempts of a read-modify-write before giving up on conflicts
const CONFLICT_RETRIES: usize = 5;

/// First pause between conflicting writes, doubled on every attempt
const CONFLICT_BACKOFF: Duration = Duration::from_millis(100);

/// The context passed around
pub struct Context {
    /// Kubernetes client
    pub client: Client,

    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,

    /// Prometheus metrics
    pub metrics: Metrics,

    /// What the cluster looked like at startup
    pub facts: ClusterFacts,

    /// Environment snapshot taken at startup
    pub settings: Settings,
}

/// A resource that can be reconciled by a controller
#[async_trait]
pub(crate) trait Reconcile
where
    Self: Resource<DynamicType = ()> + Sized,
{
    /// Name used in logs and metrics
    const CONTROLLER: &'static str;

    /// Attempt to reconcile a resource
    async fn reconcile(&self, context: Arc<Context>) -> Result<Action>;
}

/// Create `desired` if it is missing, otherwise let `drift` bring the live
/// object in line and replace it when anything changed.
///
/// `drift` receives the live object and the desired one and returns whether
/// it modified the live object. A create racing with someone else re-reads
/// the object; a replace hitting a stale version is retried with backoff.
pub(crate) async fn ensure<K, F>(api: &Api<K>, desired: &K, drift: F) -> Result<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug,
    F: Fn(&mut K, &K) -> bool,
{
    let name = desired
        .meta()
        .name
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;
    let kind = K::kind(&());

    for attempt in 0..CONFLICT_RETRIES {
        let mut current = match api.get_opt(&name).await.map_err(Error::KubeError)? {
            Some(current) => current,
            None => match api.create(&PostParams::default(), desired).await {
                Ok(created) => {
                    info!("Created {kind} {}", describe(desired));
                    return Ok(created);
                }
                Err(kube::Error::Api(e)) if e.code == 409 => {
                    debug!("{kind} {name} appeared while creating it, reading it back");
                    continue;
                }
                Err(e) => return Err(Error::KubeError(e)),
            },
        };

        if !drift(&mut current, desired) {
            return Ok(current);
        }

        match api.replace(&name, &PostParams::default(), &current).await {
            Ok(updated) => {
                info!("Reconciled drift on {kind} {}", describe(desired));
                return Ok(updated);
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                let pause = CONFLICT_BACKOFF * 2u32.pow(attempt as u32);
                debug!("Conflict updating {kind} {name}, retrying in {pause:?}");
                tokio::time::sleep(pause).await;
            }
            Err(e) => return Err(Error::KubeError(e)),
        }
    }

    Err(Error::ConflictRetriesExhausted(
        format!("{kind} {name}"),
        CONFLICT_RETRIES,
    ))
}

/// Create `desired` unless an object with its name exists already
pub(crate) async fn ensure_exists<K>(api: &Api<K>, desired: &K) -> Result<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug,
{
    ensure(api, desired, |_, _| false).await
}

/// Delete `name`, returning whether there was anything to delete
pub(crate) async fn ensure_absent<K>(api: &Api<K>, name: &str) -> Result<bool>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => {
            info!("Deleted {} {name}", K::kind(&()));
            Ok(true)
        }
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(false),
        Err(e) => Err(Error::KubeError(e)),
    }
}

/// Overwrite `current` with `desired` when they differ
pub(crate) fn sync<T: PartialEq + Clone>(current: &mut T, desired: &T) -> bool {
    if current == desired {
        return false;
    }

    *current = desired.clone();
    true
}

/// Create the namespace, or label an existing one, for cluster monitoring
pub(crate) async fn ensure_namespace(client: Client, name: &str) -> Result<Namespace> {
    let namespaces = Api::<Namespace>::all(client);
    let desired = Namespace {
        metadata: meta! {
            name: Some(name.into()),
            labels: Some(labels!(CLUSTER_MONITORING_LABEL => "true")),
        },
        ..Default::default()
    };

    ensure(&namespaces, &desired, |current, desired| {
        let wanted = desired.labels();
        let labels = current.labels_mut();
        let missing = !has_labels(Some(&*labels), wanted);
        labels.extend(wanted.clone());
        missing
    })
    .await
}

/// Like `sync`, treating a missing value as its default so fields the API
/// server fills in do not count as drift
pub(crate) fn sync_defaulted<T>(current: &mut Option<T>, desired: &Option<T>) -> bool
where
    T: Default + PartialEq + Clone,
{
    let empty = T::default();
    if current.as_ref().unwrap_or(&empty) == desired.as_ref().unwrap_or(&empty) {
        return false;
    }

    *current = desired.clone();
    true
}

pub(crate) fn pod_spec(deployment: &Deployment) -> Option<&PodSpec> {
    deployment.spec.as_ref()?.template.spec.as_ref()
}

pub(crate) fn pod_spec_mut(deployment: &mut Deployment) -> Option<&mut PodSpec> {
    deployment.spec.as_mut()?.template.spec.as_mut()
}

/// Node selector, tolerations and pod security context
pub(crate) fn sync_placement(current: &mut PodSpec, desired: &PodSpec) -> bool {
    let mut changed = sync_defaulted(&mut current.node_selector, &desired.node_selector);
    changed |= sync_defaulted(&mut current.tolerations, &desired.tolerations);
    changed |= sync_defaulted(&mut current.security_context, &desired.security_context);
    changed
}

/// A single replica deployment of `container` placed the way `service` asks.
///
/// Pods are labelled and selected by `app.kubernetes.io/name=<name>`.
pub(crate) fn placed_deployment(
    service: &GitopsService,
    facts: &ClusterFacts,
    name: &str,
    namespace: &str,
    container: Container,
    volumes: Option<Vec<Volume>>,
    service_account: Option<String>,
) -> Result<Deployment> {
    let selector = labels!("app.kubernetes.io/name" => name);
    let mut pod = PodSpec {
        containers: vec![container],
        volumes,
        service_account_name: service_account,
        node_selector: Some(service.workload_node_selector()),
        tolerations: service.workload_tolerations(),
        ..Default::default()
    };
    add_seccomp_profile(&mut pod, facts);

    Ok(Deployment {
        metadata: meta! {
            owners: vec![owner_reference(service)?],
            name: Some(name.into()),
            namespace: Some(namespace.into()),
            labels: Some(labels!(managed)),
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(meta! { labels: Some(selector) }),
                spec: Some(pod),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn describe<K: Resource>(object: &K) -> String {
    match object.meta().namespace.as_deref() {
        Some(ns) => format!(r#""{ns}/{}""#, object.name_any()),
        None => format!(r#""{}""#, object.name_any()),
    }
}
