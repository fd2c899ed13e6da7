use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::{
        Capabilities, EnvVar, PodSecurityContext, PodSpec, ResourceRequirements,
        SeccompProfile, SecurityContext,
    },
    apimachinery::pkg::{api::resource::Quantity, apis::meta::v1::OwnerReference},
};
use kube::Resource;

mod argocd;
mod cluster_version;
mod console;
mod gitops_service;
mod monitoring;
mod route;

pub use argocd::*;
pub use cluster_version::*;
pub use console::*;
pub use gitops_service::*;
pub use monitoring::*;
pub use route::*;

use crate::{cluster::ClusterFacts, Error, Result, OPERATOR_NAME};

/// Label carried by every object the operator creates for the service
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Selector applied to every workload so it lands on linux nodes
pub const DEFAULT_NODE_SELECTOR: (&str, &str) = ("kubernetes.io/os", "linux");

/// Selector added when the service asks to run on infrastructure nodes
pub const INFRA_NODE_LABEL: &str = "node-role.kubernetes.io/infra";

/// Label enabling cluster monitoring of a namespace
pub const CLUSTER_MONITORING_LABEL: &str = "openshift.io/cluster-monitoring";

macro_rules! meta {
    (owners: $owners:expr, $($lhs:ident : $rhs:expr),* $(,)?) => {{
        ::kube::core::ObjectMeta {
            owner_references: Some($owners),
            $($lhs : $rhs),*,

            ..Default::default()
        }
    }};

    ($($lhs:ident : $rhs:expr),* $(,)?) => {{
        ::kube::core::ObjectMeta {
            $($lhs : $rhs),*,

            ..Default::default()
        }
    }};
}

macro_rules! labels {
    (managed $(, $key:expr => $value:expr)* $(,)?) => {{
        ::std::collections::BTreeMap::<String, String>::from_iter([
            (
                $crate::resources::MANAGED_BY_LABEL.to_string(),
                $crate::OPERATOR_NAME.to_string(),
            ),
            $(($key.to_string(), $value.to_string())),*
        ])
    }};

    ($($key:expr => $value:expr),* $(,)?) => {{
        ::std::collections::BTreeMap::<String, String>::from_iter([
            $(($key.to_string(), $value.to_string())),*
        ])
    }};
}

pub(crate) use {labels, meta};

/// The controller owner reference pointing at `owner`
pub fn owner_reference<K>(owner: &K) -> Result<OwnerReference>
where
    K: Resource<DynamicType = ()>,
{
    owner
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey(".metadata.name"))
}

/// `(memory, cpu)` requests and limits
pub fn requirements(requests: (&str, &str), limits: (&str, &str)) -> ResourceRequirements {
    let list = |(memory, cpu): (&str, &str)| {
        BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu.into())),
            ("memory".to_string(), Quantity(memory.into())),
        ])
    };

    ResourceRequirements {
        requests: Some(list(requests)),
        limits: Some(list(limits)),
        ..Default::default()
    }
}

/// Resources of the small helper workloads (backend, CLI server, plugin)
pub fn default_workload_resources() -> ResourceRequirements {
    requirements(("128Mi", "250m"), ("256Mi", "500m"))
}

/// Security context satisfying the restricted pod security profile
pub fn restricted_security_context() -> SecurityContext {
    SecurityContext {
        allow_privilege_escalation: Some(false),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".into()]),
            ..Default::default()
        }),
        run_as_non_root: Some(true),
        seccomp_profile: Some(runtime_default_seccomp()),
        ..Default::default()
    }
}

pub fn runtime_default_seccomp() -> SeccompProfile {
    SeccompProfile {
        type_: "RuntimeDefault".into(),
        ..Default::default()
    }
}

/// Apply the seccomp profile expected on newer platforms.
///
/// The pod gets `RuntimeDefault`; the first container gets the restricted
/// context unless it already carries one.
pub fn add_seccomp_profile(pod: &mut PodSpec, facts: &ClusterFacts) {
    if !facts.is_modern() {
        return;
    }

    pod.security_context
        .get_or_insert_with(PodSecurityContext::default)
        .seccomp_profile = Some(runtime_default_seccomp());

    if let Some(container) = pod.containers.first_mut() {
        container
            .security_context
            .get_or_insert_with(restricted_security_context);
    }
}

/// Proxy settings as container environment
pub fn proxy_env(vars: &[(String, String)]) -> Vec<EnvVar> {
    vars.iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect()
}

/// Whether `labels` has every entry of `expected`
pub fn has_labels(labels: Option<&BTreeMap<String, String>>, expected: &BTreeMap<String, String>) -> bool {
    let labels = match labels {
        Some(labels) => labels,
        None => return expected.is_empty(),
    };

    expected.iter().all(|(k, v)| labels.get(k) == Some(v))
}

/// The managed-by selector used to watch the service's children
pub fn managed_selector() -> String {
    format!("{MANAGED_BY_LABEL}={OPERATOR_NAME}")
}
