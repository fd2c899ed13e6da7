use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ResourceRequirements, Toleration};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{DEFAULT_NODE_SELECTOR, INFRA_NODE_LABEL};

/// Specification for the GitOps service singleton
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(
    kind = "GitopsService",
    group = "pipelines.openshift.io",
    version = "v1alpha1",
    status = "GitopsServiceStatus",
    doc = "The cluster-wide GitOps service configuration",
    printcolumn = r#"{ "name": "infra", "type": "boolean", "description": "workloads run on infra nodes", "jsonPath": ".spec.runOnInfra" }"#
)]
#[serde(rename_all = "camelCase")]
pub struct GitopsServiceSpec {
    /// Schedule the default workloads on infrastructure nodes.
    ///
    /// Adds the `node-role.kubernetes.io/infra` selector to the backend, the
    /// CLI server, the console plugin and the default engine instance.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub run_on_infra: bool,

    /// Tolerations copied verbatim onto every managed workload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<Toleration>>,

    /// Extra node selector merged over the defaults
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,

    /// Resource overrides for the backend and the console plugin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console_plugin: Option<ConsolePluginSettings>,

    /// Pull policy of the console plugin image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<PullPolicy>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConsolePluginSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<WorkloadSettings>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gitops_plugin: Option<WorkloadSettings>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSettings {
    /// Compute resources replacing the built-in defaults
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum PullPolicy {
    Always,
    IfNotPresent,
    Never,
}

impl PullPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PullPolicy::Always => "Always",
            PullPolicy::IfNotPresent => "IfNotPresent",
            PullPolicy::Never => "Never",
        }
    }
}

/// Placeholder status, nothing is reported yet
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
pub struct GitopsServiceStatus {}

impl GitopsService {
    /// Node selector for workloads: the default os selector, the infra
    /// selector when requested, then the user's selector on top.
    pub fn workload_node_selector(&self) -> BTreeMap<String, String> {
        let mut selector = BTreeMap::from([(
            DEFAULT_NODE_SELECTOR.0.to_string(),
            DEFAULT_NODE_SELECTOR.1.to_string(),
        )]);
        selector.extend(self.placement_node_selector().unwrap_or_default());
        selector
    }

    /// Node selector handed to the engine instance, without the os default
    pub fn placement_node_selector(&self) -> Option<BTreeMap<String, String>> {
        let mut selector = BTreeMap::new();
        if self.spec.run_on_infra {
            selector.insert(INFRA_NODE_LABEL.to_string(), String::new());
        }
        if let Some(extra) = &self.spec.node_selector {
            selector.extend(extra.clone());
        }

        (!selector.is_empty()).then_some(selector)
    }

    /// Tolerations, when any were given
    pub fn workload_tolerations(&self) -> Option<Vec<Toleration>> {
        self.spec.tolerations.clone().filter(|t| !t.is_empty())
    }

    pub fn backend_resources(&self) -> Option<ResourceRequirements> {
        self.spec
            .console_plugin
            .as_ref()
            .and_then(|c| c.backend.as_ref())
            .and_then(|b| b.resources.clone())
    }

    pub fn plugin_resources(&self) -> Option<ResourceRequirements> {
        self.spec
            .console_plugin
            .as_ref()
            .and_then(|c| c.gitops_plugin.as_ref())
            .and_then(|p| p.resources.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(spec: serde_json::Value) -> GitopsService {
        GitopsService::new("cluster", serde_json::from_value(spec).unwrap())
    }

    #[test]
    fn node_selector_layers() {
        let plain = service(serde_json::json!({}));
        assert_eq!(
            plain.workload_node_selector(),
            BTreeMap::from([("kubernetes.io/os".to_string(), "linux".to_string())])
        );
        assert_eq!(plain.placement_node_selector(), None);

        let infra = service(serde_json::json!({
            "runOnInfra": true,
            "nodeSelector": { "zone": "a", "kubernetes.io/os": "linux" }
        }));
        assert_eq!(
            infra.workload_node_selector(),
            BTreeMap::from([
                ("kubernetes.io/os".to_string(), "linux".to_string()),
                ("node-role.kubernetes.io/infra".to_string(), String::new()),
                ("zone".to_string(), "a".to_string()),
            ])
        );
    }

    #[test]
    fn empty_tolerations_are_ignored() {
        assert_eq!(service(serde_json::json!({ "tolerations": [] })).workload_tolerations(), None);
    }

    #[test]
    fn deserializes_wire_format() {
        let cr = service(serde_json::json!({
            "imagePullPolicy": "IfNotPresent",
            "consolePlugin": {
                "gitopsPlugin": { "resources": { "limits": { "cpu": "1" } } }
            }
        }));
        assert_eq!(cr.spec.image_pull_policy, Some(PullPolicy::IfNotPresent));
        assert!(cr.plugin_resources().is_some());
        assert!(cr.backend_resources().is_none());
    }
}
