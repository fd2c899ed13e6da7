use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ResourceRequirements, Toleration};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::requirements;
use crate::{Error, Result, ENGINE_INSTANCE_NAME, ENGINE_NAMESPACE};

/// Fields of the engine's resource that are never read are carried in
/// `extra` so that a replace writes them back untouched.
type Extra = BTreeMap<String, Value>;

/// Subset of the Argo CD engine instance managed by the vendored operator
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(
    kind = "ArgoCD",
    group = "argoproj.io",
    version = "v1beta1",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ArgoCDSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_set: Option<ComponentSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<ComponentSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sso: Option<SsoSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grafana: Option<ComponentSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ha: Option<ComponentSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis: Option<ComponentSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<RepoSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rbac: Option<RbacSpec>,

    /// YAML list of resources the engine never syncs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_exclusions: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_placement: Option<NodePlacement>,

    #[serde(flatten)]
    pub extra: Extra,
}

/// A workload of the engine; only its compute resources are managed here
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SsoSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dex: Option<DexSpec>,

    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DexSpec {
    #[serde(default, rename = "openShiftOAuth", skip_serializing_if = "std::ops::Not::not")]
    pub openshift_oauth: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RepoSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Requests building a trust store from user supplied CAs
    #[serde(default, rename = "systemCATrust", skip_serializing_if = "Option::is_none")]
    pub system_ca_trust: Option<SystemCaTrust>,

    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SystemCaTrust {
    /// Hide the certificates shipped with the image
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub drop_image_certificates: bool,

    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<RouteToggle>,

    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteToggle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RbacSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_policy: Option<String>,

    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodePlacement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<Toleration>>,
}

/// Name of the SSO provider that needs the dex workload
pub const DEX_PROVIDER: &str = "dex";

const DEFAULT_ADMIN_POLICY: &str = "g, system:cluster-admins, role:admin\ng, cluster-admins, role:admin\n";
const DEFAULT_SCOPES: &str = "[groups]";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResourceExclusion {
    api_groups: &'static [&'static str],
    kinds: &'static [&'static str],
    clusters: &'static [&'static str],
}

const EXCLUDED_RESOURCES: &[(&[&str], &[&str])] = &[
    (&["", "discovery.k8s.io"], &["Endpoints", "EndpointSlice"]),
    (&["apiregistration.k8s.io"], &["APIService"]),
    (&["coordination.k8s.io"], &["Lease"]),
    (
        &["authentication.k8s.io", "authorization.k8s.io"],
        &[
            "SelfSubjectReview",
            "TokenReview",
            "LocalSubjectAccessReview",
            "SelfSubjectAccessReview",
            "SelfSubjectRulesReview",
            "SubjectAccessReview",
        ],
    ),
    (&["certificates.k8s.io"], &["CertificateSigningRequest"]),
    (&["cert-manager.io"], &["CertificateRequest"]),
    (
        &["cilium.io"],
        &["CiliumIdentity", "CiliumEndpoint", "CiliumEndpointSlice"],
    ),
    (
        &["kyverno.io", "reports.kyverno.io", "wgpolicyk8s.io"],
        &[
            "PolicyReport",
            "ClusterPolicyReport",
            "EphemeralReport",
            "ClusterEphemeralReport",
            "AdmissionReport",
            "ClusterAdmissionReport",
            "BackgroundScanReport",
            "ClusterBackgroundScanReport",
            "UpdateRequest",
        ],
    ),
    (&["tekton.dev"], &["TaskRun", "PipelineRun"]),
];

/// The `resourceExclusions` document of the default instance
pub fn default_resource_exclusions() -> Result<String> {
    let exclusions: Vec<_> = EXCLUDED_RESOURCES
        .iter()
        .map(|&(api_groups, kinds)| ResourceExclusion {
            api_groups,
            kinds,
            clusters: &["*"],
        })
        .collect();

    serde_yaml::to_string(&exclusions)
        .map_err(|e| Error::InvalidConfig(format!("resource exclusions: {e}")))
}

fn component(requests: (&str, &str), limits: (&str, &str)) -> ComponentSpec {
    ComponentSpec {
        resources: Some(requirements(requests, limits)),
        ..Default::default()
    }
}

impl ArgoCD {
    /// The default engine instance, before placement and ownership are set
    pub fn default_instance() -> Result<Self> {
        let spec = ArgoCDSpec {
            application_set: Some(component(("512Mi", "250m"), ("1024Mi", "2000m"))),
            controller: Some(component(("1024Mi", "250m"), ("2048Mi", "2000m"))),
            sso: Some(SsoSpec {
                provider: Some(DEX_PROVIDER.into()),
                dex: Some(DexSpec {
                    openshift_oauth: true,
                    resources: Some(requirements(("128Mi", "250m"), ("256Mi", "500m"))),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            grafana: Some(component(("128Mi", "250m"), ("256Mi", "500m"))),
            ha: Some(ComponentSpec {
                enabled: Some(false),
                ..component(("128Mi", "250m"), ("256Mi", "500m"))
            }),
            redis: Some(component(("128Mi", "250m"), ("256Mi", "500m"))),
            repo: Some(RepoSpec {
                resources: Some(requirements(("256Mi", "250m"), ("1024Mi", "1000m"))),
                ..Default::default()
            }),
            server: Some(ServerSpec {
                resources: Some(requirements(("128Mi", "125m"), ("256Mi", "500m"))),
                route: Some(RouteToggle {
                    enabled: Some(true),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            rbac: Some(RbacSpec {
                policy: Some(DEFAULT_ADMIN_POLICY.into()),
                scopes: Some(DEFAULT_SCOPES.into()),
                default_policy: Some(String::new()),
                ..Default::default()
            }),
            resource_exclusions: Some(default_resource_exclusions()?),
            node_placement: None,
            extra: Extra::new(),
        };

        let mut instance = ArgoCD::new(ENGINE_INSTANCE_NAME, spec);
        instance.metadata.namespace = Some(ENGINE_NAMESPACE.into());
        Ok(instance)
    }

    /// Whether the instance runs dex for single sign-on
    pub fn uses_dex(&self) -> bool {
        self.spec
            .sso
            .as_ref()
            .and_then(|sso| sso.provider.as_deref())
            .is_some_and(|p| p == DEX_PROVIDER)
    }

    /// Fill every missing resource block from `defaults`.
    ///
    /// Returns whether anything changed. The application set is only touched
    /// when it is already configured; dex only when dex is the provider.
    pub fn fill_missing_resources(&mut self, defaults: &ArgoCDSpec) -> bool {
        fn fill(
            current: &mut Option<ResourceRequirements>,
            default: Option<&ResourceRequirements>,
        ) -> bool {
            match (current.is_none(), default) {
                (true, Some(default)) => {
                    *current = Some(default.clone());
                    true
                }
                _ => false,
            }
        }

        fn resources(spec: &Option<ComponentSpec>) -> Option<&ResourceRequirements> {
            spec.as_ref().and_then(|c| c.resources.as_ref())
        }

        let uses_dex = self.uses_dex();
        let spec = &mut self.spec;
        let mut changed = false;

        if let Some(appset) = spec.application_set.as_mut() {
            changed |= fill(&mut appset.resources, resources(&defaults.application_set));
        }

        for (current, default) in [
            (&mut spec.controller, &defaults.controller),
            (&mut spec.grafana, &defaults.grafana),
            (&mut spec.ha, &defaults.ha),
            (&mut spec.redis, &defaults.redis),
        ] {
            changed |= fill(
                &mut current.get_or_insert_with(Default::default).resources,
                resources(default),
            );
        }

        if uses_dex {
            let default = defaults
                .sso
                .as_ref()
                .and_then(|s| s.dex.as_ref())
                .and_then(|d| d.resources.as_ref());
            if let Some(dex) = spec.sso.as_mut().and_then(|s| s.dex.as_mut()) {
                changed |= fill(&mut dex.resources, default);
            }
        }

        changed |= fill(
            &mut spec.repo.get_or_insert_with(Default::default).resources,
            defaults.repo.as_ref().and_then(|r| r.resources.as_ref()),
        );
        changed |= fill(
            &mut spec.server.get_or_insert_with(Default::default).resources,
            defaults.server.as_ref().and_then(|s| s.resources.as_ref()),
        );

        changed
    }

    /// Name of the application controller's cluster role
    pub fn controller_cluster_role_name(&self) -> String {
        format!(
            "{}-{}-argocd-application-controller",
            self.metadata.name.as_deref().unwrap_or_default(),
            self.metadata.namespace.as_deref().unwrap_or_default()
        )
    }

    /// Name of the application controller's namespaced role
    pub fn controller_role_name(&self) -> String {
        format!(
            "{}-argocd-application-controller",
            self.metadata.name.as_deref().unwrap_or_default()
        )
    }

    pub(crate) fn prefixed_name(&self, rest: &str) -> String {
        format!("{}-{rest}", self.metadata.name.as_deref().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    fn limit(resources: &Option<ResourceRequirements>, key: &str) -> Option<String> {
        resources
            .as_ref()
            .and_then(|r| r.limits.as_ref())
            .and_then(|l| l.get(key))
            .map(|q| q.0.clone())
    }

    #[test]
    fn default_instance_shape() {
        let argocd = ArgoCD::default_instance().unwrap();
        assert_eq!(argocd.metadata.name.as_deref(), Some("openshift-gitops"));
        assert_eq!(argocd.metadata.namespace.as_deref(), Some("openshift-gitops"));

        let repo = argocd.spec.repo.as_ref().unwrap();
        assert_eq!(limit(&repo.resources, "memory").as_deref(), Some("1024Mi"));
        assert_eq!(limit(&repo.resources, "cpu").as_deref(), Some("1000m"));
        assert!(argocd.uses_dex());
        let route = argocd.spec.server.unwrap().route.unwrap();
        assert_eq!(route.enabled, Some(true));
    }

    #[test]
    fn exclusions_cover_tekton_runs() {
        let exclusions: Vec<Value> =
            serde_yaml::from_str(&default_resource_exclusions().unwrap()).unwrap();
        assert!(exclusions.contains(&serde_json::json!({
            "apiGroups": ["tekton.dev"],
            "kinds": ["TaskRun", "PipelineRun"],
            "clusters": ["*"],
        })));
    }

    #[test]
    fn unknown_fields_survive_a_round_trip() {
        let raw = serde_json::json!({
            "apiVersion": "argoproj.io/v1beta1",
            "kind": "ArgoCD",
            "metadata": { "name": "a", "namespace": "b" },
            "spec": {
                "repo": { "replicas": 2, "systemCATrust": { "dropImageCertificates": true } },
                "kustomizeBuildOptions": "--enable-helm"
            }
        });
        let argocd: ArgoCD = serde_json::from_value(raw.clone()).unwrap();
        assert!(argocd.spec.repo.as_ref().unwrap().system_ca_trust.as_ref().unwrap().drop_image_certificates);
        assert_eq!(serde_json::to_value(&argocd).unwrap()["spec"], raw["spec"]);
    }

    #[test]
    fn route_and_rbac_settings_survive_a_round_trip() {
        let raw = serde_json::json!({
            "apiVersion": "argoproj.io/v1beta1",
            "kind": "ArgoCD",
            "metadata": { "name": "a", "namespace": "b" },
            "spec": {
                "server": {
                    "route": { "enabled": true, "tls": { "termination": "reencrypt" } }
                },
                "rbac": { "policy": "g, ops, role:admin", "policyMatcherMode": "regex" }
            }
        });
        let argocd: ArgoCD = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(serde_json::to_value(&argocd).unwrap()["spec"], raw["spec"]);
    }

    #[test]
    fn route_without_enabled_is_accepted() {
        for route in [serde_json::json!({}), serde_json::json!({ "path": "/argocd" })] {
            let raw = serde_json::json!({
                "apiVersion": "argoproj.io/v1beta1",
                "kind": "ArgoCD",
                "metadata": { "name": "a", "namespace": "b" },
                "spec": { "server": { "route": route } }
            });
            let argocd: ArgoCD = serde_json::from_value(raw.clone()).unwrap();
            assert_eq!(argocd.spec.server.as_ref().unwrap().route.as_ref().unwrap().enabled, None);
            assert_eq!(serde_json::to_value(&argocd).unwrap()["spec"], raw["spec"]);
        }
    }

    #[test]
    fn fills_only_missing_resources() {
        let defaults = ArgoCD::default_instance().unwrap().spec;
        let custom = ResourceRequirements {
            limits: Some(BTreeMap::from([("cpu".to_string(), Quantity("4".into()))])),
            ..Default::default()
        };

        let mut argocd = ArgoCD::new("openshift-gitops", ArgoCDSpec::default());
        argocd.spec.controller = Some(ComponentSpec {
            resources: Some(custom.clone()),
            ..Default::default()
        });

        assert!(argocd.fill_missing_resources(&defaults));
        assert_eq!(argocd.spec.controller.as_ref().unwrap().resources, Some(custom));
        assert_eq!(
            argocd.spec.redis.as_ref().unwrap().resources,
            defaults.redis.as_ref().unwrap().resources
        );
        // not configured, so left alone
        assert_eq!(argocd.spec.application_set, None);

        assert!(!argocd.fill_missing_resources(&defaults));
    }
}
