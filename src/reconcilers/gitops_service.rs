use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use k8s_openapi::{
    api::{
        apps::v1::Deployment,
        core::v1::{
            Container, ContainerPort, EnvVar, Namespace, ResourceQuota, ResourceQuotaSpec,
            SecretVolumeSource, Service, ServiceAccount, ServicePort, ServiceSpec, Volume,
            VolumeMount,
        },
        rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject},
    },
    apimachinery::pkg::{api::resource::Quantity, util::intstr::IntOrString},
};
use kube::{
    api::{Patch, PatchParams},
    runtime::controller::Action,
    Api, Client, ResourceExt,
};
use serde_json::json;
use tracing::{debug, info};

use crate::{
    cluster::ClusterFacts,
    resources::{
        default_workload_resources, labels, meta, owner_reference, ArgoCD, GitopsService,
        NodePlacement, Route, RouteSpec, TlsConfig,
    },
    Error, Result, DEPRECATED_BACKEND_NAMESPACE, ENGINE_INSTANCE_NAME, ENGINE_NAMESPACE,
    SERVICE_NAME,
};

use super::{
    console_plugin, ensure, ensure_absent, ensure_exists, ensure_namespace, kam,
    placed_deployment, pod_spec, pod_spec_mut, sync, sync_placement, Context, Reconcile,
};

/// Prefix of the backend's service account and RBAC objects
const BACKEND_RBAC_PREFIX: &str = "gitops-service-";

/// Port the backend listens on
const BACKEND_PORT: i32 = 8080;

/// Secret holding the backend's serving certificate
const BACKEND_CERT_VOLUME: &str = "backend-ssl";

const SERVING_CERT_ANNOTATION: &str = "service.beta.openshift.io/serving-cert-secret-name";

#[async_trait]
impl Reconcile for GitopsService {
    const CONTROLLER: &'static str = "gitopsservice";

    async fn reconcile(&self, context: Arc<Context>) -> Result<Action> {
        if self.name_any() != SERVICE_NAME {
            debug!("Ignoring GitopsService {}, only {SERVICE_NAME} is served", self.name_any());
            return Ok(Action::await_change());
        }

        let client = context.client.clone();
        let backend_namespace = backend_namespace(&context.facts);

        ensure_namespace(client.clone(), ENGINE_NAMESPACE).await?;
        if backend_namespace != ENGINE_NAMESPACE {
            ensure_namespace(client.clone(), backend_namespace).await?;
        }

        if context.settings.disable_default_instance {
            remove_default_instance(client.clone()).await?;
        } else {
            self.reconcile_quota(&context).await?;
            self.reconcile_default_instance(&context).await?;
        }

        self.reconcile_backend(&context, backend_namespace).await?;
        kam::reconcile(self, &context).await?;
        console_plugin::reconcile(self, &context).await?;

        // Children are watched, so only check back once in a while
        Ok(Action::requeue(Duration::from_secs(60 * 60)))
    }
}

/// Namespace of the backend workload, which moved after 4.6
pub fn backend_namespace(facts: &ClusterFacts) -> &'static str {
    if facts.uses_deprecated_backend_namespace() {
        DEPRECATED_BACKEND_NAMESPACE
    } else {
        ENGINE_NAMESPACE
    }
}

/// Name of the quota once applied to the engine namespace
pub fn quota_name(namespace: &str) -> String {
    format!("{namespace}-compute-resources")
}

impl GitopsService {
    /// Create the compute quota when opted in, otherwise drop a leftover one
    async fn reconcile_quota(&self, context: &Context) -> Result<()> {
        let quotas = Api::<ResourceQuota>::namespaced(context.client.clone(), ENGINE_NAMESPACE);
        let name = quota_name(ENGINE_NAMESPACE);

        if !context.settings.manage_resource_quota {
            if ensure_absent(&quotas, &name).await? {
                info!(r#"Removed resource quota "{ENGINE_NAMESPACE}/{name}""#);
            }
            return Ok(());
        }

        let hard = BTreeMap::from([
            ("requests.memory".to_string(), Quantity("4544Mi".into())),
            ("limits.memory".to_string(), Quantity("9070Mi".into())),
            ("requests.cpu".to_string(), Quantity("6688m".into())),
            ("limits.cpu".to_string(), Quantity("13750m".into())),
        ]);
        let quota = ResourceQuota {
            metadata: meta! {
                owners: vec![owner_reference(self)?],
                name: Some(name),
                namespace: Some(ENGINE_NAMESPACE.into()),
                labels: Some(labels!(managed)),
            },
            spec: Some(ResourceQuotaSpec {
                hard: Some(hard),
                scopes: Some(vec!["NotTerminating".into()]),
                ..Default::default()
            }),
            ..Default::default()
        };

        ensure_exists(&quotas, &quota).await.map(|_| ())
    }

    /// Node placement handed to the engine instance, if any was asked for
    pub fn engine_placement(&self) -> Option<NodePlacement> {
        let node_selector = self.placement_node_selector();
        let tolerations = self.workload_tolerations();
        if node_selector.is_none() && tolerations.is_none() {
            return None;
        }

        Some(NodePlacement {
            node_selector,
            tolerations,
        })
    }

    async fn reconcile_default_instance(&self, context: &Context) -> Result<ArgoCD> {
        let instances = Api::<ArgoCD>::namespaced(context.client.clone(), ENGINE_NAMESPACE);

        let mut desired = ArgoCD::default_instance()?;
        desired.metadata.owner_references = Some(vec![owner_reference(self)?]);
        desired.metadata.labels = Some(labels!(managed));
        desired.spec.node_placement = self.engine_placement();

        ensure(&instances, &desired, |current, desired| {
            let mut changed = current.fill_missing_resources(&desired.spec);
            changed |= sync(&mut current.spec.node_placement, &desired.spec.node_placement);
            changed
        })
        .await
    }

    async fn reconcile_backend(&self, context: &Context, namespace: &str) -> Result<()> {
        let client = context.client.clone();
        let name = format!("{BACKEND_RBAC_PREFIX}{SERVICE_NAME}");
        let owners = vec![owner_reference(self)?];

        let accounts = Api::<ServiceAccount>::namespaced(client.clone(), namespace);
        let account = ServiceAccount {
            metadata: meta! {
                owners: owners.clone(),
                name: Some(name.clone()),
                namespace: Some(namespace.into()),
                labels: Some(labels!(managed)),
            },
            ..Default::default()
        };
        ensure_exists(&accounts, &account).await?;

        let cluster_roles = Api::<ClusterRole>::all(client.clone());
        let cluster_role = ClusterRole {
            metadata: meta! {
                owners: owners.clone(),
                name: Some(name.clone()),
                labels: Some(labels!(managed)),
            },
            rules: Some(backend_rules()),
            ..Default::default()
        };
        ensure(&cluster_roles, &cluster_role, |current, desired| {
            sync(&mut current.rules, &desired.rules)
        })
        .await?;

        let bindings = Api::<ClusterRoleBinding>::all(client.clone());
        let binding = ClusterRoleBinding {
            metadata: meta! {
                owners: owners.clone(),
                name: Some(name.clone()),
                labels: Some(labels!(managed)),
            },
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".into(),
                kind: "ClusterRole".into(),
                name: name.clone(),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".into(),
                name: name.clone(),
                namespace: Some(namespace.into()),
                ..Default::default()
            }]),
        };
        ensure(&bindings, &binding, |current, desired| {
            sync(&mut current.subjects, &desired.subjects)
        })
        .await?;

        let deployments = Api::<Deployment>::namespaced(client.clone(), namespace);
        let deployment = self.backend_deployment(context, namespace, name)?;
        ensure(&deployments, &deployment, backend_drift).await?;

        let services = Api::<Service>::namespaced(client.clone(), namespace);
        let service = Service {
            metadata: meta! {
                owners: owners.clone(),
                name: Some(SERVICE_NAME.into()),
                namespace: Some(namespace.into()),
                labels: Some(labels!(managed)),
                annotations: Some(labels!(SERVING_CERT_ANNOTATION => SERVICE_NAME)),
            },
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort {
                    port: BACKEND_PORT,
                    protocol: Some("TCP".into()),
                    target_port: Some(IntOrString::Int(BACKEND_PORT)),
                    ..Default::default()
                }]),
                selector: Some(labels!("app.kubernetes.io/name" => SERVICE_NAME)),
                ..Default::default()
            }),
            ..Default::default()
        };
        ensure_exists(&services, &service).await?;

        let routes = Api::<Route>::namespaced(client, namespace);
        let mut route = Route::new(
            SERVICE_NAME,
            RouteSpec::to_service(
                SERVICE_NAME,
                BACKEND_PORT,
                TlsConfig {
                    termination: "reencrypt".into(),
                    insecure_edge_termination_policy: Some("Allow".into()),
                },
            ),
        );
        route.metadata = meta! {
            owners: owners,
            name: Some(SERVICE_NAME.into()),
            namespace: Some(namespace.into()),
            labels: Some(labels!(managed)),
        };
        ensure_exists(&routes, &route).await?;

        debug!(r#"Backend reconciled in "{namespace}""#);
        Ok(())
    }

    fn backend_deployment(
        &self,
        context: &Context,
        namespace: &str,
        service_account: String,
    ) -> Result<Deployment> {
        let container = Container {
            name: SERVICE_NAME.into(),
            image: Some(context.settings.backend_image.clone()),
            ports: Some(vec![ContainerPort {
                name: Some("http".into()),
                container_port: BACKEND_PORT,
                protocol: Some("TCP".into()),
                ..Default::default()
            }]),
            env: Some(vec![EnvVar {
                name: "INSECURE".into(),
                value: Some("true".into()),
                ..Default::default()
            }]),
            volume_mounts: Some(vec![VolumeMount {
                name: BACKEND_CERT_VOLUME.into(),
                mount_path: "/etc/gitops/ssl".into(),
                read_only: Some(true),
                ..Default::default()
            }]),
            resources: Some(
                self.backend_resources()
                    .unwrap_or_else(default_workload_resources),
            ),
            ..Default::default()
        };
        let volumes = vec![Volume {
            name: BACKEND_CERT_VOLUME.into(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(SERVICE_NAME.into()),
                ..Default::default()
            }),
            ..Default::default()
        }];

        placed_deployment(
            self,
            &context.facts,
            SERVICE_NAME,
            namespace,
            container,
            Some(volumes),
            Some(service_account),
        )
    }
}

/// Read access to applications and secrets for the backend
fn backend_rules() -> Vec<PolicyRule> {
    let read = |group: &str, resource: &str| PolicyRule {
        api_groups: Some(vec![group.into()]),
        resources: Some(vec![resource.into()]),
        verbs: vec!["get".into(), "list".into(), "watch".into()],
        ..Default::default()
    };

    vec![read("argoproj.io", "applications"), read("", "secrets")]
}

/// Container image, env, args, resources and security context, plus the
/// pod's placement and security context
fn backend_drift(current: &mut Deployment, desired: &Deployment) -> bool {
    let (Some(pod), Some(wanted)) = (pod_spec_mut(current), pod_spec(desired)) else {
        return false;
    };
    let (Some(container), Some(expected)) = (pod.containers.first_mut(), wanted.containers.first())
    else {
        return false;
    };

    let mut changed = sync(&mut container.image, &expected.image);
    changed |= sync(&mut container.env, &expected.env);
    changed |= sync(&mut container.args, &expected.args);
    changed |= sync(&mut container.resources, &expected.resources);
    changed |= super::sync_defaulted(&mut container.security_context, &expected.security_context);
    changed |= sync_placement(pod, wanted);
    changed
}

/// Delete the default engine instance, clearing its finalizers first so
/// the engine operator cannot hold the deletion up
pub async fn remove_default_instance(client: Client) -> Result<()> {
    let namespaces = Api::<Namespace>::all(client.clone());
    if namespaces
        .get_opt(ENGINE_NAMESPACE)
        .await
        .map_err(Error::KubeError)?
        .is_none()
    {
        return Ok(());
    }

    let instances = Api::<ArgoCD>::namespaced(client, ENGINE_NAMESPACE);
    let Some(instance) = instances
        .get_opt(ENGINE_INSTANCE_NAME)
        .await
        .map_err(Error::KubeError)?
    else {
        return Ok(());
    };

    if !instance.finalizers().is_empty() {
        let patch = Patch::Merge(json!({ "metadata": { "finalizers": null } }));
        instances
            .patch(ENGINE_INSTANCE_NAME, &PatchParams::default(), &patch)
            .await
            .map_err(Error::KubeError)?;
    }

    if ensure_absent(&instances, ENGINE_INSTANCE_NAME).await? {
        info!(r#"Removed default instance "{ENGINE_NAMESPACE}/{ENGINE_INSTANCE_NAME}""#);
    }
    Ok(())
}
