use async_trait::async_trait;
use indoc::indoc;
use k8s_openapi::api::{
    apps::v1::{Deployment, StatefulSet},
    core::v1::{
        Capabilities, Container, EmptyDirVolumeSource, PodSpec, Volume, VolumeMount,
    },
    rbac::v1::{ClusterRole, PolicyRule},
};
use kube::{
    runtime::{reflector::ObjectRef, watcher, Controller},
    Api, Client, ResourceExt,
};
use tracing::info;

use super::{BuilderHook, Draft, ResourceHook};
use crate::{cluster::is_modern_version, resources::{restricted_security_context, ArgoCD}, Error, Result};

/// Cluster role whose rules are folded into the application controller role
pub const ADMIN_CLUSTER_ROLE: &str = "admin";

/// Marker of the productized engine images
const RELEASED_IMAGE_PATTERN: &str = "registry.redhat.io/openshift-gitops-1/argocd-rhel";

const CA_TRUST_SOURCE_VOLUME: &str = "argocd-ca-trust-source";
const CA_TRUST_TARGET_VOLUME: &str = "argocd-ca-trust-target";
const DISTRO_CA_TRUST_VOLUME: &str = "distro-ca-trust-source";
const CA_TRUST_INIT_CONTAINER: &str = "update-ca-certificates";
const RHEL_CA_TRUST_PATH: &str = "/etc/pki/ca-trust";

const CA_TRUST_SCRIPT: &str = indoc! {r#"
    set -eEuo pipefail
    trap 's=$?; echo >&2 "$0: Error on line "$LINENO": $BASH_COMMAND"; exit $s' ERR

    # Populate the empty volume with the expected structure
    mkdir -p /etc/pki/ca-trust/{extracted/{openssl,pem,java,edk2},source/{anchors,blacklist}}

    # Copy user anchors where update-ca-trust expects it
    ls /var/run/secrets/ca-trust-source/ | while read -r f; do
        cp -L "/var/run/secrets/ca-trust-source/$f" /etc/pki/ca-trust/source/anchors/
    done

    echo "User defined trusted CA files:"
    ls /etc/pki/ca-trust/source/anchors/

    update-ca-trust

    echo "Trusted anchors:"
    trust list

    echo "Done!"
"#};

fn strings(values: &[&str]) -> Option<Vec<String>> {
    Some(values.iter().map(|v| v.to_string()).collect())
}

fn rule(api_groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: strings(api_groups),
        resources: strings(resources),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    }
}

/// Rules letting the application controller manage cluster configuration
pub fn cluster_config_rules() -> Vec<PolicyRule> {
    let mut rules = vec![
        rule(&["*"], &["*"], &["get", "list", "watch"]),
        PolicyRule {
            non_resource_urls: strings(&["*"]),
            verbs: vec!["get".into(), "list".into()],
            ..Default::default()
        },
    ];

    for group in [
        "operators.coreos.com",
        "operator.openshift.io",
        "user.openshift.io",
        "config.openshift.io",
        "console.openshift.io",
    ] {
        rules.push(rule(&[group], &["*"], &["*"]));
    }

    rules.push(rule(
        &[""],
        &["namespaces", "persistentvolumeclaims", "persistentvolumes", "configmaps"],
        &["*"],
    ));

    for group in [
        "rbac.authorization.k8s.io",
        "storage.k8s.io",
        "machine.openshift.io",
        "machineconfiguration.openshift.io",
    ] {
        rules.push(rule(&[group], &["*"], &["*"]));
    }

    rules.push(rule(&["compliance.openshift.io"], &["scansettingbindings"], &["*"]));
    rules.push(rule(&[""], &["serviceaccounts"], &["impersonate"]));
    rules
}

/// Base rules of the namespaced application controller role
pub fn application_controller_rules() -> Vec<PolicyRule> {
    vec![
        rule(&["*"], &["*"], &["get", "list", "watch"]),
        rule(&["monitoring.coreos.com"], &["*"], &["*"]),
        rule(
            &["argoproj.io"],
            &["applications", "applicationsets", "appprojects", "argocds"],
            &["*"],
        ),
    ]
}

/// Adapts the engine operator's objects to OpenShift
pub struct OpenShiftHook {
    client: Client,
    cluster_config_namespaces: Vec<String>,
}

impl OpenShiftHook {
    pub fn new(client: Client, cluster_config_namespaces: Vec<String>) -> Self {
        Self {
            client,
            cluster_config_namespaces,
        }
    }

    /// Whether cluster secrets of `namespace` may target the whole cluster
    fn allows_cluster_scope(&self, namespace: &str) -> bool {
        match self.cluster_config_namespaces.first() {
            Some(first) if first == "*" => true,
            _ => self.cluster_config_namespaces.iter().any(|n| n == namespace),
        }
    }

    async fn admin_rules(&self) -> Result<Vec<PolicyRule>> {
        let admin = Api::<ClusterRole>::all(self.client.clone())
            .get(ADMIN_CLUSTER_ROLE)
            .await
            .map_err(Error::KubeError)?;

        Ok(admin.rules.unwrap_or_default())
    }
}

#[async_trait]
impl ResourceHook for OpenShiftHook {
    async fn mutate(&self, engine: &ArgoCD, draft: Draft<'_>, hint: &str) -> Result<()> {
        let namespace = engine.namespace().unwrap_or_default();
        let name = engine.name_any();

        match draft {
            Draft::ClusterRole(role) if role.name_any() == engine.controller_cluster_role_name() => {
                info!(r#"Configuring cluster config policy rules for "{namespace}/{name}""#);
                role.rules = Some(cluster_config_rules());
            }

            Draft::Role(role) if role.name_any() == engine.controller_role_name() => {
                info!(r#"Configuring application controller role for "{namespace}/{name}""#);
                let mut rules = application_controller_rules();
                rules.extend(self.admin_rules().await?);
                role.rules = Some(rules);
            }

            Draft::Deployment(deployment) => mutate_deployment(engine, deployment, hint),

            Draft::StatefulSet(set) if set.name_any() == engine.prefixed_name("redis-ha-server") => {
                info!(r#"Configuring redis-ha-server for "{namespace}/{name}""#);
                mutate_redis_ha_server(set);
            }

            Draft::Secret(secret) if self.allows_cluster_scope(&namespace) => {
                info!(r#"Widening cluster secret scope for "{namespace}/{name}""#);
                if let Some(data) = secret.data.as_mut() {
                    data.remove("namespaces");
                }
            }

            _ => {}
        }

        Ok(())
    }
}

fn pod_spec(deployment: &mut Deployment) -> Option<&mut PodSpec> {
    deployment
        .spec
        .as_mut()
        .and_then(|s| s.template.spec.as_mut())
}

fn prepend(values: &mut Option<Vec<String>>, prefix: &[&str]) {
    let mut merged: Vec<String> = prefix.iter().map(|v| v.to_string()).collect();
    merged.extend(values.take().unwrap_or_default());
    *values = Some(merged);
}

fn mutate_deployment(engine: &ArgoCD, deployment: &mut Deployment, version: &str) {
    let name = deployment.name_any();

    if name == engine.prefixed_name("redis") {
        info!("Configuring redis deployment {name}");
        if let Some(container) = pod_spec(deployment).and_then(|p| p.containers.first_mut()) {
            prepend(&mut container.args, &["redis-server", "--protected-mode", "no"]);
        }
    } else if name == engine.prefixed_name("redis-ha-haproxy") {
        info!("Configuring redis haproxy deployment {name}");
        if let Some(container) = pod_spec(deployment).and_then(|p| p.containers.first_mut()) {
            configure_haproxy(container, version);
        }
    } else if name == engine.prefixed_name("repo-server") {
        let trust = engine.spec.repo.as_ref().and_then(|r| r.system_ca_trust.as_ref());
        let Some(pod) = pod_spec(deployment) else {
            return;
        };
        let Some(image) = pod.containers.first().and_then(|c| c.image.clone()) else {
            return;
        };

        if let Some(trust) = trust {
            if image.contains(RELEASED_IMAGE_PATTERN) {
                rebuild_ca_trust(pod, &image, trust.drop_image_certificates);
            }
        }
    }
}

/// The productized haproxy binary carries the bind capability; newer
/// platforms must grant it while older ones reject any added capability.
fn configure_haproxy(container: &mut Container, version: &str) {
    prepend(
        &mut container.command,
        &["haproxy", "-f", "/usr/local/etc/haproxy/haproxy.cfg"],
    );

    if is_modern_version(version) {
        container
            .security_context
            .get_or_insert_with(Default::default)
            .capabilities
            .get_or_insert_with(Capabilities::default)
            .add = Some(vec!["NET_BIND_SERVICE".into()]);
    } else if let Some(context) = container.security_context.as_mut() {
        context.capabilities = None;
    }
}

/// Swap the upstream CA trust init container for the RHEL procedure
fn rebuild_ca_trust(pod: &mut PodSpec, image: &str, drop_image_certificates: bool) {
    let mut init = Container {
        name: CA_TRUST_INIT_CONTAINER.into(),
        image: Some(image.into()),
        security_context: Some(restricted_security_context()),
        volume_mounts: Some(vec![
            VolumeMount {
                name: CA_TRUST_SOURCE_VOLUME.into(),
                mount_path: "/var/run/secrets/ca-trust-source".into(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: CA_TRUST_TARGET_VOLUME.into(),
                mount_path: RHEL_CA_TRUST_PATH.into(),
                ..Default::default()
            },
        ]),
        command: Some(vec!["/bin/bash".into(), "-c".into()]),
        args: Some(vec![CA_TRUST_SCRIPT.into()]),
        ..Default::default()
    };

    if drop_image_certificates {
        pod.volumes.get_or_insert_with(Vec::new).push(Volume {
            name: DISTRO_CA_TRUST_VOLUME.into(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        });
        init.volume_mounts.get_or_insert_with(Vec::new).push(VolumeMount {
            name: DISTRO_CA_TRUST_VOLUME.into(),
            mount_path: "/usr/share/pki/ca-trust-source/".into(),
            ..Default::default()
        });
    }

    let init_containers = pod.init_containers.get_or_insert_with(Vec::new);
    init_containers.retain(|c| c.name != CA_TRUST_INIT_CONTAINER);
    init_containers.push(init);

    let mut mounted_to = vec![];
    for container in pod
        .containers
        .iter_mut()
        .filter(|c| c.image.as_deref() == Some(image))
    {
        mounted_to.push(container.name.clone());
        if let Some(mounts) = container.volume_mounts.as_mut() {
            mounts.retain(|m| m.name != CA_TRUST_SOURCE_VOLUME);
            mounts
                .iter_mut()
                .filter(|m| m.name == CA_TRUST_TARGET_VOLUME)
                .for_each(|m| m.mount_path = RHEL_CA_TRUST_PATH.into());
        }
    }

    info!("Injected system CA trust into repo-server containers: {}", mounted_to.join(","));
}

fn mutate_redis_ha_server(set: &mut StatefulSet) {
    let Some(pod) = set.spec.as_mut().and_then(|s| s.template.spec.as_mut()) else {
        return;
    };

    for container in pod.containers.iter_mut() {
        let args: &[&str] = match container.name.as_str() {
            "redis" => &["redis-server", "/data/conf/redis.conf"],
            "sentinel" => &["redis-sentinel", "/data/conf/sentinel.conf"],
            _ => continue,
        };
        container.args = strings(args);
        container.command = Some(vec![]);
    }

    if let Some(init) = pod.init_containers.as_mut().and_then(|c| c.first_mut()) {
        init.args = strings(&["sh", "/readonly-config/init.sh"]);
        init.command = Some(vec![]);
    }
}

/// Re-enqueues every engine instance when the `admin` cluster role changes,
/// since the application controller role embeds its rules.
pub struct AdminRoleWatch;

impl BuilderHook for AdminRoleWatch {
    fn extend(&self, controller: Controller<ArgoCD>, client: Client) -> Controller<ArgoCD> {
        info!("Watching the admin cluster role for engine instances");

        let engines = controller.store();
        let roles = Api::<ClusterRole>::all(client);
        let config = watcher::Config::default().fields(&format!("metadata.name={ADMIN_CLUSTER_ROLE}"));

        controller.watches(roles, config, move |role| {
            if role.name_any() != ADMIN_CLUSTER_ROLE {
                return vec![];
            }

            engines
                .state()
                .iter()
                .map(|engine| ObjectRef::from_obj(engine.as_ref()))
                .collect::<Vec<_>>()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use k8s_openapi::{
        api::{
            apps::v1::{DeploymentSpec, StatefulSetSpec},
            core::v1::{PodTemplateSpec, Secret, SecurityContext},
            rbac::v1::Role,
        },
        ByteString,
    };
    use kube::core::ObjectMeta;
    use serde_json::json;

    use crate::{
        resources::{ArgoCDSpec, RepoSpec, SystemCaTrust},
        testing::FakeApiServer,
    };

    fn engine() -> ArgoCD {
        let mut engine = ArgoCD::new("argocd", ArgoCDSpec::default());
        engine.metadata.namespace = Some("gitops".into());
        engine
    }

    fn hook(namespaces: &[&str]) -> (FakeApiServer, OpenShiftHook) {
        let server = FakeApiServer::openshift("4.15.1");
        let client = server.start();
        let namespaces = namespaces.iter().map(|n| n.to_string()).collect();
        (server, OpenShiftHook::new(client, namespaces))
    }

    fn deployment(name: &str, containers: Vec<Container>) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers,
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn container(name: &str) -> Container {
        Container {
            name: name.into(),
            ..Default::default()
        }
    }

    fn first_container(deployment: &Deployment) -> &Container {
        &deployment.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0]
    }

    fn haproxy() -> Deployment {
        deployment(
            "argocd-redis-ha-haproxy",
            vec![Container {
                security_context: Some(SecurityContext {
                    capabilities: Some(Capabilities {
                        drop: Some(vec!["ALL".into()]),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..container("haproxy")
            }],
        )
    }

    #[tokio::test]
    async fn haproxy_capabilities_follow_version() {
        let (_, hook) = hook(&[]);

        for version in ["4.11.0", ""] {
            let mut draft = haproxy();
            hook.mutate(&engine(), Draft::Deployment(&mut draft), version)
                .await
                .unwrap();

            let container = first_container(&draft);
            let caps = container.security_context.as_ref().unwrap().capabilities.as_ref().unwrap();
            assert_eq!(caps.add, Some(vec!["NET_BIND_SERVICE".to_string()]));
            assert_eq!(
                container.command.as_ref().unwrap()[..3],
                ["haproxy", "-f", "/usr/local/etc/haproxy/haproxy.cfg"]
            );
        }

        for version in ["4.10.0", "4.6.15"] {
            let mut draft = haproxy();
            hook.mutate(&engine(), Draft::Deployment(&mut draft), version)
                .await
                .unwrap();
            let context = first_container(&draft).security_context.as_ref().unwrap();
            assert_eq!(context.capabilities, None);
        }
    }

    #[tokio::test]
    async fn redis_args_are_prepended() {
        let (_, hook) = hook(&[]);
        let mut draft = deployment(
            "argocd-redis",
            vec![Container {
                args: Some(vec!["--save".into(), "".into()]),
                ..container("redis")
            }],
        );

        hook.mutate(&engine(), Draft::Deployment(&mut draft), "4.15.1")
            .await
            .unwrap();
        assert_eq!(
            first_container(&draft).args,
            strings(&["redis-server", "--protected-mode", "no", "--save", ""])
        );
    }

    #[tokio::test]
    async fn other_deployments_are_untouched() {
        let (_, hook) = hook(&[]);
        let original = deployment("someone-elses-redis", vec![container("redis")]);
        let mut draft = original.clone();
        hook.mutate(&engine(), Draft::Deployment(&mut draft), "")
            .await
            .unwrap();
        assert_eq!(draft, original);
    }

    #[tokio::test]
    async fn cluster_secret_scope() {
        let secret = || Secret {
            data: Some(BTreeMap::from([
                ("namespaces".to_string(), ByteString(b"gitops".to_vec())),
                ("server".to_string(), ByteString(b"https://kubernetes.default.svc".to_vec())),
            ])),
            ..Default::default()
        };

        for (allowed, widened) in [
            (vec!["*"], true),
            (vec!["other", "gitops"], true),
            (vec!["other"], false),
            (vec![], false),
        ] {
            let (_, hook) = hook(&allowed);
            let mut draft = secret();
            hook.mutate(&engine(), Draft::Secret(&mut draft), "")
                .await
                .unwrap();

            let data = draft.data.unwrap();
            assert_eq!(!data.contains_key("namespaces"), widened, "allow-list {allowed:?}");
            assert!(data.contains_key("server"));
        }
    }

    #[tokio::test]
    async fn cluster_role_gets_cluster_config_rules() {
        let (_, hook) = hook(&[]);
        let mut role = ClusterRole {
            metadata: ObjectMeta {
                name: Some("argocd-gitops-argocd-application-controller".into()),
                ..Default::default()
            },
            ..Default::default()
        };

        hook.mutate(&engine(), Draft::ClusterRole(&mut role), "")
            .await
            .unwrap();
        let rules = role.rules.unwrap();
        assert_eq!(rules, cluster_config_rules());
        assert!(rules.iter().any(|r| r.verbs == ["impersonate"]));
    }

    #[tokio::test]
    async fn role_appends_admin_rules() {
        let (_, hook) = hook(&[]);
        let mut role = Role {
            metadata: ObjectMeta {
                name: Some("argocd-argocd-application-controller".into()),
                ..Default::default()
            },
            ..Default::default()
        };

        hook.mutate(&engine(), Draft::Role(&mut role), "")
            .await
            .unwrap();
        let rules = role.rules.unwrap();
        assert_eq!(rules.len(), application_controller_rules().len() + 1);
        assert_eq!(rules.last().unwrap().resources, strings(&["pods"]));
    }

    #[tokio::test]
    async fn missing_admin_role_is_an_error() {
        let (server, hook) = hook(&[]);
        server.remove("/apis/rbac.authorization.k8s.io/v1/clusterroles/admin");

        let mut role = Role {
            metadata: ObjectMeta {
                name: Some("argocd-argocd-application-controller".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = hook
            .mutate(&engine(), Draft::Role(&mut role), "")
            .await
            .unwrap_err();
        assert!(err.is_status(404));
    }

    #[tokio::test]
    async fn redis_ha_server_uses_rhel_args() {
        let (_, hook) = hook(&[]);
        let mut set = StatefulSet {
            metadata: ObjectMeta {
                name: Some("argocd-redis-ha-server".into()),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec {
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![
                            Container {
                                command: strings(&["redis-server"]),
                                ..container("redis")
                            },
                            container("sentinel"),
                            container("exporter"),
                        ],
                        init_containers: Some(vec![container("config-init")]),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        };

        hook.mutate(&engine(), Draft::StatefulSet(&mut set), "")
            .await
            .unwrap();
        let pod = set.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.containers[0].args, strings(&["redis-server", "/data/conf/redis.conf"]));
        assert_eq!(pod.containers[0].command, Some(vec![]));
        assert_eq!(pod.containers[1].args, strings(&["redis-sentinel", "/data/conf/sentinel.conf"]));
        assert_eq!(pod.containers[2].args, None);
        assert_eq!(
            pod.init_containers.unwrap()[0].args,
            strings(&["sh", "/readonly-config/init.sh"])
        );
    }

    #[tokio::test]
    async fn repo_server_ca_trust_on_released_images() {
        let (_, hook) = hook(&[]);
        let image = "registry.redhat.io/openshift-gitops-1/argocd-rhel8:v1.14";
        let mut engine = engine();
        engine.spec.repo = Some(RepoSpec {
            system_ca_trust: Some(SystemCaTrust {
                drop_image_certificates: true,
                ..Default::default()
            }),
            ..Default::default()
        });

        let mount = |name: &str, path: &str| VolumeMount {
            name: name.into(),
            mount_path: path.into(),
            ..Default::default()
        };
        let mut draft = deployment(
            "argocd-repo-server",
            vec![
                Container {
                    image: Some(image.into()),
                    volume_mounts: Some(vec![
                        mount(CA_TRUST_SOURCE_VOLUME, "/usr/local/share/ca-certificates"),
                        mount(CA_TRUST_TARGET_VOLUME, "/etc/ssl/certs"),
                    ]),
                    ..container("argocd-repo-server")
                },
                Container {
                    image: Some("quay.io/other:latest".into()),
                    volume_mounts: Some(vec![mount(CA_TRUST_TARGET_VOLUME, "/etc/ssl/certs")]),
                    ..container("sidecar")
                },
            ],
        );
        if let Some(pod) = pod_spec(&mut draft) {
            pod.init_containers = Some(vec![container(CA_TRUST_INIT_CONTAINER)]);
        }

        hook.mutate(&engine, Draft::Deployment(&mut draft), "4.15.1")
            .await
            .unwrap();

        let pod = draft.spec.unwrap().template.spec.unwrap();
        let init = pod.init_containers.unwrap();
        assert_eq!(init.len(), 1);
        assert_eq!(init[0].image.as_deref(), Some(image));
        assert_eq!(init[0].command, strings(&["/bin/bash", "-c"]));
        assert!(init[0].args.as_ref().unwrap()[0].contains("update-ca-trust"));
        assert_eq!(init[0].volume_mounts.as_ref().unwrap().len(), 3);
        assert_eq!(pod.volumes.unwrap()[0].name, DISTRO_CA_TRUST_VOLUME);

        assert_eq!(
            serde_json::to_value(&pod.containers[0].volume_mounts).unwrap(),
            json!([{ "name": CA_TRUST_TARGET_VOLUME, "mountPath": "/etc/pki/ca-trust" }])
        );
        assert_eq!(
            pod.containers[1].volume_mounts.as_ref().unwrap()[0].mount_path,
            "/etc/ssl/certs"
        );
    }

    #[tokio::test]
    async fn repo_server_upstream_images_are_untouched() {
        let (_, hook) = hook(&[]);
        let mut engine = engine();
        engine.spec.repo = Some(RepoSpec {
            system_ca_trust: Some(SystemCaTrust::default()),
            ..Default::default()
        });

        let original = deployment(
            "argocd-repo-server",
            vec![Container {
                image: Some("quay.io/argoproj/argocd:v2.10".into()),
                ..container("argocd-repo-server")
            }],
        );
        let mut draft = original.clone();
        hook.mutate(&engine, Draft::Deployment(&mut draft), "")
            .await
            .unwrap();
        assert_eq!(draft, original);
    }
}
