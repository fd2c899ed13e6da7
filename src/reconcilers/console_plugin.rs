//! The console's dynamic GitOps plugin: an httpd serving the plugin bundle
//! over TLS and the `ConsolePlugin` registering it.

use std::collections::BTreeMap;

use indoc::formatdoc;
use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{
            ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, PodSecurityContext,
            PodSpec, PodTemplateSpec, SecretVolumeSource, Service, ServicePort, ServiceSpec,
            Toleration, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::{apis::meta::v1::LabelSelector, util::intstr::IntOrString},
};
use kube::Api;
use tracing::{debug, info};

use crate::{
    resources::{
        default_workload_resources, labels, meta, owner_reference, proxy_env,
        restricted_security_context, runtime_default_seccomp, ConsolePlugin,
        ConsolePluginBackend, ConsolePluginI18n, ConsolePluginService, ConsolePluginSpec,
        GitopsService, MANAGED_BY_LABEL,
    },
    Result, ENGINE_NAMESPACE, OPERATOR_NAME,
};

use super::{ensure, pod_spec, pod_spec_mut, sync, sync_defaulted, Context};

pub const PLUGIN_NAME: &str = "gitops-plugin";
pub const PLUGIN_DISPLAY_NAME: &str = "GitOps Plugin";
pub const PLUGIN_PORT: i32 = 9001;
pub const SERVING_CERT_NAME: &str = "console-serving-cert";
pub const HTTPD_CONFIG_NAME: &str = "httpd-cfg";

const DEFAULT_MODE: i32 = 420;

/// Reconcile the plugin when the console can load it.
///
/// The console API has to be there and the platform recent enough for
/// dynamic plugins.
pub async fn reconcile(service: &GitopsService, context: &Context) -> Result<()> {
    let facts = &context.facts;
    if !facts.console_api_present {
        return Ok(());
    }
    if !facts.supports_dynamic_plugins(&context.settings.dynamic_plugin_start_version) {
        debug!(
            "Skipping the console plugin, platform {:?} predates {}",
            facts.version, context.settings.dynamic_plugin_start_version
        );
        return Ok(());
    }

    let client = context.client.clone();
    let owners = vec![owner_reference(service)?];

    let services = Api::<Service>::namespaced(client.clone(), ENGINE_NAMESPACE);
    let mut plugin_service = plugin_service();
    plugin_service.metadata.owner_references = Some(owners.clone());
    ensure(&services, &plugin_service, |current, desired| {
        let mut changed = sync(&mut current.metadata.annotations, &desired.metadata.annotations);
        changed |= sync(&mut current.metadata.labels, &desired.metadata.labels);
        if let (Some(spec), Some(wanted)) = (current.spec.as_mut(), desired.spec.as_ref()) {
            changed |= sync(&mut spec.selector, &wanted.selector);
            changed |= sync(&mut spec.ports, &wanted.ports);
        }
        changed
    })
    .await?;

    let deployments = Api::<Deployment>::namespaced(client.clone(), ENGINE_NAMESPACE);
    let mut deployment = plugin_deployment(service, context);
    deployment.metadata.owner_references = Some(owners.clone());
    ensure(&deployments, &deployment, plugin_drift).await?;

    let config_maps = Api::<ConfigMap>::namespaced(client.clone(), ENGINE_NAMESPACE);
    let mut config_map = httpd_config_map();
    config_map.metadata.owner_references = Some(owners.clone());
    ensure(&config_maps, &config_map, |current, desired| {
        let mut changed = sync(&mut current.data, &desired.data);
        changed |= sync(&mut current.metadata.labels, &desired.metadata.labels);
        changed
    })
    .await?;

    let plugins = Api::<ConsolePlugin>::all(client);
    let mut plugin = console_plugin();
    plugin.metadata.owner_references = Some(owners);
    ensure(&plugins, &plugin, |current, desired| {
        let mut changed = sync(&mut current.spec.display_name, &desired.spec.display_name);
        changed |= sync(&mut current.spec.backend, &desired.spec.backend);
        changed
    })
    .await?;

    info!("Console plugin {PLUGIN_NAME} reconciled");
    Ok(())
}

fn plugin_labels() -> BTreeMap<String, String> {
    labels!(
        managed,
        "app" => PLUGIN_NAME,
        "app.kubernetes.io/component" => PLUGIN_NAME,
        "app.kubernetes.io/instance" => PLUGIN_NAME,
        "app.kubernetes.io/part-of" => PLUGIN_NAME,
    )
}

fn plugin_service() -> Service {
    Service {
        metadata: meta! {
            name: Some(PLUGIN_NAME.into()),
            namespace: Some(ENGINE_NAMESPACE.into()),
            labels: Some(plugin_labels()),
            annotations: Some(labels!(
                "service.beta.openshift.io/serving-cert-secret-name" => SERVING_CERT_NAME
            )),
        },
        spec: Some(ServiceSpec {
            selector: Some(labels!("app" => PLUGIN_NAME)),
            ports: Some(vec![ServicePort {
                name: Some(format!("tcp-{PLUGIN_PORT}")),
                port: PLUGIN_PORT,
                protocol: Some("TCP".into()),
                target_port: Some(IntOrString::Int(PLUGIN_PORT)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn plugin_deployment(service: &GitopsService, context: &Context) -> Deployment {
    let settings = &context.settings;
    let pull_policy = service
        .spec
        .image_pull_policy
        .map(|p| p.as_str().to_string())
        .or_else(|| settings.image_pull_policy.clone())
        .unwrap_or_else(|| "Always".into());

    let mount = |name: &str, path: &str, sub_path: &str| VolumeMount {
        name: name.into(),
        mount_path: path.into(),
        sub_path: Some(sub_path.into()),
        read_only: Some(true),
        ..Default::default()
    };

    let container = Container {
        name: PLUGIN_NAME.into(),
        image: Some(settings.plugin_image.clone()),
        image_pull_policy: Some(pull_policy),
        env: Some(proxy_env(&settings.proxy_env)),
        ports: Some(vec![ContainerPort {
            name: Some("http".into()),
            container_port: PLUGIN_PORT,
            protocol: Some("TCP".into()),
            ..Default::default()
        }]),
        volume_mounts: Some(vec![
            mount(SERVING_CERT_NAME, "/etc/httpd-ssl/certs/tls.crt", "tls.crt"),
            mount(SERVING_CERT_NAME, "/etc/httpd-ssl/private/tls.key", "tls.key"),
            mount(HTTPD_CONFIG_NAME, "/etc/httpd-cfg/httpd.conf", "httpd.conf"),
        ]),
        resources: Some(
            service
                .plugin_resources()
                .unwrap_or_else(default_workload_resources),
        ),
        security_context: Some(restricted_security_context()),
        ..Default::default()
    };

    let volumes = vec![
        Volume {
            name: SERVING_CERT_NAME.into(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(SERVING_CERT_NAME.into()),
                default_mode: Some(DEFAULT_MODE),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: HTTPD_CONFIG_NAME.into(),
            config_map: Some(ConfigMapVolumeSource {
                name: Some(HTTPD_CONFIG_NAME.into()),
                default_mode: Some(DEFAULT_MODE),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];

    let mut deployment_labels = plugin_labels();
    deployment_labels.insert(
        "app.kubernetes.io/runtime-namespace".into(),
        ENGINE_NAMESPACE.into(),
    );
    let selector = labels!("app" => PLUGIN_NAME);

    Deployment {
        metadata: meta! {
            name: Some(PLUGIN_NAME.into()),
            namespace: Some(ENGINE_NAMESPACE.into()),
            labels: Some(deployment_labels),
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(meta! { labels: Some(selector) }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(volumes),
                    restart_policy: Some("Always".into()),
                    dns_policy: Some("ClusterFirst".into()),
                    node_selector: Some(service.workload_node_selector()),
                    tolerations: service.workload_tolerations(),
                    security_context: Some(PodSecurityContext {
                        seccomp_profile: Some(runtime_default_seccomp()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn httpd_config() -> String {
    let virtual_host = [
        "DocumentRoot /var/www/html/plugin".to_string(),
        "SSLEngine on".to_string(),
        r#"SSLCertificateFile "/etc/httpd-ssl/certs/tls.crt""#.to_string(),
        r#"SSLCertificateKeyFile "/etc/httpd-ssl/private/tls.key""#.to_string(),
    ]
    .map(|line| format!("\t{line}"))
    .join("\n");

    formatdoc! {r#"
        LoadModule ssl_module modules/mod_ssl.so
        Listen {port} https
        ServerRoot "/etc/httpd"

        <VirtualHost *:{port}>
        {virtual_host}
        </VirtualHost>"#,
        port = PLUGIN_PORT,
        virtual_host = virtual_host,
    }
}

fn httpd_config_map() -> ConfigMap {
    ConfigMap {
        metadata: meta! {
            name: Some(HTTPD_CONFIG_NAME.into()),
            namespace: Some(ENGINE_NAMESPACE.into()),
            labels: Some(labels!(
                "app" => PLUGIN_NAME,
                "app.kubernetes.io/part-of" => PLUGIN_NAME,
                MANAGED_BY_LABEL => OPERATOR_NAME,
            )),
        },
        data: Some(BTreeMap::from([("httpd.conf".to_string(), httpd_config())])),
        ..Default::default()
    }
}

fn console_plugin() -> ConsolePlugin {
    let mut plugin = ConsolePlugin::new(
        PLUGIN_NAME,
        ConsolePluginSpec {
            display_name: PLUGIN_DISPLAY_NAME.into(),
            backend: ConsolePluginBackend {
                type_: "Service".into(),
                service: Some(ConsolePluginService {
                    name: PLUGIN_NAME.into(),
                    namespace: ENGINE_NAMESPACE.into(),
                    port: PLUGIN_PORT,
                    base_path: "/".into(),
                }),
            },
            i18n: Some(ConsolePluginI18n {
                load_type: "Preload".into(),
            }),
        },
    );
    plugin.metadata.labels = Some(labels!(managed));
    plugin
}

/// Fill in what the API server defaults on every container and order the
/// lists it may hand back reshuffled
fn normalized_containers(containers: &[Container]) -> Vec<Container> {
    let mut containers = containers.to_vec();
    for container in &mut containers {
        container
            .termination_message_path
            .get_or_insert_with(|| "/dev/termination-log".into());
        container
            .termination_message_policy
            .get_or_insert_with(|| "File".into());
        if let Some(env) = container.env.as_mut() {
            env.sort_by(|a, b| a.name.cmp(&b.name));
        }
        if let Some(ports) = container.ports.as_mut() {
            ports.sort_by(|a, b| (a.container_port, &a.name).cmp(&(b.container_port, &b.name)));
        }
        if let Some(mounts) = container.volume_mounts.as_mut() {
            mounts.sort_by(|a, b| (&a.name, &a.mount_path).cmp(&(&b.name, &b.mount_path)));
        }
        if container.env.as_ref().is_some_and(Vec::is_empty) {
            container.env = None;
        }
    }
    containers.sort_by(|a, b| a.name.cmp(&b.name));
    containers
}

fn normalized_volumes(volumes: &Option<Vec<Volume>>) -> Vec<Volume> {
    let mut volumes = volumes.clone().unwrap_or_default();
    volumes.sort_by(|a, b| a.name.cmp(&b.name));
    volumes
}

fn normalized_tolerations(tolerations: &Option<Vec<Toleration>>) -> Vec<Toleration> {
    let mut tolerations = tolerations.clone().unwrap_or_default();
    tolerations.sort_by(|a, b| {
        (&a.key, &a.operator, &a.effect).cmp(&(&b.key, &b.operator, &b.effect))
    });
    tolerations
}

/// Compare the whole deployment shape and overwrite what differs
fn plugin_drift(current: &mut Deployment, desired: &Deployment) -> bool {
    let mut changed = sync(&mut current.metadata.labels, &desired.metadata.labels);

    let (Some(spec), Some(wanted)) = (current.spec.as_mut(), desired.spec.as_ref()) else {
        return changed;
    };
    changed |= sync(&mut spec.replicas, &wanted.replicas);
    changed |= sync(&mut spec.selector, &wanted.selector);

    let template_labels = |t: &PodTemplateSpec| t.metadata.as_ref().and_then(|m| m.labels.clone());
    if template_labels(&spec.template) != template_labels(&wanted.template) {
        spec.template.metadata.get_or_insert_with(Default::default).labels =
            template_labels(&wanted.template);
        changed = true;
    }

    let (Some(pod), Some(wanted)) = (pod_spec_mut(current), pod_spec(desired)) else {
        return changed;
    };

    if normalized_containers(&pod.containers) != normalized_containers(&wanted.containers) {
        pod.containers = wanted.containers.clone();
        changed = true;
    }
    if normalized_volumes(&pod.volumes) != normalized_volumes(&wanted.volumes) {
        pod.volumes = wanted.volumes.clone();
        changed = true;
    }
    if normalized_tolerations(&pod.tolerations) != normalized_tolerations(&wanted.tolerations) {
        pod.tolerations = wanted.tolerations.clone();
        changed = true;
    }
    changed |= sync(&mut pod.restart_policy, &wanted.restart_policy);
    changed |= sync(&mut pod.dns_policy, &wanted.dns_policy);
    changed |= sync_defaulted(&mut pod.node_selector, &wanted.node_selector);
    changed |= sync_defaulted(&mut pod.security_context, &wanted.security_context);
    changed
}
