//! The `kam` CLI server and its console download link.

use k8s_openapi::{
    api::{
        apps::v1::Deployment,
        core::v1::{Container, ContainerPort, Service, ServicePort, ServiceSpec},
    },
    apimachinery::pkg::util::intstr::IntOrString,
};
use kube::Api;
use tracing::debug;

use crate::{
    resources::{
        default_workload_resources, labels, meta, owner_reference, CLIDownloadLink,
        ConsoleCLIDownload, ConsoleCLIDownloadSpec, GitopsService, Route, RouteSpec, TlsConfig,
    },
    Result, ENGINE_NAMESPACE,
};

use super::{
    ensure, ensure_exists, placed_deployment, pod_spec, pod_spec_mut, sync, sync_defaulted,
    sync_placement, Context,
};

pub const CLI_NAME: &str = "kam";

/// Shown in the console's command line tools page
pub const CLI_LONG_NAME: &str = "GitOps Application Manager";

const HTTP_PORT: i32 = 8080;
const TLS_PORT: i32 = 8443;

/// Serve the CLI binaries and advertise them in the console.
///
/// Nothing happens on clusters without the console API.
pub async fn reconcile(service: &GitopsService, context: &Context) -> Result<()> {
    if !context.facts.console_api_present {
        return Ok(());
    }

    let client = context.client.clone();
    let owners = vec![owner_reference(service)?];

    let deployments = Api::<Deployment>::namespaced(client.clone(), ENGINE_NAMESPACE);
    let container = Container {
        name: CLI_NAME.into(),
        image: Some(context.settings.kam_image.clone()),
        ports: Some(vec![ContainerPort {
            name: Some("http".into()),
            container_port: HTTP_PORT,
            protocol: Some("TCP".into()),
            ..Default::default()
        }]),
        resources: Some(default_workload_resources()),
        ..Default::default()
    };
    let deployment = placed_deployment(
        service,
        &context.facts,
        CLI_NAME,
        ENGINE_NAMESPACE,
        container,
        None,
        None,
    )?;
    ensure(&deployments, &deployment, cli_drift).await?;

    let services = Api::<Service>::namespaced(client.clone(), ENGINE_NAMESPACE);
    let port = |port: i32| ServicePort {
        name: Some(format!("tcp-{port}")),
        port,
        protocol: Some("TCP".into()),
        target_port: Some(IntOrString::Int(port)),
        ..Default::default()
    };
    let cli_service = Service {
        metadata: meta! {
            owners: owners.clone(),
            name: Some(CLI_NAME.into()),
            namespace: Some(ENGINE_NAMESPACE.into()),
            labels: Some(labels!(managed)),
        },
        spec: Some(ServiceSpec {
            ports: Some(vec![port(HTTP_PORT), port(TLS_PORT)]),
            selector: Some(labels!("app.kubernetes.io/name" => CLI_NAME)),
            ..Default::default()
        }),
        ..Default::default()
    };
    ensure_exists(&services, &cli_service).await?;

    let routes = Api::<Route>::namespaced(client.clone(), ENGINE_NAMESPACE);
    let mut route = Route::new(
        CLI_NAME,
        RouteSpec::to_service(
            CLI_NAME,
            TLS_PORT,
            TlsConfig {
                termination: "passthrough".into(),
                insecure_edge_termination_policy: Some("None".into()),
            },
        ),
    );
    route.metadata = meta! {
        owners: owners.clone(),
        name: Some(CLI_NAME.into()),
        namespace: Some(ENGINE_NAMESPACE.into()),
        labels: Some(labels!(managed)),
    };
    let route = ensure_exists(&routes, &route).await?;

    // The router assigns the host after creation, the route event brings us back
    if route.host().is_empty() {
        debug!("Route {CLI_NAME} has no host yet, skipping the download link");
        return Ok(());
    }

    let downloads = Api::<ConsoleCLIDownload>::all(client);
    let mut download = ConsoleCLIDownload::new(CLI_NAME, cli_download(route.host()));
    download.metadata = meta! {
        owners: owners,
        name: Some(CLI_NAME.into()),
        labels: Some(labels!(managed)),
    };
    ensure(&downloads, &download, |current, desired| {
        sync(&mut current.spec.links, &desired.spec.links)
    })
    .await?;

    Ok(())
}

/// Download entry pointing at the CLI server behind `host`
pub fn cli_download(host: &str) -> ConsoleCLIDownloadSpec {
    ConsoleCLIDownloadSpec {
        description: CLI_LONG_NAME.into(),
        display_name: CLI_LONG_NAME.into(),
        links: vec![CLIDownloadLink {
            href: format!("https://{host}/kam/"),
            text: Some(CLI_LONG_NAME.into()),
        }],
    }
}

/// Image, resources, placement and security contexts
fn cli_drift(current: &mut Deployment, desired: &Deployment) -> bool {
    let (Some(pod), Some(wanted)) = (pod_spec_mut(current), pod_spec(desired)) else {
        return false;
    };
    let (Some(container), Some(expected)) = (pod.containers.first_mut(), wanted.containers.first())
    else {
        return false;
    };

    let mut changed = sync(&mut container.image, &expected.image);
    changed |= sync_defaulted(&mut container.resources, &expected.resources);
    changed |= sync_defaulted(&mut container.security_context, &expected.security_context);
    changed |= sync_placement(pod, wanted);
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;

    use crate::{
        cluster::ClusterFacts, config::Settings, resources::GitopsServiceSpec,
        testing::FakeApiServer,
    };

    const ROUTE_PATH: &str = "/apis/route.openshift.io/v1/namespaces/openshift-gitops/routes/kam";
    const DOWNLOAD_PATH: &str = "/apis/console.openshift.io/v1/consoleclidownloads/kam";

    fn service() -> GitopsService {
        let mut service = GitopsService::new("cluster", GitopsServiceSpec::default());
        service.metadata.uid = Some("service-uid".into());
        service
    }

    fn context(server: &FakeApiServer, console: bool) -> Arc<Context> {
        Arc::new(Context {
            client: server.start(),
            diagnostics: Default::default(),
            metrics: Default::default(),
            facts: ClusterFacts {
                console_api_present: console,
                version: "4.15.1".into(),
            },
            settings: Settings::default(),
        })
    }

    #[tokio::test]
    async fn download_link_follows_the_route_host() {
        let server = FakeApiServer::openshift("4.15.1");
        let ctx = context(&server, true);

        reconcile(&service(), &ctx).await.unwrap();
        assert!(server.get(ROUTE_PATH).is_some());
        assert!(server.get(DOWNLOAD_PATH).is_none());

        server.edit(ROUTE_PATH, json!({ "spec": { "host": "kam.apps.example.com" } }));
        reconcile(&service(), &ctx).await.unwrap();

        let download = server.get(DOWNLOAD_PATH).unwrap();
        assert_eq!(download["spec"]["links"][0]["href"], "https://kam.apps.example.com/kam/");
        assert_eq!(download["spec"]["displayName"], CLI_LONG_NAME);

        let route = server.get(ROUTE_PATH).unwrap();
        assert_eq!(route["spec"]["tls"]["termination"], "passthrough");
        assert_eq!(route["spec"]["port"]["targetPort"], 8443);

        let svc = server
            .get("/api/v1/namespaces/openshift-gitops/services/kam")
            .unwrap();
        assert_eq!(svc["spec"]["ports"][1]["name"], "tcp-8443");
    }

    #[tokio::test]
    async fn nothing_without_a_console() {
        let server = FakeApiServer::new();
        reconcile(&service(), &context(&server, false)).await.unwrap();
        assert!(server.get(ROUTE_PATH).is_none());
        assert!(server
            .get("/apis/apps/v1/namespaces/openshift-gitops/deployments/kam")
            .is_none());
    }

    #[tokio::test]
    async fn image_and_placement_drift_is_corrected() {
        let server = FakeApiServer::openshift("4.15.1");
        let ctx = context(&server, true);
        reconcile(&service(), &ctx).await.unwrap();

        let path = "/apis/apps/v1/namespaces/openshift-gitops/deployments/kam";
        server.edit(
            path,
            json!({ "spec": { "template": { "spec": {
                "nodeSelector": { "disk": "ssd" },
                "containers": [{ "name": "kam", "image": "quay.io/someone/kam:latest" }]
            } } } }),
        );
        reconcile(&service(), &ctx).await.unwrap();

        let deployment = server.get(path).unwrap();
        assert_eq!(
            deployment["spec"]["template"]["spec"]["nodeSelector"],
            json!({ "kubernetes.io/os": "linux" })
        );
        let container = &deployment["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(container["image"], crate::config::DEFAULT_KAM_IMAGE);
    }

    #[tokio::test]
    async fn stripped_resources_come_back() {
        let server = FakeApiServer::openshift("4.15.1");
        let ctx = context(&server, true);
        reconcile(&service(), &ctx).await.unwrap();

        let path = "/apis/apps/v1/namespaces/openshift-gitops/deployments/kam";
        let deployment = server.get(path).unwrap();
        let original = deployment["spec"]["template"]["spec"]["containers"][0]["resources"].clone();
        assert!(original["limits"].is_object());

        server.edit(
            path,
            json!({ "spec": { "template": { "spec": {
                "containers": [{ "name": "kam", "image": crate::config::DEFAULT_KAM_IMAGE }]
            } } } }),
        );
        reconcile(&service(), &ctx).await.unwrap();

        let deployment = server.get(path).unwrap();
        let container = &deployment["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(container["resources"], original);
    }
}
