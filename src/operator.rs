use std::{fmt::Debug, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{ConfigMap, Service, ServiceAccount},
    rbac::v1::{ClusterRole, ClusterRoleBinding},
};
use kube::{
    api::{ListParams, PostParams},
    runtime::{controller::Action, reflector::ObjectRef, watcher::Config, Controller},
    Api, Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::RwLock;
use tracing::{error, field, info, instrument, Span};

use crate::{
    cluster::ClusterFacts,
    config::Settings,
    hooks::HookRegistry,
    reconcilers::{console_link, Context, Reconcile},
    resources::{
        managed_selector, ArgoCD, ConsoleCLIDownload, ConsolePlugin, GitopsService,
        GitopsServiceSpec, Route,
    },
    telemetry, Error, Metrics, Result, OPERATOR_NAME, SERVICE_NAME,
};

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    pub reporter: String,
    pub cluster_version: String,
    pub console_api_present: bool,
    pub http2: bool,
    /// Handed to the rollouts sub-operator
    pub route_plugin_location: String,
    /// Whether the engine sub-operator registers its conversion webhook
    pub conversion_webhook: bool,
    pub hooks: usize,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: OPERATOR_NAME.into(),
            cluster_version: String::new(),
            console_api_present: false,
            http2: false,
            route_plugin_location: String::new(),
            conversion_webhook: false,
            hooks: 0,
        }
    }
}

/// State shared between the controllers and the web servers
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the reconcilers
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
    metrics: Metrics,
    /// Hooks for the engine sub-operator, read only once built
    hooks: Arc<HookRegistry>,
}

/// State wrapper around the controller outputs for the web server
impl State {
    pub fn new(hooks: HookRegistry, http2: bool) -> Result<Self, prometheus::Error> {
        let registry = prometheus::Registry::default();
        let metrics = Metrics::default().register(&registry)?;
        let diagnostics = Diagnostics {
            http2,
            hooks: hooks.len(),
            ..Default::default()
        };

        Ok(Self {
            diagnostics: Arc::new(RwLock::new(diagnostics)),
            registry,
            metrics,
            hooks: Arc::new(hooks),
        })
    }

    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Handle on the registered metrics
    pub fn metrics_handle(&self) -> Metrics {
        self.metrics.clone()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    /// Hooks the engine sub-operator applies to its drafts and controller
    pub fn hooks(&self) -> Arc<HookRegistry> {
        self.hooks.clone()
    }

    // Create a Controller Context that can update State
    pub(crate) async fn to_context(
        &self,
        client: Client,
        facts: ClusterFacts,
        settings: Settings,
    ) -> Arc<Context> {
        {
            let mut diagnostics = self.diagnostics.write().await;
            diagnostics.cluster_version = facts.version.clone();
            diagnostics.console_api_present = facts.console_api_present;
            diagnostics.route_plugin_location = settings.route_plugin_location.clone();
            diagnostics.conversion_webhook = settings.enable_conversion_webhook;
        }

        Arc::new(Context {
            client,
            metrics: self.metrics.clone(),
            diagnostics: self.diagnostics.clone(),
            facts,
            settings,
        })
    }
}

pub struct GitopsController {
    state: State,
}

impl GitopsController {
    pub fn new(state: State) -> Self {
        Self { state }
    }

    /// Run every reconciler until shutdown (given the crd is installed).
    ///
    /// `label_selector` restricts the engine instances getting monitoring.
    pub async fn run(
        self,
        client: Client,
        facts: ClusterFacts,
        settings: Settings,
        label_selector: String,
    ) -> Result<(), anyhow::Error> {
        let services = Api::<GitopsService>::all(client.clone());

        // Test that we can actually query for our CRD (a.k.a. it is installed)
        if let Err(e) = services.list(&ListParams::default().limit(1)).await {
            error!("CRD is not queryable; {e:?}. Is the CRD installed?");
            info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
            anyhow::bail!("GitopsService CRD is not installed");
        }
        ensure_service_singleton(&services).await?;

        let console = facts.console_api_present;
        let context = self.state.to_context(client.clone(), facts, settings).await;

        // Every child carries the managed-by label and maps back to the singleton
        let children = Config::default().labels(&managed_selector()).any_semantic();
        let mut service_controller = Controller::new(services, Config::default().any_semantic())
            .shutdown_on_signal()
            .watches(Api::<Deployment>::all(client.clone()), children.clone(), singleton)
            .watches(Api::<Service>::all(client.clone()), children.clone(), singleton)
            .watches(Api::<ServiceAccount>::all(client.clone()), children.clone(), singleton)
            .watches(Api::<ClusterRole>::all(client.clone()), children.clone(), singleton)
            .watches(Api::<ClusterRoleBinding>::all(client.clone()), children.clone(), singleton)
            .watches(Api::<ConfigMap>::all(client.clone()), children.clone(), singleton)
            .watches(Api::<Route>::all(client.clone()), children.clone(), singleton)
            .watches(Api::<ArgoCD>::all(client.clone()), children.clone(), singleton);
        if console {
            service_controller = service_controller
                .watches(Api::<ConsolePlugin>::all(client.clone()), children.clone(), singleton)
                .watches(Api::<ConsoleCLIDownload>::all(client.clone()), children, singleton);
        }
        let service_controller = service_controller
            .run(reconcile::<GitopsService>, error_policy::<GitopsService>, context.clone())
            .filter_map(|x| async move { x.ok() })
            .for_each(|_| futures::future::ready(()));

        let mut instances = Config::default().any_semantic();
        if !label_selector.is_empty() {
            instances = instances.labels(&label_selector);
        }
        let metrics_controller = Controller::new(Api::<ArgoCD>::all(client), instances)
            .shutdown_on_signal()
            .run(reconcile::<ArgoCD>, error_policy::<ArgoCD>, context.clone())
            .filter_map(|x| async move { x.ok() })
            .for_each(|_| futures::future::ready(()));

        tokio::select! {
            _ = futures::future::join(service_controller, metrics_controller) => {},
            _ = console_link::run(context) => {},
        }

        Ok(())
    }
}

fn singleton<K>(_: K) -> Option<ObjectRef<GitopsService>> {
    Some(ObjectRef::new(SERVICE_NAME))
}

/// Create the `GitopsService` everything hangs off, unless it exists
pub async fn ensure_service_singleton(services: &Api<GitopsService>) -> Result<()> {
    let service = GitopsService::new(SERVICE_NAME, GitopsServiceSpec::default());
    match services.create(&PostParams::default(), &service).await {
        Ok(_) => {
            info!(r#"Created GitopsService "{SERVICE_NAME}""#);
            Ok(())
        }
        Err(kube::Error::Api(e)) if e.code == 409 => Ok(()),
        Err(e) => Err(Error::KubeError(e)),
    }
}

// Error handler for failed reconciliations
fn error_policy<K>(obj: Arc<K>, error: &Error, ctx: Arc<Context>) -> Action
where
    K: Reconcile,
{
    error!(
        r#"{} reconcile of "{}" failed: {error:?}"#,
        K::CONTROLLER,
        describe(obj.as_ref())
    );
    ctx.metrics.reconcile_failure(K::CONTROLLER, error);
    Action::requeue(Duration::from_secs(5))
}

/// Entry point shared by the controllers
#[instrument(skip(ctx, obj), fields(trace_id))]
async fn reconcile<K>(obj: Arc<K>, ctx: Arc<Context>) -> Result<Action>
where
    K: Reconcile + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    // Add some tracing for debugging's sake
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", &field::display(&trace_id));

    // Take some metrics to see the average reconcile time
    let _timer = ctx.metrics.count_and_measure(K::CONTROLLER);
    ctx.diagnostics.write().await.last_event = Utc::now();

    info!(
        r#"Starting {} reconciliation for "{}""#,
        K::CONTROLLER,
        describe(obj.as_ref())
    );
    obj.reconcile(ctx.clone()).await
}

fn describe<K: Resource>(obj: &K) -> String {
    match obj.namespace() {
        Some(ns) => format!("{ns}/{}", obj.name_any()),
        None => obj.name_any(),
    }
}
