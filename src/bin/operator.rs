use std::{future::IntoFuture as _, net::SocketAddr};

use anyhow::Context as _;
use clap::Parser;
use gitops_operator::{
    cluster::ClusterFacts,
    config::{self, Settings},
    hooks::HookRegistry,
    leader::{LeaderElector, LeaseConfig},
    operator::{GitopsController, State},
    telemetry,
};
use kube::Client;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser, Debug)]
#[command(version, about = "Reconciles the OpenShift GitOps service")]
struct Args {
    /// The address the metric endpoint binds to
    #[arg(long, default_value = ":8080")]
    metrics_bind_address: String,

    /// The address the probe endpoint binds to
    #[arg(long, default_value = ":8081")]
    health_probe_bind_address: String,

    /// Ensure only one active replica through a lease
    #[arg(long)]
    leader_elect: bool,

    /// Reported only, the servers speak HTTP/1
    #[arg(long)]
    enable_http2: bool,

    /// Restricts the engine instances that get monitoring
    #[arg(long, env = config::LABEL_SELECTOR_ENV, default_value = "")]
    label_selector: String,
}

/// `:8080` style addresses listen on every interface
fn bind_address(address: &str) -> anyhow::Result<SocketAddr> {
    let address = match address.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => address.to_string(),
    };
    address
        .parse()
        .with_context(|| format!("invalid bind address {address:?}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    telemetry::init().await?;

    config::validate_label_selector(&args.label_selector)?;
    let settings = Settings::from_env();

    let client = Client::try_default()
        .await
        .context("failed to create kube Client")?;
    let facts = ClusterFacts::inspect(&client).await;

    // Hooks are complete before anything can read them
    let hooks = HookRegistry::openshift(client.clone(), settings.cluster_config_namespaces.clone());
    let state = State::new(hooks, args.enable_http2)?;
    let controller = GitopsController::new(state.clone());

    // Start web servers
    let metrics_listener = TcpListener::bind(bind_address(&args.metrics_bind_address)?).await?;
    let metrics_server = axum::serve(metrics_listener, handlers::router().with_state(state.clone()));
    let probe_listener = TcpListener::bind(bind_address(&args.health_probe_bind_address)?).await?;
    let probe_server = axum::serve(probe_listener, handlers::probes());

    let elector = args.leader_elect.then(|| {
        LeaderElector::new(client.clone(), LeaseConfig::from_env(), state.metrics_handle())
    });
    let label_selector = args.label_selector.clone();
    let leading = async {
        let Some(elector) = &elector else {
            return controller.run(client, facts, settings, label_selector).await;
        };

        elector.acquire().await;
        tokio::select! {
            c = controller.run(client, facts, settings, label_selector) => {
                elector.step_down().await;
                c
            },
            _ = elector.hold() => Err(anyhow::anyhow!("leadership lost")),
        }
    };

    // Run the servers and the controllers, throwing a panic if a server finishes early
    tokio::select! {
        c = leading => {
            info!("controllers stopped");
            c
        },
        s = metrics_server.into_future() => {
            panic!("metrics server exited early: {}", s.unwrap_err())
        },
        s = probe_server.into_future() => {
            panic!("probe server exited early: {}", s.unwrap_err())
        }
    }
}

/// Handlers for the web server portion of the operator
mod handlers {
    use axum::{extract::State, http::StatusCode, response::IntoResponse, routing, Json, Router};
    use prometheus::{Encoder, TextEncoder};

    use gitops_operator::operator::State as OperatorState;

    /// Construct the router for the metrics address
    pub fn router() -> Router<OperatorState> {
        Router::new()
            .route("/metrics", routing::get(metrics))
            .route("/", routing::get(index))
    }

    /// Construct the router for the probe address
    pub fn probes() -> Router {
        Router::new()
            .route("/healthz", routing::get(health))
            .route("/readyz", routing::get(health))
    }

    /// Handler for exposing prometheus metrics
    async fn metrics(State(state): State<OperatorState>) -> impl IntoResponse {
        let metrics = state.metrics();
        let encoder = TextEncoder::new();
        let mut buffer = vec![];
        match encoder.encode(&metrics, &mut buffer) {
            Ok(()) => (StatusCode::OK, buffer),
            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string().into_bytes()),
        }
    }

    /// Handler for checking the health of the server
    async fn health() -> impl IntoResponse {
        (StatusCode::OK, Json("healthy"))
    }

    /// Handler for interacting with the operator
    async fn index(State(state): State<OperatorState>) -> impl IntoResponse {
        let diagnostics = state.diagnostics().await;

        (StatusCode::OK, Json(diagnostics))
    }
}
