//! Keeps the console's application menu entry pointing at the default
//! engine's server route.

use std::{sync::Arc, time::Duration};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::{Stream, StreamExt};
use kube::{
    runtime::{watcher, WatchStreamExt},
    Api, ResourceExt,
};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    resources::{labels, ApplicationMenuSpec, ConsoleLink, ConsoleLinkSpec, Route},
    Result, ENGINE_NAMESPACE,
};

use super::{ensure, ensure_absent, sync, Context};

pub const CONTROLLER: &str = "consolelink";

pub const CONSOLE_LINK_NAME: &str = "argocd";

/// Route exposing the default engine's server
pub const ENGINE_ROUTE_NAME: &str = "openshift-gitops-server";

const LINK_TEXT: &str = "Cluster Argo CD";
const LINK_SECTION: &str = "OpenShift GitOps";

/// Attempts per route event before waiting for the next one
const RETRIES: u32 = 5;
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

lazy_static::lazy_static! {
    static ref ICON_URL: String = format!(
        "data:image/png;base64,{}",
        STANDARD.encode(include_bytes!("../../assets/argo.png"))
    );
}

/// The link the console should show for a route served at `host`
pub fn console_link(host: &str) -> ConsoleLink {
    let mut link = ConsoleLink::new(
        CONSOLE_LINK_NAME,
        ConsoleLinkSpec {
            href: format!("https://{host}"),
            text: LINK_TEXT.into(),
            location: "ApplicationMenu".into(),
            application_menu: Some(ApplicationMenuSpec {
                section: LINK_SECTION.into(),
                image_url: Some(ICON_URL.clone()),
            }),
        },
    );
    link.metadata.labels = Some(labels!(managed));
    link
}

/// Converge the console link on the route's current state.
///
/// `None` means the route is gone, which removes the link.
pub async fn reconcile(context: &Context, route: Option<&Route>) -> Result<()> {
    if !context.facts.console_api_present {
        return Ok(());
    }

    let links = Api::<ConsoleLink>::all(context.client.clone());
    let Some(route) = route else {
        if ensure_absent(&links, CONSOLE_LINK_NAME).await? {
            info!("Engine route is gone, removed console link {CONSOLE_LINK_NAME}");
        }
        return Ok(());
    };

    if route.host().is_empty() {
        debug!("Engine route has no host yet");
        return Ok(());
    }

    if context.settings.disable_console_link {
        ensure_absent(&links, CONSOLE_LINK_NAME).await?;
        return Ok(());
    }

    ensure(&links, &console_link(route.host()), |current, desired| {
        sync(&mut current.spec.href, &desired.spec.href)
    })
    .await?;

    Ok(())
}

/// Reconcile, retrying failed passes with a doubling pause
#[instrument(skip(context, route))]
async fn reconcile_with_retries(
    context: &Context,
    route: Option<&Route>,
    backoff: Duration,
) -> Result<()> {
    let mut attempt = 0;
    loop {
        let _timer = context.metrics.count_and_measure(CONTROLLER);
        match reconcile(context, route).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt + 1 < RETRIES => {
                context.metrics.reconcile_failure(CONTROLLER, &e);
                let pause = backoff * 2u32.pow(attempt);
                warn!("Console link reconcile failed, retrying in {pause:?}: {e}");
                tokio::time::sleep(pause).await;
                attempt += 1;
            }
            Err(e) => {
                context.metrics.reconcile_failure(CONTROLLER, &e);
                return Err(e);
            }
        }
    }
}

/// Handle route events until the stream ends.
///
/// A route version is remembered only once its pass succeeded, so a failed
/// version is tried again when it shows up next.
async fn follow<S>(context: &Context, mut events: S, backoff: Duration)
where
    S: Stream<Item = Result<watcher::Event<Route>, watcher::Error>> + Unpin,
{
    let mut handled: Option<String> = None;
    while let Some(event) = events.next().await {
        let route = match event {
            Ok(watcher::Event::Applied(route)) => Some(route),
            Ok(watcher::Event::Deleted(_)) => None,
            Ok(watcher::Event::Restarted(routes)) => routes.into_iter().next(),
            Err(e) => {
                warn!("Engine route watch failed: {e}");
                continue;
            }
        };

        // Status only churn of an already handled version
        let version = route.as_ref().and_then(|r| r.resource_version());
        if version.is_some() && version == handled {
            continue;
        }

        context.diagnostics.write().await.last_event = chrono::Utc::now();
        match reconcile_with_retries(context, route.as_ref(), backoff).await {
            Ok(()) => handled = version,
            Err(e) => error!("Giving up on console link until the route changes: {e}"),
        }
    }
}

/// Watch the engine route and keep the console link in step with it
pub async fn run(context: Arc<Context>) {
    let routes = Api::<Route>::namespaced(context.client.clone(), ENGINE_NAMESPACE);
    let config = watcher::Config::default().fields(&format!("metadata.name={ENGINE_ROUTE_NAME}"));
    let events = watcher(routes, config).default_backoff().boxed();

    follow(&context, events, RETRY_BACKOFF).await;
}
