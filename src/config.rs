use std::env;

use serde::Serialize;

use crate::{Error, Result};

pub const BACKEND_IMAGE_ENV: &str = "BACKEND_IMAGE";
pub const KAM_IMAGE_ENV: &str = "KAM_IMAGE";
pub const PLUGIN_IMAGE_ENV: &str = "GITOPS_CONSOLE_PLUGIN_IMAGE";
pub const DISABLE_DEFAULT_INSTANCE_ENV: &str = "DISABLE_DEFAULT_ARGOCD_INSTANCE";
pub const DISABLE_CONSOLE_LINK_ENV: &str = "DISABLE_DEFAULT_ARGOCD_CONSOLELINK";
pub const ENABLE_CONVERSION_WEBHOOK_ENV: &str = "ENABLE_CONVERSION_WEBHOOK";
pub const CLUSTER_CONFIG_NAMESPACES_ENV: &str = "ARGOCD_CLUSTER_CONFIG_NAMESPACES";
pub const ROLLOUTS_IMAGE_ENV: &str = "ARGO_ROLLOUTS_IMAGE";
pub const ROUTE_PLUGIN_LOCATION_ENV: &str = "OPENSHIFT_ROUTE_PLUGIN_LOCATION";
pub const DYNAMIC_PLUGIN_START_VERSION_ENV: &str = "DYNAMIC_PLUGIN_START_OCP_VERSION";
pub const RESOURCE_QUOTA_ENV: &str = "ENABLE_DEFAULT_ARGOCD_RESOURCE_QUOTA";
pub const IMAGE_PULL_POLICY_ENV: &str = "IMAGE_PULL_POLICY";
pub const LABEL_SELECTOR_ENV: &str = "ARGOCD_LABEL_SELECTOR";

pub const DEFAULT_BACKEND_IMAGE: &str = "quay.io/redhat-developer/gitops-backend:v0.0.1";
pub const DEFAULT_KAM_IMAGE: &str = "quay.io/redhat-developer/kam:v0.0.19";
pub const DEFAULT_CONSOLE_IMAGE: &str = "quay.io/redhat-developer/gitops-console-plugin";
pub const DEFAULT_CONSOLE_VERSION: &str = "v0.1.0";
pub const DEFAULT_DYNAMIC_PLUGIN_START_VERSION: &str = "4.15.0";

const RHEL_ROLLOUTS_IMAGE_PREFIX: &str = "registry.redhat.io/openshift-gitops";
const RHEL_ROUTE_PLUGIN_LOCATION: &str =
    "file:/plugins/rollouts-trafficrouter-openshift/openshift-route-plugin";
const UPSTREAM_ROUTE_PLUGIN_LOCATION: &str = "https://github.com/argoproj-labs/rollouts-plugin-trafficrouter-openshift/releases/download/commit-8d0b3c6c5c18341f9f019cf1015b56b0d0c6085b/rollouts-plugin-trafficrouter-openshift-linux-amd64";

/// Operator configuration, snapshotted from the environment once at startup.
///
/// Reconcilers only ever see this value through their context, which keeps
/// them free of ambient process state.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub backend_image: String,
    pub kam_image: String,
    pub plugin_image: String,

    /// Tear down (and never create) the default engine instance
    pub disable_default_instance: bool,

    /// Tear down (and never create) the console link
    pub disable_console_link: bool,

    /// Whether the engine's conversion webhook should be served
    pub enable_conversion_webhook: bool,

    /// Namespaces whose engine may manage cluster-scoped resources
    pub cluster_config_namespaces: Vec<String>,

    /// Location of the rollouts OpenShift route traffic plugin
    pub route_plugin_location: String,

    /// First platform version supporting dynamic console plugins
    pub dynamic_plugin_start_version: String,

    /// Create the legacy compute quota in the engine namespace
    pub manage_resource_quota: bool,

    /// Fallback pull policy for the console plugin
    pub image_pull_policy: Option<String>,

    /// Proxy variables forwarded to the console plugin container
    #[serde(skip)]
    pub proxy_env: Vec<(String, String)>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend_image: DEFAULT_BACKEND_IMAGE.into(),
            kam_image: DEFAULT_KAM_IMAGE.into(),
            plugin_image: format!("{DEFAULT_CONSOLE_IMAGE}:{DEFAULT_CONSOLE_VERSION}"),
            disable_default_instance: false,
            disable_console_link: false,
            enable_conversion_webhook: false,
            cluster_config_namespaces: Vec::new(),
            route_plugin_location: UPSTREAM_ROUTE_PLUGIN_LOCATION.into(),
            dynamic_plugin_start_version: DEFAULT_DYNAMIC_PLUGIN_START_VERSION.into(),
            manage_resource_quota: false,
            image_pull_policy: None,
            proxy_env: Vec::new(),
        }
    }
}

impl Settings {
    /// Resolve the settings from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Resolve the settings through an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let defaults = Self::default();

        Self {
            backend_image: non_empty(BACKEND_IMAGE_ENV).unwrap_or(defaults.backend_image),
            kam_image: non_empty(KAM_IMAGE_ENV).unwrap_or(defaults.kam_image),
            plugin_image: non_empty(PLUGIN_IMAGE_ENV).unwrap_or(defaults.plugin_image),
            disable_default_instance: truthy(lookup(DISABLE_DEFAULT_INSTANCE_ENV)),
            disable_console_link: truthy(lookup(DISABLE_CONSOLE_LINK_ENV)),
            enable_conversion_webhook: truthy(lookup(ENABLE_CONVERSION_WEBHOOK_ENV)),
            cluster_config_namespaces: split_list(
                &lookup(CLUSTER_CONFIG_NAMESPACES_ENV).unwrap_or_default(),
            ),
            route_plugin_location: route_plugin_location(
                non_empty(ROUTE_PLUGIN_LOCATION_ENV),
                non_empty(ROLLOUTS_IMAGE_ENV),
            ),
            dynamic_plugin_start_version: non_empty(DYNAMIC_PLUGIN_START_VERSION_ENV)
                .unwrap_or(defaults.dynamic_plugin_start_version),
            manage_resource_quota: truthy(lookup(RESOURCE_QUOTA_ENV)),
            image_pull_policy: non_empty(IMAGE_PULL_POLICY_ENV),
            proxy_env: ["HTTP_PROXY", "HTTPS_PROXY", "NO_PROXY"]
                .into_iter()
                .filter_map(|key| {
                    let lower = key.to_lowercase();
                    non_empty(key)
                        .map(|v| (key.to_string(), v))
                        .or_else(|| non_empty(&lower).map(|v| (lower, v)))
                })
                .collect(),
        }
    }
}

/// A toggle is set when its lower-cased value is exactly `true`
pub fn truthy(value: Option<String>) -> bool {
    value.is_some_and(|v| v.to_lowercase() == "true")
}

/// Split a comma separated list, trimming every entry
pub fn split_list(value: &str) -> Vec<String> {
    if value.trim().is_empty() {
        return Vec::new();
    }

    value.split(',').map(|s| s.trim().to_string()).collect()
}

/// Where the rollouts controller should load the OpenShift route plugin from.
///
/// An explicit override wins. Productised rollouts images ship the plugin on
/// disk; everything else downloads the upstream release.
pub fn route_plugin_location(overridden: Option<String>, rollouts_image: Option<String>) -> String {
    if let Some(location) = overridden {
        return location;
    }

    match rollouts_image {
        Some(image) if image.starts_with(RHEL_ROLLOUTS_IMAGE_PREFIX) => {
            RHEL_ROUTE_PLUGIN_LOCATION.into()
        }
        _ => UPSTREAM_ROUTE_PLUGIN_LOCATION.into(),
    }
}

/// Check a label selector for syntactic validity.
///
/// Accepts equality (`a=b`, `a==b`, `a!=b`), existence (`a`, `!a`) and set
/// (`a in (x,y)`, `a notin (x)`) requirements separated by commas.
pub fn validate_label_selector(selector: &str) -> Result<()> {
    let invalid = |why: &str| Error::InvalidConfig(format!("label selector {selector:?}: {why}"));

    let mut depth = 0usize;
    let mut start = 0usize;
    let mut requirements = Vec::new();
    for (i, c) in selector.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.checked_sub(1).ok_or_else(|| invalid("unbalanced parenthesis"))?,
            ',' if depth == 0 => {
                requirements.push(&selector[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(invalid("unbalanced parenthesis"));
    }
    requirements.push(&selector[start..]);

    if selector.trim().is_empty() {
        return Ok(());
    }

    for requirement in requirements.into_iter().map(str::trim) {
        if requirement.is_empty() {
            return Err(invalid("empty requirement"));
        }

        let key = if let Some((key, values)) = split_set_requirement(requirement) {
            let values = values
                .trim()
                .strip_prefix('(')
                .and_then(|v| v.strip_suffix(')'))
                .ok_or_else(|| invalid("set values must be parenthesised"))?;
            if values.split(',').any(|v| !is_label_value(v.trim())) {
                return Err(invalid("invalid set value"));
            }
            key
        } else if let Some((key, value)) = requirement
            .split_once("!=")
            .or_else(|| requirement.split_once("=="))
            .or_else(|| requirement.split_once('='))
        {
            if !is_label_value(value.trim()) {
                return Err(invalid("invalid value"));
            }
            key
        } else {
            requirement.strip_prefix('!').unwrap_or(requirement)
        };

        if !is_label_key(key.trim()) {
            return Err(invalid("invalid key"));
        }
    }

    Ok(())
}

fn split_set_requirement(requirement: &str) -> Option<(&str, &str)> {
    for op in [" notin ", " in "] {
        if let Some(idx) = requirement.find(op) {
            return Some((&requirement[..idx], &requirement[idx + op.len()..]));
        }
    }
    None
}

fn is_label_key(key: &str) -> bool {
    let name = match key.rsplit_once('/') {
        Some((prefix, name)) => {
            if prefix.is_empty() || prefix.len() > 253 {
                return false;
            }
            name
        }
        None => key,
    };
    !name.is_empty() && name.len() <= 63 && is_label_value(name)
}

fn is_label_value(value: &str) -> bool {
    let bytes = value.as_bytes();
    value.len() <= 63
        && bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
        && bytes.first().map_or(true, |b| b.is_ascii_alphanumeric())
        && bytes.last().map_or(true, |b| b.is_ascii_alphanumeric())
}
