use std::{cmp::Ordering, fmt};

use kube::{Api, Client};
use serde::Serialize;
use tracing::{info, warn};

use crate::{resources::ClusterVersion, Error, Result};

/// API group served by the OpenShift web console
pub const CONSOLE_API_GROUP: &str = "console.openshift.io";
const CONSOLE_API_VERSION: &str = "v1";

/// Name of the singleton `ClusterVersion`
pub const CLUSTER_VERSION_NAME: &str = "version";

/// Read-only facts about the platform, gathered once at startup
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterFacts {
    /// Whether `console.openshift.io/v1` is served
    pub console_api_present: bool,

    /// Desired platform version, empty when unknown
    pub version: String,
}

impl ClusterFacts {
    /// Inspect the cluster.
    ///
    /// Never fails: lookup errors are logged and the affected fact keeps its
    /// default (console absent, unknown version).
    pub async fn inspect(client: &Client) -> Self {
        let console_api_present = match console_api_present(client).await {
            Ok(found) => found,
            Err(e) => {
                warn!("unable to inspect cluster for the console API: {e}");
                false
            }
        };

        let version = match cluster_version(client).await {
            Ok(version) => version,
            Err(e) => {
                warn!("unable to read the cluster version: {e}");
                String::new()
            }
        };

        info!(console_api_present, version = %version, "inspected cluster");
        Self {
            console_api_present,
            version,
        }
    }

    /// Parsed platform version, if it is known and well formed
    pub fn parsed_version(&self) -> Option<OcpVersion> {
        OcpVersion::parse(&self.version)
    }

    /// 4.11 and later, or an unknown version
    ///
    /// Gates the seccomp profile and the haproxy capability handling.
    pub fn is_modern(&self) -> bool {
        is_modern_version(&self.version)
    }

    /// 4.6 clusters keep the backend in the deprecated namespace
    pub fn uses_deprecated_backend_namespace(&self) -> bool {
        self.version.starts_with("4.6")
    }

    /// Whether the platform is at least `start` (major/minor only)
    pub fn supports_dynamic_plugins(&self, start: &str) -> bool {
        match (self.parsed_version(), OcpVersion::parse(start)) {
            (Some(current), Some(start)) => {
                (current.major, current.minor) >= (start.major, start.minor)
            }
            _ => false,
        }
    }
}

/// Whether `version` is empty or newer than any 4.10 release
pub fn is_modern_version(version: &str) -> bool {
    if version.is_empty() {
        return true;
    }

    match OcpVersion::parse(version) {
        Some(v) => v > OcpVersion::new(4, 10, 999),
        // An unparsable version sorts below every valid one
        None => false,
    }
}

async fn console_api_present(client: &Client) -> Result<bool> {
    let groups = client.list_api_groups().await.map_err(Error::KubeError)?;

    Ok(groups.groups.iter().any(|g| {
        g.name == CONSOLE_API_GROUP && g.versions.iter().any(|v| v.version == CONSOLE_API_VERSION)
    }))
}

async fn cluster_version(client: &Client) -> Result<String> {
    let versions = Api::<ClusterVersion>::all(client.clone());
    let version = versions
        .get_opt(CLUSTER_VERSION_NAME)
        .await
        .map_err(Error::KubeError)?;

    Ok(version
        .and_then(|v| v.status)
        .and_then(|s| s.desired)
        .and_then(|d| d.version)
        .unwrap_or_default())
}

/// A `major.minor.patch` platform version with an optional pre-release
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OcpVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub pre: Option<String>,
}

impl OcpVersion {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            pre: None,
        }
    }

    /// Parse `[v]major[.minor[.patch]][-pre][+build]`
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let raw = raw.strip_prefix('v').unwrap_or(raw);
        let raw = raw.split_once('+').map_or(raw, |(v, _)| v);
        let (core, pre) = match raw.split_once('-') {
            Some((core, pre)) if !pre.is_empty() => (core, Some(pre.to_string())),
            Some(_) => return None,
            None => (raw, None),
        };

        let mut parts = core.split('.');
        let mut next = || -> Option<Option<u64>> {
            match parts.next() {
                None => Some(None),
                Some(p) => p.parse().ok().map(Some),
            }
        };

        let major = next()??;
        let minor = next()?.unwrap_or(0);
        let patch = next()?.unwrap_or(0);
        if parts.next().is_some() {
            return None;
        }

        Some(Self {
            major,
            minor,
            patch,
            pre,
        })
    }
}

impl PartialOrd for OcpVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OcpVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (&self.pre, &other.pre) {
                (None, None) => Ordering::Equal,
                // A pre-release sorts before its release
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(a), Some(b)) => a.cmp(b),
            })
    }
}

impl fmt::Display for OcpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.pre {
            write!(f, "-{pre}")?;
        }
        Ok(())
    }
}
