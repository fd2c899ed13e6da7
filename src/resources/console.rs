//! Console extension points: application menu links, CLI downloads and
//! dynamic plugins.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(kind = "ConsoleLink", group = "console.openshift.io", version = "v1")]
#[serde(rename_all = "camelCase")]
pub struct ConsoleLinkSpec {
    pub href: String,
    pub text: String,

    /// ApplicationMenu, HelpMenu, UserMenu or NamespaceDashboard
    pub location: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_menu: Option<ApplicationMenuSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationMenuSpec {
    pub section: String,

    #[serde(default, rename = "imageURL", skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(kind = "ConsoleCLIDownload", group = "console.openshift.io", version = "v1")]
#[serde(rename_all = "camelCase")]
pub struct ConsoleCLIDownloadSpec {
    pub description: String,
    pub display_name: String,
    pub links: Vec<CLIDownloadLink>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct CLIDownloadLink {
    pub href: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(kind = "ConsolePlugin", group = "console.openshift.io", version = "v1")]
#[serde(rename_all = "camelCase")]
pub struct ConsolePluginSpec {
    pub display_name: String,
    pub backend: ConsolePluginBackend,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub i18n: Option<ConsolePluginI18n>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct ConsolePluginBackend {
    /// Only `Service` backends are served
    #[serde(rename = "type")]
    pub type_: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ConsolePluginService>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConsolePluginService {
    pub name: String,
    pub namespace: String,
    pub port: i32,
    pub base_path: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConsolePluginI18n {
    /// Preload, Lazy or empty
    pub load_type: String,
}
