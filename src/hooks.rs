use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::{
    apps::v1::{Deployment, StatefulSet},
    core::v1::Secret,
    rbac::v1::{ClusterRole, Role},
};
use kube::{runtime::Controller, Client, ResourceExt};

use crate::{resources::ArgoCD, Error, Result};

mod openshift;

pub use openshift::{AdminRoleWatch, OpenShiftHook, ADMIN_CLUSTER_ROLE};

/// An object the engine operator is about to apply
///
/// Only the kinds the hooks know how to adjust have a variant, anything else
/// passes through as `Other`.
#[derive(Debug)]
pub enum Draft<'a> {
    ClusterRole(&'a mut ClusterRole),
    Role(&'a mut Role),
    Deployment(&'a mut Deployment),
    StatefulSet(&'a mut StatefulSet),
    Secret(&'a mut Secret),
    Other,
}

impl Draft<'_> {
    /// Borrow the draft again for the next hook in line
    pub fn reborrow(&mut self) -> Draft<'_> {
        match self {
            Draft::ClusterRole(o) => Draft::ClusterRole(&mut **o),
            Draft::Role(o) => Draft::Role(&mut **o),
            Draft::Deployment(o) => Draft::Deployment(&mut **o),
            Draft::StatefulSet(o) => Draft::StatefulSet(&mut **o),
            Draft::Secret(o) => Draft::Secret(&mut **o),
            Draft::Other => Draft::Other,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Draft::ClusterRole(o) => o.name_any(),
            Draft::Role(o) => o.name_any(),
            Draft::Deployment(o) => o.name_any(),
            Draft::StatefulSet(o) => o.name_any(),
            Draft::Secret(o) => o.name_any(),
            Draft::Other => String::new(),
        }
    }
}

/// Adjusts objects produced for an engine instance before they are applied
#[async_trait]
pub trait ResourceHook: Send + Sync {
    /// `hint` carries the platform version
    async fn mutate(&self, engine: &ArgoCD, draft: Draft<'_>, hint: &str) -> Result<()>;
}

/// Adds watches to the engine operator's controller
pub trait BuilderHook: Send + Sync {
    fn extend(&self, controller: Controller<ArgoCD>, client: Client) -> Controller<ArgoCD>;
}

/// Hooks handed to the engine operator.
///
/// Filled in before any controller starts and only read afterwards.
#[derive(Clone, Default)]
pub struct HookRegistry {
    mutations: Vec<Arc<dyn ResourceHook>>,
    builders: Vec<Arc<dyn BuilderHook>>,
}

impl HookRegistry {
    pub fn register(&mut self, hook: Arc<dyn ResourceHook>) -> &mut Self {
        self.mutations.push(hook);
        self
    }

    pub fn register_builder(&mut self, hook: Arc<dyn BuilderHook>) -> &mut Self {
        self.builders.push(hook);
        self
    }

    /// The registry used on OpenShift
    pub fn openshift(client: Client, cluster_config_namespaces: Vec<String>) -> Self {
        let mut registry = Self::default();
        registry
            .register(Arc::new(OpenShiftHook::new(client, cluster_config_namespaces)))
            .register_builder(Arc::new(AdminRoleWatch));
        registry
    }

    pub fn len(&self) -> usize {
        self.mutations.len() + self.builders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every mutation hook over `draft` in registration order
    pub async fn apply(&self, engine: &ArgoCD, mut draft: Draft<'_>, hint: &str) -> Result<()> {
        let name = draft.name();
        for hook in &self.mutations {
            hook.mutate(engine, draft.reborrow(), hint)
                .await
                .map_err(|e| Error::HookError(name.clone(), Box::new(e)))?;
        }

        Ok(())
    }

    /// Pass the engine operator's controller through every builder hook
    pub fn extend(&self, controller: Controller<ArgoCD>, client: Client) -> Controller<ArgoCD> {
        self.builders
            .iter()
            .fold(controller, |controller, hook| hook.extend(controller, client.clone()))
    }
}
