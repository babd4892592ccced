use std::fmt;
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};

use crate::admission_context::AdmissionContext;
use crate::admission_review::{AdmissionRequest, Operation};

/// Resources entry matching every resource of the listed groups and versions.
pub const ALL_RESOURCES: &str = "*";

/// Callback invoked with the per-request context when a rule matches.
pub type RuleCallback = Arc<
    dyn for<'a> Fn(&'a mut AdmissionContext) -> BoxFuture<'a, anyhow::Result<()>> + Send + Sync,
>;

/// Which resources a rule registers for. Only used for the webhook manifest;
/// the request itself carries the authoritative namespace.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scope {
    #[default]
    #[serde(rename = "*")]
    All,
    Cluster,
    Namespaced,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::All => "*",
            Scope::Cluster => "Cluster",
            Scope::Namespaced => "Namespaced",
        }
    }
}

/// A statically registered rule: a request filter plus the callback run on a match.
#[derive(Clone)]
pub struct WebhookRule {
    pub operations: Vec<Operation>,
    pub api_groups: Vec<String>,
    pub api_versions: Vec<String>,
    pub resources: Vec<String>,
    pub scope: Scope,
    callback: RuleCallback,
}

impl WebhookRule {
    /// Creates a rule with an asynchronous callback. The filter lists start
    /// empty, so the rule matches nothing until they are filled in.
    pub fn new<F>(callback: F) -> Self
    where
        F: for<'a> Fn(&'a mut AdmissionContext) -> BoxFuture<'a, anyhow::Result<()>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            operations: Vec::new(),
            api_groups: Vec::new(),
            api_versions: Vec::new(),
            resources: Vec::new(),
            scope: Scope::All,
            callback: Arc::new(callback),
        }
    }

    /// Creates a rule whose callback never suspends.
    pub fn sync<F>(callback: F) -> Self
    where
        F: Fn(&mut AdmissionContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::new(move |ctx| future::ready(callback(ctx)).boxed())
    }

    pub fn operations<I: IntoIterator<Item = Operation>>(mut self, operations: I) -> Self {
        self.operations = operations.into_iter().collect();
        self
    }

    /// `""` is the core API group.
    pub fn api_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.api_groups = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn api_versions<I, S>(mut self, versions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.api_versions = versions.into_iter().map(Into::into).collect();
        self
    }

    pub fn resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resources = resources.into_iter().map(Into::into).collect();
        self
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    /// Whether this rule applies to `request`.
    ///
    /// Every list is an exact-match set. The only wildcard is a `"*"` entry in
    /// `resources`; `""` in `api_groups` means the core group and nothing else.
    pub fn matches<T>(&self, request: &AdmissionRequest<T>) -> bool {
        let resource = &request.resource;
        self.operations.contains(&request.operation)
            && self.api_groups.iter().any(|g| *g == resource.group)
            && self.api_versions.iter().any(|v| *v == resource.version)
            && self
                .resources
                .iter()
                .any(|r| r == ALL_RESOURCES || *r == resource.resource)
    }

    pub(crate) fn invoke<'a>(
        &self,
        ctx: &'a mut AdmissionContext,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        (self.callback)(ctx)
    }
}

impl fmt::Debug for WebhookRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookRule")
            .field("operations", &self.operations)
            .field("api_groups", &self.api_groups)
            .field("api_versions", &self.api_versions)
            .field("resources", &self.resources)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}
