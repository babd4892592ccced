use std::fmt;

use json_patch::PatchOperation;
use jsonptr::{Pointer, PointerBuf};
use log::debug;
use serde_json::Value;

use crate::admission_review::{AdmissionRequest, AdmissionResponse, PatchType, Status};
use crate::error::Error;
use crate::patch::PatchSet;
use crate::webhook_rule::WebhookRule;

/// State for a single admission request: the request, the patches appended by
/// rule callbacks, and the response being built.
///
/// A context is created per HTTP request and dropped once the response has
/// been written; nothing in it is shared between requests.
#[derive(Debug)]
pub struct AdmissionContext {
    request: AdmissionRequest,
    response: AdmissionResponse,
    patches: PatchSet,
}

impl AdmissionContext {
    pub fn new(request: AdmissionRequest) -> Self {
        Self {
            response: AdmissionResponse::from(&request),
            request,
            patches: PatchSet::new(),
        }
    }

    pub fn request(&self) -> &AdmissionRequest {
        &self.request
    }

    pub fn patches(&self) -> &PatchSet {
        &self.patches
    }

    pub fn patches_mut(&mut self) -> &mut PatchSet {
        &mut self.patches
    }

    pub fn add_patch(&mut self, op: PatchOperation) {
        self.patches.add_patch(op);
    }

    pub fn add(&mut self, path: PointerBuf, value: Value) {
        self.patches.add(path, value);
    }

    pub fn append(&mut self, array_path: &Pointer, value: Value) {
        self.patches.append(array_path, value);
    }

    pub fn is_allowed(&self) -> bool {
        self.response.allowed
    }

    /// Marks the request as denied.
    ///
    /// Denial does not stop the current pass: rules registered after the one
    /// that denied still run, and a later denial replaces the status.
    pub fn deny(&mut self, message: impl Into<String>) {
        self.deny_with_reason("Forbidden", message);
    }

    pub fn deny_with_reason(&mut self, reason: impl Into<String>, message: impl Into<String>) {
        self.response.allowed = false;
        self.response.result = Some(Status {
            status: Some("Failure".to_string()),
            message: Some(message.into()),
            reason: Some(reason.into()),
            details: None,
            code: Some(403),
        });
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.response
            .warnings
            .get_or_insert_with(Vec::new)
            .push(warning.into());
    }

    pub fn add_audit_annotation(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.response
            .audit_annotations
            .get_or_insert_with(Default::default)
            .insert(key.into(), value.into());
    }

    /// Runs the callback of every matching rule, in registration order.
    ///
    /// Each callback is awaited before the next rule is considered, so later
    /// callbacks see the patches appended by earlier ones. The first callback
    /// error aborts the pass.
    pub async fn apply_rules(&mut self, rules: &[WebhookRule]) -> Result<(), Error> {
        for (index, rule) in rules.iter().enumerate() {
            if !rule.matches(&self.request) {
                continue;
            }
            debug!("{} running rule #{}", self.identity(), index);
            rule.invoke(self)
                .await
                .map_err(|source| Error::RuleCallback { index, source })?;
        }
        Ok(())
    }

    /// The response to send back. `patch` and `patchType` are set only when
    /// patches were accumulated. Calling this repeatedly yields the same value.
    pub fn finalize_response(&self) -> Result<AdmissionResponse, Error> {
        let mut response = self.response.clone();
        if !self.patches.is_empty() {
            response.patch = Some(self.patches.to_bytes()?);
            response.patch_type = Some(PatchType::JsonPatch);
        }
        Ok(response)
    }

    /// Log prefix naming the operation and resource under admission.
    pub fn identity(&self) -> RequestIdentity<'_> {
        RequestIdentity(&self.request)
    }
}

/// Renders as `CREATE [core.v1/pods default/my-pod]`.
pub struct RequestIdentity<'a>(&'a AdmissionRequest);

impl fmt::Display for RequestIdentity<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let req = self.0;
        let group = match req.resource.group.as_str() {
            "" => "core",
            group => group,
        };
        write!(
            f,
            "{} [{}.{}/{} {}/{}]",
            req.operation,
            group,
            req.resource.version,
            req.resource.resource,
            req.namespace.as_deref().unwrap_or("-"),
            req.name.as_deref().unwrap_or("-"),
        )
    }
}
