//! Builds the Mutating/ValidatingWebhookConfiguration documents that register
//! this server with a cluster.

use std::collections::BTreeMap;

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, ValidatingWebhook,
    ValidatingWebhookConfiguration, WebhookClientConfig,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::webhook_rule::WebhookRule;

pub const MUTATE_PATH: &str = "/admission/mutate";
pub const VALIDATE_PATH: &str = "/admission/validate";

/// Identifies the deployment in generated manifests.
#[derive(Clone, Debug, PartialEq)]
pub struct ServerMetadata {
    pub name: String,
    pub repo: String,
}

impl ServerMetadata {
    fn object_meta(&self) -> ObjectMeta {
        ObjectMeta {
            name: Some(self.name.clone()),
            labels: Some(BTreeMap::from([("app".to_string(), self.name.clone())])),
            annotations: Some(BTreeMap::from([("repo".to_string(), self.repo.clone())])),
            ..Default::default()
        }
    }
}

impl From<&WebhookRule> for RuleWithOperations {
    fn from(rule: &WebhookRule) -> Self {
        RuleWithOperations {
            api_groups: Some(rule.api_groups.clone()),
            api_versions: Some(rule.api_versions.clone()),
            operations: Some(
                rule.operations
                    .iter()
                    .map(|op| op.as_str().to_string())
                    .collect(),
            ),
            resources: Some(rule.resources.clone()),
            scope: Some(rule.scope.as_str().to_string()),
        }
    }
}

fn client_config(origin: &str, path: &str) -> WebhookClientConfig {
    WebhookClientConfig {
        url: Some(format!("{}{}", origin, path)),
        ..Default::default()
    }
}

pub fn mutating_configuration(
    metadata: &ServerMetadata,
    origin: &str,
    hostname: &str,
    rules: &[WebhookRule],
) -> MutatingWebhookConfiguration {
    MutatingWebhookConfiguration {
        metadata: metadata.object_meta(),
        webhooks: Some(vec![MutatingWebhook {
            admission_review_versions: vec!["v1".to_string()],
            client_config: client_config(origin, MUTATE_PATH),
            failure_policy: Some("Fail".to_string()),
            match_policy: Some("Exact".to_string()),
            name: hostname.to_string(),
            reinvocation_policy: Some("IfNeeded".to_string()),
            rules: Some(rules.iter().map(RuleWithOperations::from).collect()),
            side_effects: "None".to_string(),
            ..Default::default()
        }]),
    }
}

pub fn validating_configuration(
    metadata: &ServerMetadata,
    origin: &str,
    hostname: &str,
    rules: &[WebhookRule],
) -> ValidatingWebhookConfiguration {
    ValidatingWebhookConfiguration {
        metadata: metadata.object_meta(),
        webhooks: Some(vec![ValidatingWebhook {
            admission_review_versions: vec!["v1".to_string()],
            client_config: client_config(origin, VALIDATE_PATH),
            failure_policy: Some("Fail".to_string()),
            match_policy: Some("Exact".to_string()),
            name: hostname.to_string(),
            rules: Some(rules.iter().map(RuleWithOperations::from).collect()),
            side_effects: "None".to_string(),
            ..Default::default()
        }]),
    }
}

/// Renders one `---` document per non-empty rule list. The documents are
/// JSON, which `kubectl apply` accepts as YAML.
pub fn build_config_manifest(
    metadata: &ServerMetadata,
    origin: &str,
    hostname: &str,
    mutating_rules: &[WebhookRule],
    validating_rules: &[WebhookRule],
) -> Result<String, serde_json::Error> {
    let mut blocks = Vec::new();
    if !mutating_rules.is_empty() {
        let config = mutating_configuration(metadata, origin, hostname, mutating_rules);
        blocks.push(format!("---\n{}\n", serde_json::to_string_pretty(&config)?));
    }
    if !validating_rules.is_empty() {
        let config = validating_configuration(metadata, origin, hostname, validating_rules);
        blocks.push(format!("---\n{}\n", serde_json::to_string_pretty(&config)?));
    }
    Ok(blocks.join("\n\n"))
}
