//! Mutating rule that wires an IAM role into pods for AWS web identity federation.
//!
//! Pods annotated with `sts.amazonaws.com/role-arn` get a projected service
//! account token volume, a mount of it in every container, and the environment
//! variables the AWS SDKs read to assume the role with that token.

use std::collections::HashSet;

use anyhow::Context;
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, ObjectFieldSelector, Pod, ProjectedVolumeSource,
    ServiceAccountTokenProjection, Volume, VolumeMount, VolumeProjection,
};
use log::info;
use serde_json::Value;

use crate::admission_context::AdmissionContext;
use crate::admission_review::Operation;
use crate::patch::{pointer, PatchSet};
use crate::webhook_rule::WebhookRule;

pub const ROLE_ARN_ANNOTATION: &str = "sts.amazonaws.com/role-arn";

/// Settings for the injected token and environment.
#[derive(Clone, Debug, PartialEq)]
pub struct IdentityConfig {
    pub aws_region: String,
    pub token_audience: String,
    pub token_lifetime_secs: i64,
    pub mount_point: String,
    pub volume_name: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            aws_region: "us-west-2".to_string(),
            token_audience: "sts.amazonaws.com".to_string(),
            token_lifetime_secs: 86400,
            mount_point: "/var/run/secrets/sts.amazonaws.com/serviceaccount".to_string(),
            volume_name: "aws-sts-token".to_string(),
        }
    }
}

impl IdentityConfig {
    fn volume_mount(&self) -> VolumeMount {
        VolumeMount {
            name: self.volume_name.clone(),
            mount_path: self.mount_point.clone(),
            read_only: Some(true),
            ..Default::default()
        }
    }

    fn volume(&self) -> Volume {
        Volume {
            name: self.volume_name.clone(),
            projected: Some(ProjectedVolumeSource {
                sources: Some(vec![VolumeProjection {
                    service_account_token: Some(ServiceAccountTokenProjection {
                        audience: Some(self.token_audience.clone()),
                        expiration_seconds: Some(self.token_lifetime_secs),
                        path: "token".to_string(),
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn env_vars(&self, role_arn: &str) -> Vec<EnvVar> {
        let literal = |name: &str, value: &str| EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            value_from: None,
        };
        vec![
            literal("AWS_DEFAULT_REGION", &self.aws_region),
            literal("AWS_REGION", &self.aws_region),
            literal("AWS_STS_REGIONAL_ENDPOINTS", "regional"),
            literal("AWS_ROLE_ARN", role_arn),
            literal(
                "AWS_WEB_IDENTITY_TOKEN_FILE",
                &format!("{}/token", self.mount_point),
            ),
            EnvVar {
                name: "AWS_ROLE_SESSION_NAME".to_string(),
                value: None,
                value_from: Some(EnvVarSource {
                    field_ref: Some(ObjectFieldSelector {
                        api_version: None,
                        field_path: "metadata.name".to_string(),
                    }),
                    ..Default::default()
                }),
            },
        ]
    }
}

/// The mutating rule for `CREATE` of core `v1` pods.
pub fn identity_injection_rule(config: IdentityConfig) -> WebhookRule {
    WebhookRule::sync(move |ctx| inject_identity(ctx, &config))
        .operations([Operation::Create])
        .api_groups([""])
        .api_versions(["v1"])
        .resources(["pods"])
}

fn inject_identity(ctx: &mut AdmissionContext, config: &IdentityConfig) -> anyhow::Result<()> {
    let request = ctx.request().typed::<Pod>().context("decoding pod")?;
    let pod = match request.object {
        Some(pod) => pod,
        None => {
            info!("{} No pod in request; skipping", ctx.identity());
            return Ok(());
        }
    };

    let role_arn = pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(ROLE_ARN_ANNOTATION));
    match role_arn {
        Some(role_arn) => {
            info!("{} Discovered role-arn: {}", ctx.identity(), role_arn);
            append_pod_patches(ctx.patches_mut(), &pod, role_arn, config)?;
        }
        None => info!("{} No role-arn annotation found; skipping", ctx.identity()),
    }
    Ok(())
}

/// Appends the patches needed to give `pod` the web identity setup.
///
/// Every addition is skipped when the pod already has an entry of the same
/// name, so running this on its own output adds nothing. Container paths are
/// positional and only appended to, which keeps the indices valid for the
/// whole patch.
pub fn append_pod_patches(
    patches: &mut PatchSet,
    pod: &Pod,
    role_arn: &str,
    config: &IdentityConfig,
) -> anyhow::Result<()> {
    let mount = serde_json::to_value(config.volume_mount())?;
    let envs = config.env_vars(role_arn);

    if let Some(spec) = &pod.spec {
        for (idx, container) in spec.containers.iter().enumerate() {
            let path = ["spec".to_string(), "containers".to_string(), idx.to_string()];
            append_container_patches(patches, container, &path, config, &mount, &envs)?;
        }
        for (idx, container) in spec.init_containers.iter().flatten().enumerate() {
            let path = ["spec".to_string(), "initContainers".to_string(), idx.to_string()];
            append_container_patches(patches, container, &path, config, &mount, &envs)?;
        }
    }

    let has_volume = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.volumes.as_ref())
        .is_some_and(|volumes| volumes.iter().any(|v| v.name == config.volume_name));
    if !has_volume {
        patches.append(
            &pointer(["spec", "volumes"]),
            serde_json::to_value(config.volume())?,
        );
    }
    Ok(())
}

fn append_container_patches(
    patches: &mut PatchSet,
    container: &Container,
    container_path: &[String],
    config: &IdentityConfig,
    mount: &Value,
    envs: &[EnvVar],
) -> anyhow::Result<()> {
    let field = |name: &str| {
        let mut tokens: Vec<&str> = container_path.iter().map(String::as_str).collect();
        tokens.push(name);
        pointer(tokens)
    };

    let has_mount = container
        .volume_mounts
        .iter()
        .flatten()
        .any(|m| m.name == config.volume_name);
    if !has_mount {
        patches.append(&field("volumeMounts"), mount.clone());
    }

    match &container.env {
        Some(existing) => {
            let defined: HashSet<&str> = existing.iter().map(|e| e.name.as_str()).collect();
            for env in envs.iter().filter(|e| !defined.contains(e.name.as_str())) {
                patches.append(&field("env"), serde_json::to_value(env)?);
            }
        }
        // `-` cannot address a missing array, so the whole list goes in at once.
        None => patches.add(field("env"), serde_json::to_value(envs)?),
    }
    Ok(())
}
