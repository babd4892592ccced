use std::net::SocketAddr;
use std::path::PathBuf;

use axum_server::tls_rustls::RustlsConfig;
use env_logger::Env;
use k8s_admission_webhook::identity_injection::{identity_injection_rule, IdentityConfig};
use k8s_admission_webhook::webhook_config::ServerMetadata;
use k8s_admission_webhook::AdmissionServer;
use log::*;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "aws-identity-webhook",
    about = "Mutating admission webhook injecting AWS web identity credentials into pods"
)]
struct Opt {
    /// Port to serve HTTPS on
    #[structopt(long, env = "PORT", default_value = "8443")]
    port: u16,

    /// PEM certificate presented to the API server
    #[structopt(long, env = "TLS_CERT_PATH", default_value = "./aws-identity-webhook.crt")]
    tls_cert_path: PathBuf,

    /// PEM private key for the certificate
    #[structopt(long, env = "TLS_KEY_PATH", default_value = "./aws-identity-webhook.key")]
    tls_key_path: PathBuf,

    /// Region written to AWS_REGION and AWS_DEFAULT_REGION
    #[structopt(long, env = "WEBHOOK_AWS_REGION", default_value = "us-west-2")]
    aws_region: String,

    /// Audience of the projected service account token
    #[structopt(long, default_value = "sts.amazonaws.com")]
    token_audience: String,

    /// Lifetime of the projected service account token
    #[structopt(long, default_value = "86400")]
    token_lifetime_secs: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    info!("Starting aws-identity-webhook");

    let opt = Opt::from_args();

    // Initialize rustls crypto provider
    let provider = rustls::crypto::ring::default_provider();
    if provider.install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    for path in [&opt.tls_cert_path, &opt.tls_key_path] {
        if !path.exists() {
            error!("TLS file does not exist: {}", path.display());
            std::process::exit(1);
        }
    }
    let tls_config = RustlsConfig::from_pem_file(&opt.tls_cert_path, &opt.tls_key_path)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to load TLS configuration: {}", e);
            std::process::exit(1);
        });

    let identity = IdentityConfig {
        aws_region: opt.aws_region,
        token_audience: opt.token_audience,
        token_lifetime_secs: opt.token_lifetime_secs,
        ..Default::default()
    };
    info!("Injecting identities with {:?}", identity);

    let app = AdmissionServer::new(ServerMetadata {
        name: "aws-identity-webhook".to_string(),
        repo: "https://github.com/cloudydeno/kubernetes-aws-identity-webhook".to_string(),
    })
    .with_mutating_rule(identity_injection_rule(identity))
    .router();

    let addr = SocketAddr::from(([0, 0, 0, 0], opt.port));
    info!("Starting TLS server on {}", addr);

    axum_server::bind_rustls(addr, tls_config)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}
