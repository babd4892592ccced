use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Host, State};
use axum::http::header::{CONTENT_TYPE, SERVER};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use log::*;

use crate::admission_context::AdmissionContext;
use crate::admission_review::{self, AdmissionReview};
use crate::error::Error;
use crate::webhook_config::{build_config_manifest, ServerMetadata, MUTATE_PATH, VALIDATE_PATH};
use crate::webhook_rule::WebhookRule;

pub const SERVER_HEADER: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Raw request bodies are logged in pieces of at most this many characters.
const INPUT_CHUNK_CHARS: usize = 2000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookKind {
    Mutate,
    Validate,
}

/// Serves the mutating and validating endpoints for a fixed set of rules.
#[derive(Clone, Debug)]
pub struct AdmissionServer {
    metadata: ServerMetadata,
    mutating_rules: Vec<WebhookRule>,
    validating_rules: Vec<WebhookRule>,
}

impl AdmissionServer {
    pub fn new(metadata: ServerMetadata) -> Self {
        Self {
            metadata,
            mutating_rules: Vec::new(),
            validating_rules: Vec::new(),
        }
    }

    pub fn with_mutating_rule(mut self, rule: WebhookRule) -> Self {
        self.mutating_rules.push(rule);
        self
    }

    pub fn with_validating_rule(mut self, rule: WebhookRule) -> Self {
        self.validating_rules.push(rule);
        self
    }

    pub fn router(self) -> Router {
        Router::new()
            .route("/", get(banner))
            .route("/healthz", get(|| async { "ok" }))
            .route("/webhook-config.yaml", get(webhook_config))
            .route(MUTATE_PATH, any(mutate))
            .route(VALIDATE_PATH, any(validate))
            .fallback(|| async { (StatusCode::NOT_FOUND, "Not Found") })
            .layer(middleware::map_response(set_server_header))
            .with_state(Arc::new(self))
    }

    /// Handles one webhook call, turning every failure into a plain-text response.
    pub async fn handle(
        &self,
        kind: HookKind,
        method: &Method,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Response {
        if method != Method::POST {
            return (
                StatusCode::METHOD_NOT_ALLOWED,
                "Method Not Allowed. This is a webhook endpoint.",
            )
                .into_response();
        }
        if !is_json(headers) {
            return (
                StatusCode::BAD_REQUEST,
                "Please provide 'content-type: application/json' header",
            )
                .into_response();
        }

        match self.review(kind, body).await {
            Ok(bytes) => ([(CONTENT_TYPE, "application/json")], bytes).into_response(),
            Err(err) => {
                if err.status_code().is_server_error() {
                    error!("!!! {}", err);
                } else {
                    warn!("Rejected admission review: {}", err);
                }
                err.into_response()
            }
        }
    }

    /// Decodes a review, runs the rules for `kind` and encodes the response review.
    pub async fn review(&self, kind: HookKind, body: &[u8]) -> Result<Vec<u8>, Error> {
        log_input(body);

        let review = admission_review::decode(body)?;
        let request = review.request.ok_or(Error::MissingRequest)?;
        let mut ctx = AdmissionContext::new(request);

        match kind {
            HookKind::Mutate => {
                ctx.apply_rules(&self.mutating_rules).await?;
                info!("{} Generated {} patches.", ctx.identity(), ctx.patches().len());
                for patch in ctx.patches().iter() {
                    debug!("{} - {}", ctx.identity(), serde_json::to_string(patch)?);
                }
            }
            HookKind::Validate => {
                ctx.apply_rules(&self.validating_rules).await?;
                info!("{} Allowed: {}", ctx.identity(), ctx.is_allowed());
            }
        }

        let response = ctx.finalize_response()?;
        admission_review::encode(&AdmissionReview::from_response(response))
    }

    pub fn config_manifest(&self, origin: &str, hostname: &str) -> Result<String, Error> {
        Ok(build_config_manifest(
            &self.metadata,
            origin,
            hostname,
            &self.mutating_rules,
            &self.validating_rules,
        )?)
    }
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .is_some_and(|media_type| media_type.trim().eq_ignore_ascii_case("application/json"))
}

fn log_input(body: &[u8]) {
    if !log_enabled!(Level::Debug) {
        return;
    }
    let text = String::from_utf8_lossy(body);
    let chars: Vec<char> = text.chars().collect();
    for chunk in chars.chunks(INPUT_CHUNK_CHARS) {
        debug!("Input chunk: {}", chunk.iter().collect::<String>());
    }
}

/// `https://<host>` and the bare host name. `host` comes from the Host header
/// or, for HTTP/2, the `:authority` of the request URI.
fn origin_and_hostname(host: &str) -> (String, String) {
    let hostname = host.split(':').next().unwrap_or(host);
    (format!("https://{}", host), hostname.to_string())
}

async fn mutate(
    State(server): State<Arc<AdmissionServer>>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    server.handle(HookKind::Mutate, &method, &headers, &body).await
}

async fn validate(
    State(server): State<Arc<AdmissionServer>>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    server.handle(HookKind::Validate, &method, &headers, &body).await
}

async fn banner(State(server): State<Arc<AdmissionServer>>, host: Option<Host>) -> String {
    let origin = host
        .map(|Host(host)| origin_and_hostname(&host).0)
        .unwrap_or_else(|| "https://<this-host>".to_string());
    format!(
        "This is a webhook server specifically for Kubernetes AdmissionReview purposes.\n\n\
         $ kubectl apply -f \"{}/webhook-config.yaml\"\n\n\
         See also: {}\n",
        origin, server.metadata.repo
    )
}

async fn webhook_config(
    State(server): State<Arc<AdmissionServer>>,
    Host(host): Host,
) -> Response {
    let (origin, hostname) = origin_and_hostname(&host);
    match server.config_manifest(&origin, &hostname) {
        Ok(manifest) => manifest.into_response(),
        Err(err) => {
            error!("Failed to render webhook configuration: {}", err);
            err.into_response()
        }
    }
}

async fn set_server_header(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(SERVER, HeaderValue::from_static(SERVER_HEADER));
    response
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::admission_review::Operation;
    use axum::body::Body;
    use axum::http::header::HOST;
    use axum::http::Request;
    use tower::ServiceExt;
    use crate::identity_injection::{identity_injection_rule, IdentityConfig};
    use serde_json::{json, Value};

    fn server() -> AdmissionServer {
        AdmissionServer::new(ServerMetadata {
            name: "aws-identity-webhook".to_string(),
            repo: "https://example.com/aws-identity-webhook".to_string(),
        })
    }

    fn json_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers
    }

    fn pod_review(uid: Option<&str>) -> Vec<u8> {
        let mut request = json!({
            "kind": {"group": "", "version": "v1", "kind": "Pod"},
            "resource": {"group": "", "version": "v1", "resource": "pods"},
            "namespace": "default",
            "name": "web",
            "operation": "CREATE",
            "userInfo": {"username": "system:serviceaccount:kube-system:replicaset-controller"},
            "object": {
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {
                    "name": "web",
                    "annotations": {"sts.amazonaws.com/role-arn": "arn:aws:iam::123:role/x"},
                },
                "spec": {"containers": [{"name": "app", "image": "nginx"}]},
            },
        });
        if let Some(uid) = uid {
            request["uid"] = json!(uid);
        }
        serde_json::to_vec(&json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": request,
        }))
        .unwrap()
    }

    async fn body_of(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    fn counting_rule(counter: Arc<AtomicUsize>) -> WebhookRule {
        WebhookRule::sync(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .operations([Operation::Create])
        .api_groups([""])
        .api_versions(["v1"])
        .resources(["pods"])
    }

    #[tokio::test]
    async fn test_mutate_returns_patch() {
        let server = server().with_mutating_rule(identity_injection_rule(IdentityConfig::default()));
        let response = server
            .handle(HookKind::Mutate, &Method::POST, &json_headers(), &pod_review(Some("uid-1")))
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let review = admission_review::decode(&body_of(response).await).unwrap();
        assert!(review.request.is_none());
        let response = review.response.unwrap();
        assert_eq!(response.uid, "uid-1");
        assert!(response.allowed);
        assert_eq!(
            response.patch_type,
            Some(admission_review::PatchType::JsonPatch)
        );
        let patch: Value = serde_json::from_slice(&response.patch.unwrap()).unwrap();
        assert_eq!(patch.as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_empty_rules_return_bare_response() {
        let response = server()
            .handle(HookKind::Mutate, &Method::POST, &json_headers(), &pod_review(Some("uid-2")))
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let body: Value = serde_json::from_slice(&body_of(response).await).unwrap();
        assert_eq!(body["apiVersion"], "admission.k8s.io/v1");
        assert_eq!(body["kind"], "AdmissionReview");
        assert_eq!(body["response"], json!({"uid": "uid-2", "allowed": true}));
    }

    #[tokio::test]
    async fn test_missing_uid_rejected_before_rules() {
        let counter = Arc::new(AtomicUsize::new(0));
        let server = server().with_mutating_rule(counting_rule(counter.clone()));

        let response = server
            .handle(HookKind::Mutate, &Method::POST, &json_headers(), &pod_review(None))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rejected_requests() {
        struct TestCase {
            name: &'static str,
            method: Method,
            content_type: Option<&'static str>,
            body: Vec<u8>,
            want_status: StatusCode,
        }

        let test_cases = vec![
            TestCase {
                name: "GET",
                method: Method::GET,
                content_type: Some("application/json"),
                body: pod_review(Some("uid")),
                want_status: StatusCode::METHOD_NOT_ALLOWED,
            },
            TestCase {
                name: "missing content type",
                method: Method::POST,
                content_type: None,
                body: pod_review(Some("uid")),
                want_status: StatusCode::BAD_REQUEST,
            },
            TestCase {
                name: "wrong content type",
                method: Method::POST,
                content_type: Some("text/plain"),
                body: pod_review(Some("uid")),
                want_status: StatusCode::BAD_REQUEST,
            },
            TestCase {
                name: "malformed json",
                method: Method::POST,
                content_type: Some("application/json"),
                body: b"{\"request\":".to_vec(),
                want_status: StatusCode::BAD_REQUEST,
            },
            TestCase {
                name: "no request",
                method: Method::POST,
                content_type: Some("application/json"),
                body: b"{\"apiVersion\":\"admission.k8s.io/v1\",\"kind\":\"AdmissionReview\"}".to_vec(),
                want_status: StatusCode::BAD_REQUEST,
            },
        ];

        let counter = Arc::new(AtomicUsize::new(0));
        let server = server().with_mutating_rule(counting_rule(counter.clone()));
        for tc in test_cases {
            let mut headers = HeaderMap::new();
            if let Some(content_type) = tc.content_type {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
            }
            let response = server
                .handle(HookKind::Mutate, &tc.method, &headers, &tc.body)
                .await;
            assert_eq!(response.status(), tc.want_status, "test case: {}", tc.name);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_content_type_parameters_accepted() {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        let response = server()
            .handle(HookKind::Validate, &Method::POST, &headers, &pod_review(Some("uid")))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_callback_error_is_internal_error() {
        let failing = WebhookRule::sync(|_| Err(anyhow::anyhow!("role lookup failed")))
            .operations([Operation::Create])
            .api_groups([""])
            .api_versions(["v1"])
            .resources(["pods"]);
        let response = server()
            .with_validating_rule(failing)
            .handle(HookKind::Validate, &Method::POST, &json_headers(), &pod_review(Some("uid")))
            .await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = String::from_utf8(body_of(response).await).unwrap();
        assert!(body.starts_with("Internal Error!\n"), "body: {}", body);
        assert!(body.contains("role lookup failed"), "body: {}", body);
    }

    #[tokio::test]
    async fn test_validate_only_runs_validating_rules() {
        let mutating = Arc::new(AtomicUsize::new(0));
        let denying = WebhookRule::sync(|ctx| {
            ctx.deny("pods may not be created here");
            Ok(())
        })
        .operations([Operation::Create])
        .api_groups([""])
        .api_versions(["v1"])
        .resources(["pods"]);
        let server = server()
            .with_mutating_rule(counting_rule(mutating.clone()))
            .with_validating_rule(denying);

        let response = server
            .handle(HookKind::Validate, &Method::POST, &json_headers(), &pod_review(Some("uid-3")))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(mutating.load(Ordering::SeqCst), 0);

        let body: Value = serde_json::from_slice(&body_of(response).await).unwrap();
        assert_eq!(body["response"]["uid"], "uid-3");
        assert_eq!(body["response"]["allowed"], false);
        assert_eq!(
            body["response"]["status"]["message"],
            "pods may not be created here"
        );
        assert!(body["response"].get("patch").is_none());
    }

    #[test]
    fn test_origin_and_hostname() {
        let test_cases = vec![
            ("with port", "webhook.example.com:8443", "https://webhook.example.com:8443", "webhook.example.com"),
            ("without port", "webhook.example.com", "https://webhook.example.com", "webhook.example.com"),
        ];

        for (name, host, origin, hostname) in test_cases {
            assert_eq!(
                origin_and_hostname(host),
                (origin.to_string(), hostname.to_string()),
                "Failed test case: {}",
                name
            );
        }
    }

    #[tokio::test]
    async fn test_router_resolves_host() {
        struct TestCase {
            name: &'static str,
            uri: &'static str,
            host_header: Option<&'static str>,
            want_url: &'static str,
        }

        let test_cases = vec![
            TestCase {
                name: "host header",
                uri: "/webhook-config.yaml",
                host_header: Some("webhook.example.com:8443"),
                want_url: "https://webhook.example.com:8443/admission/mutate",
            },
            TestCase {
                name: "authority only, as sent over h2",
                uri: "https://webhook.example.com/webhook-config.yaml",
                host_header: None,
                want_url: "https://webhook.example.com/admission/mutate",
            },
        ];

        for tc in test_cases {
            let router = server()
                .with_mutating_rule(identity_injection_rule(IdentityConfig::default()))
                .router();
            let mut request = Request::builder().method(Method::GET).uri(tc.uri);
            if let Some(host) = tc.host_header {
                request = request.header(HOST, host);
            }
            let response = router
                .oneshot(request.body(Body::empty()).unwrap())
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::OK, "Failed test case: {}", tc.name);
            assert_eq!(
                response.headers().get(SERVER).unwrap(),
                SERVER_HEADER,
                "Failed test case: {}",
                tc.name
            );
            let manifest = String::from_utf8(body_of(response).await).unwrap();
            assert!(manifest.contains(tc.want_url), "Failed test case: {}", tc.name);
            assert!(
                manifest.contains("\"name\": \"webhook.example.com\""),
                "Failed test case: {}",
                tc.name
            );
        }
    }

    #[tokio::test]
    async fn test_banner_uses_authority() {
        let request = Request::builder()
            .uri("https://webhook.example.com/")
            .body(Body::empty())
            .unwrap();
        let response = server().router().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let banner = String::from_utf8(body_of(response).await).unwrap();
        assert!(
            banner.contains("kubectl apply -f \"https://webhook.example.com/webhook-config.yaml\""),
            "banner: {}",
            banner
        );
    }

    #[tokio::test]
    async fn test_router_fallback() {
        let request = Request::builder()
            .uri("/admission/unknown")
            .header(HOST, "webhook.example.com")
            .body(Body::empty())
            .unwrap();
        let response = server().router().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers().get(SERVER).unwrap(), SERVER_HEADER);
    }

    #[test]
    fn test_config_manifest_lists_registered_hooks() {
        let server = server().with_mutating_rule(identity_injection_rule(IdentityConfig::default()));
        let manifest = server
            .config_manifest("https://webhook.example.com", "webhook.example.com")
            .unwrap();
        assert!(manifest.contains("MutatingWebhookConfiguration"));
        assert!(!manifest.contains("ValidatingWebhookConfiguration"));
        assert!(manifest.contains("https://webhook.example.com/admission/mutate"));
    }
}
