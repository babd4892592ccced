//! `admission.k8s.io/v1` AdmissionReview wire types.
//!
//! AdmissionReview is never served by the API server, so it has no generated
//! schema in `k8s-openapi`; the types here are written by hand after
//! `k8s.io/api/admission/v1/types.go`.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt;

use k8s_openapi::api::authentication::v1::UserInfo;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::StatusDetails;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Error;

pub const API_VERSION: &str = "admission.k8s.io/v1";
pub const KIND: &str = "AdmissionReview";

/// The envelope exchanged in both directions between the API server and a webhook.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReview {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<AdmissionRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<AdmissionResponse>,
}

impl Default for AdmissionReview {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            request: None,
            response: None,
        }
    }
}

impl AdmissionReview {
    /// Wraps a response in a review carrying only `response`.
    pub fn from_response(response: AdmissionResponse) -> Self {
        Self {
            response: Some(response),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupVersionKind {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupVersionResource {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl GroupVersionResource {
    pub fn new(group: &str, version: &str, resource: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            resource: resource.to_string(),
        }
    }
}

/// The operation being admitted.
///
/// Values the API server may add in the future decode into `Unexpected` and
/// encode back unchanged.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operation {
    Create,
    Update,
    Delete,
    Connect,
    Unexpected(String),
}

impl Operation {
    pub fn as_str(&self) -> &str {
        match self {
            Operation::Create => "CREATE",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
            Operation::Connect => "CONNECT",
            Operation::Unexpected(raw) => raw,
        }
    }
}

impl From<String> for Operation {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "CREATE" => Operation::Create,
            "UPDATE" => Operation::Update,
            "DELETE" => Operation::Delete,
            "CONNECT" => Operation::Connect,
            _ => Operation::Unexpected(raw),
        }
    }
}

impl From<&str> for Operation {
    fn from(raw: &str) -> Self {
        Operation::from(raw.to_string())
    }
}

impl From<Operation> for String {
    fn from(op: Operation) -> Self {
        match op {
            Operation::Unexpected(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encoding of `AdmissionResponse::patch`. Only `JSONPatch` is defined today.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PatchType {
    JsonPatch,
    Unexpected(String),
}

impl PatchType {
    pub fn as_str(&self) -> &str {
        match self {
            PatchType::JsonPatch => "JSONPatch",
            PatchType::Unexpected(raw) => raw,
        }
    }
}

impl From<String> for PatchType {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "JSONPatch" => PatchType::JsonPatch,
            _ => PatchType::Unexpected(raw),
        }
    }
}

impl From<PatchType> for String {
    fn from(patch_type: PatchType) -> Self {
        match patch_type {
            PatchType::JsonPatch => "JSONPatch".to_string(),
            PatchType::Unexpected(raw) => raw,
        }
    }
}

/// An admission request, generic over the payload type of `object`/`oldObject`.
///
/// Requests are decoded with opaque `serde_json::Value` payloads; use
/// [`AdmissionRequest::typed`] or [`AdmissionRequest::transform`] once the
/// kind has been confirmed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest<T = Value> {
    pub uid: String,
    pub kind: GroupVersionKind,
    pub resource: GroupVersionResource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_resource: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_kind: Option<GroupVersionKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_resource: Option<GroupVersionResource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_sub_resource: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub operation: Operation,
    pub user_info: UserInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_object: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
}

impl<T> AdmissionRequest<T> {
    /// Re-interprets the object payloads, leaving every other field as is.
    ///
    /// A JSON `null` payload decodes as `None`, so `Some(Value::Null)` does
    /// not survive an encode/decode round trip.
    pub fn transform<U, F>(&self, mut mapper: F) -> AdmissionRequest<U>
    where
        F: FnMut(&T) -> U,
    {
        match self.try_transform(|obj| Ok::<U, Infallible>(mapper(obj))) {
            Ok(request) => request,
            Err(never) => match never {},
        }
    }

    /// Fallible form of [`AdmissionRequest::transform`].
    pub fn try_transform<U, E, F>(&self, mut mapper: F) -> Result<AdmissionRequest<U>, E>
    where
        F: FnMut(&T) -> Result<U, E>,
    {
        Ok(AdmissionRequest {
            uid: self.uid.clone(),
            kind: self.kind.clone(),
            resource: self.resource.clone(),
            sub_resource: self.sub_resource.clone(),
            request_kind: self.request_kind.clone(),
            request_resource: self.request_resource.clone(),
            request_sub_resource: self.request_sub_resource.clone(),
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            operation: self.operation.clone(),
            user_info: self.user_info.clone(),
            object: self.object.as_ref().map(&mut mapper).transpose()?,
            old_object: self.old_object.as_ref().map(&mut mapper).transpose()?,
            dry_run: self.dry_run,
            options: self.options.clone(),
        })
    }
}

impl AdmissionRequest<Value> {
    /// Deserializes both payloads into `K`, e.g. `k8s_openapi::api::core::v1::Pod`.
    pub fn typed<K: DeserializeOwned>(&self) -> Result<AdmissionRequest<K>, Error> {
        self.try_transform(|obj| serde_json::from_value::<K>(obj.clone()))
            .map_err(|e| {
                Error::Protocol(format!(
                    "payload of {} is not a valid {}: {}",
                    self.kind.kind,
                    std::any::type_name::<K>(),
                    e
                ))
            })
    }
}

/// Structured outcome attached to a response, mirroring `meta/v1` `Status`.
///
/// The generated `meta/v1` `Status` requires `apiVersion` and `kind`, which
/// the API server omits inside an admission response.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<StatusDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResponse {
    pub uid: String,
    pub allowed: bool,
    #[serde(rename = "status", default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Status>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "base64_patch"
    )]
    pub patch: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_type: Option<PatchType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_annotations: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,
}

impl AdmissionResponse {
    /// An allowing response for the given request uid.
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            allowed: true,
            result: None,
            patch: None,
            patch_type: None,
            audit_annotations: None,
            warnings: None,
        }
    }
}

impl<T> From<&AdmissionRequest<T>> for AdmissionResponse {
    fn from(request: &AdmissionRequest<T>) -> Self {
        Self::new(request.uid.clone())
    }
}

mod base64_patch {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(patch: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match patch {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD
                .decode(encoded.as_bytes())
                .map(Some)
                .map_err(|e| de::Error::custom(format!("patch is not valid base64: {}", e))),
            None => Ok(None),
        }
    }
}

/// Decodes an AdmissionReview, defaulting `apiVersion`/`kind` when absent.
pub fn decode(bytes: &[u8]) -> Result<AdmissionReview, Error> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| Error::Protocol(e.to_string()))?;
    let mut obj = match value {
        Value::Object(obj) => obj,
        other => {
            return Err(Error::Protocol(format!(
                "review must be a JSON object, found {}",
                json_type(&other)
            )))
        }
    };

    check_or_default(&mut obj, "apiVersion", API_VERSION)?;
    check_or_default(&mut obj, "kind", KIND)?;

    match obj.get("request") {
        None | Some(Value::Null) => {}
        Some(Value::Object(request)) => match request.get("uid") {
            Some(Value::String(uid)) if !uid.is_empty() => {}
            _ => return Err(Error::MissingField("request.uid")),
        },
        Some(other) => {
            return Err(Error::Protocol(format!(
                "request must be a JSON object, found {}",
                json_type(other)
            )))
        }
    }

    serde_json::from_value(Value::Object(obj)).map_err(|e| Error::Protocol(e.to_string()))
}

/// Encodes an AdmissionReview as pretty-printed JSON, injecting `apiVersion`/`kind` if unset.
pub fn encode(review: &AdmissionReview) -> Result<Vec<u8>, Error> {
    let mut review = review.clone();
    review.api_version = assert_or_add(&review.api_version, "apiVersion", API_VERSION)?;
    review.kind = assert_or_add(&review.kind, "kind", KIND)?;
    Ok(serde_json::to_vec_pretty(&review)?)
}

fn check_or_default(obj: &mut Map<String, Value>, field: &str, expected: &str) -> Result<(), Error> {
    match obj.get(field) {
        None | Some(Value::Null) => {
            obj.insert(field.to_string(), Value::String(expected.to_string()));
            Ok(())
        }
        Some(Value::String(found)) => assert_or_add(found, field, expected).map(|_| ()),
        Some(other) => Err(Error::Protocol(format!(
            "{} must be a string, found {}",
            field,
            json_type(other)
        ))),
    }
}

fn assert_or_add(found: &str, field: &str, expected: &str) -> Result<String, Error> {
    if found.is_empty() || found == expected {
        Ok(expected.to_string())
    } else {
        Err(Error::Protocol(format!(
            "expected {} {:?}, found {:?}",
            field, expected, found
        )))
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
