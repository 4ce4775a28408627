//! Decoding and encoding of `admission.k8s.io/v1` review envelopes.

use hyper::http::HeaderValue;
use kube::core::{
    admission::{self, SerializePatchError},
    DynamicObject, TypeMeta,
};
use thiserror::Error;

pub type AdmissionRequest = admission::AdmissionRequest<DynamicObject>;
pub type AdmissionResponse = admission::AdmissionResponse;
pub type AdmissionReview = admission::AdmissionReview<DynamicObject>;

pub const JSON_CONTENT_TYPE: &str = "application/json";

const REVIEW_API_VERSION: &str = "admission.k8s.io/v1";
const REVIEW_KIND: &str = "AdmissionReview";

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("incorrect content type {0:?} - should be application/json")]
    UnsupportedMediaType(String),

    #[error("body is empty")]
    EmptyBody,

    #[error("couldn't read the admission review request: {0}")]
    MalformedEnvelope(#[source] serde_json::Error),

    #[error("admission request is nil")]
    MissingRequestSection,
}

/// Parses an admission review, returning its request section.
pub fn decode(
    content_type: Option<&HeaderValue>,
    body: &[u8],
) -> Result<AdmissionRequest, DecodeError> {
    let content_type = content_type
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .unwrap_or_default();
    if content_type != JSON_CONTENT_TYPE {
        return Err(DecodeError::UnsupportedMediaType(content_type));
    }

    if body.is_empty() {
        return Err(DecodeError::EmptyBody);
    }

    let review: AdmissionReview =
        serde_json::from_slice(body).map_err(DecodeError::MalformedEnvelope)?;
    review
        .try_into()
        .map_err(|_| DecodeError::MissingRequestSection)
}

/// Builds a review carrying a plain allow/deny decision for `req`.
pub fn encode_allow(
    req: &AdmissionRequest,
    allowed: bool,
    code: u16,
    message: impl ToString,
) -> AdmissionReview {
    let mut rsp = AdmissionResponse::from(req);
    rsp.allowed = allowed;
    rsp.result.code = code;
    rsp.result.message = message.to_string();
    into_review(rsp)
}

/// Builds an allowing review that carries a JSON Patch for `req`'s object.
pub fn encode_patch(
    req: &AdmissionRequest,
    patch: json_patch::Patch,
) -> Result<AdmissionReview, SerializePatchError> {
    let rsp = AdmissionResponse::from(req).with_patch(patch)?;
    Ok(into_review(rsp))
}

pub fn to_json(review: &AdmissionReview) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(review)
}

fn into_review(rsp: AdmissionResponse) -> AdmissionReview {
    let mut review = rsp.into_review();
    review.types = TypeMeta {
        api_version: REVIEW_API_VERSION.to_string(),
        kind: REVIEW_KIND.to_string(),
    };
    review
}
