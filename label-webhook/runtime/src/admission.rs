use crate::{
    metrics::{AdmissionMetrics, Outcome},
    patch::{self, DiffError},
    policy::{self, Decision, LabelPolicy},
    review::{self, AdmissionRequest, AdmissionReview, DecodeError},
};
use futures::future;
use http_body_util::BodyExt;
use hyper::{
    http::{self, HeaderValue},
    Request, Response,
};
use kube::{core::admission::SerializePatchError, Resource, ResourceExt};
use serde::{de::DeserializeOwned, Serialize};
use std::{fmt, marker::PhantomData, sync::Arc};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

pub const VALIDATE_PATH: &str = "/validate-pods";
pub const MUTATE_PATH: &str = "/mutate-pods";

/// Serves the validating and mutating admission routes for objects of type `K`.
pub struct Admission<K> {
    policy: Arc<LabelPolicy>,
    metrics: AdmissionMetrics,
    _kind: PhantomData<fn() -> K>,
}

/// Errors that abort a request before a review can be written.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("only {0} resources are supported")]
    UnsupportedKind(String),

    #[error("couldn't read {0}")]
    UnparsableObject(String),
}

/// Reasons a request is answered with a plain-text error instead of a review.
#[derive(Debug, Error)]
enum Rejection {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error("there was an error comparing the mutated {kind} with the original")]
    Diff {
        kind: String,
        #[source]
        source: DiffError,
    },

    #[error("there was an error marshalling the patch")]
    EncodePatch(#[source] SerializePatchError),

    #[error("couldn't marshal admission response")]
    EncodeReview(#[source] serde_json::Error),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Route {
    Validate,
    Mutate,
}

type Body = http_body_util::Full<bytes::Bytes>;

/// Deserializes the object under review, provided it is of `expected_kind`.
pub fn extract<K: DeserializeOwned>(
    req: &AdmissionRequest,
    expected_kind: &str,
) -> Result<K, ExtractError> {
    if req.kind.kind != expected_kind {
        return Err(ExtractError::UnsupportedKind(expected_kind.to_string()));
    }

    let unparsable = || ExtractError::UnparsableObject(expected_kind.to_lowercase());
    let obj = req.object.as_ref().ok_or_else(unparsable)?;
    serde_json::to_value(obj)
        .and_then(serde_json::from_value)
        .map_err(|error| {
            debug!(%error, "Failed to deserialize admission object");
            unparsable()
        })
}

// === impl Admission ===

impl<K> Clone for Admission<K> {
    fn clone(&self) -> Self {
        Self {
            policy: self.policy.clone(),
            metrics: self.metrics.clone(),
            _kind: PhantomData,
        }
    }
}

impl<K> fmt::Debug for Admission<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Admission")
            .field("policy", &self.policy)
            .finish()
    }
}

impl<K> tower::Service<Request<hyper::body::Incoming>> for Admission<K>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Send + 'static,
{
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        trace!(?req);
        let Some(route) = Route::recognize(req.method(), req.uri().path()) else {
            return Box::pin(future::ok(not_found()));
        };

        let admission = self.clone();
        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let bytes = body.collect().await?.to_bytes();
            Ok(admission.handle(
                route,
                parts.headers.get(http::header::CONTENT_TYPE),
                &bytes,
            ))
        })
    }
}

impl<K> Admission<K>
where
    K: Resource + Clone + DeserializeOwned + Serialize,
{
    pub fn new(policy: LabelPolicy, metrics: AdmissionMetrics) -> Self {
        Self {
            policy: Arc::new(policy),
            metrics,
            _kind: PhantomData,
        }
    }

    fn handle(
        &self,
        route: Route,
        content_type: Option<&HeaderValue>,
        body: &[u8],
    ) -> Response<Body> {
        let result = match route {
            Route::Validate => self.validate(content_type, body),
            Route::Mutate => self.mutate(content_type, body),
        }
        .and_then(|(review, outcome)| {
            let bytes = review::to_json(&review).map_err(Rejection::EncodeReview)?;
            Ok((bytes, outcome))
        });

        match result {
            Ok((bytes, outcome)) => {
                self.metrics.record(route.as_str(), outcome);
                json_response(bytes)
            }
            Err(rejection) => {
                warn!(error = %rejection, route = route.as_str(), "Rejecting admission request");
                self.metrics.record(route.as_str(), Outcome::Rejected);
                text_response(rejection.status(), &rejection)
            }
        }
    }

    fn validate(
        &self,
        content_type: Option<&HeaderValue>,
        body: &[u8],
    ) -> Result<(AdmissionReview, Outcome), Rejection> {
        let req = review::decode(content_type, body)?;
        debug!(uid = %req.uid, kind = %req.kind.kind, "Validating");
        let obj = extract::<K>(&req, &self.policy.target_kind)?;

        match policy::evaluate(&obj, &self.policy) {
            Decision::Allowed => {
                let review = review::encode_allow(
                    &req,
                    true,
                    http::StatusCode::ACCEPTED.as_u16(),
                    self.policy.allowed_message(),
                );
                Ok((review, Outcome::Allowed))
            }
            Decision::Denied(reason) => {
                info!(%reason, ns = ?obj.namespace(), name = %obj.name_any(), "Denied");
                let review = review::encode_allow(
                    &req,
                    false,
                    http::StatusCode::FORBIDDEN.as_u16(),
                    self.policy.denied_message(),
                );
                Ok((review, Outcome::Denied))
            }
        }
    }

    fn mutate(
        &self,
        content_type: Option<&HeaderValue>,
        body: &[u8],
    ) -> Result<(AdmissionReview, Outcome), Rejection> {
        let req = review::decode(content_type, body)?;
        debug!(uid = %req.uid, kind = %req.kind.kind, "Mutating");
        let obj = extract::<K>(&req, &self.policy.target_kind)?;

        if policy::needs_correction(&obj, &self.policy) {
            info!(
                label = %self.policy.injected_label_key,
                ns = ?obj.namespace(),
                name = %obj.name_any(),
                "Invalid or no label found, correcting"
            );
        }
        let corrected = policy::correct(&obj, &self.policy);

        let patch = patch::diff(&obj, &corrected).map_err(|source| Rejection::Diff {
            kind: self.policy.target_kind.to_lowercase(),
            source,
        })?;
        debug!(?patch);

        let outcome = if patch.0.is_empty() {
            Outcome::Allowed
        } else {
            Outcome::Patched
        };
        let review = review::encode_patch(&req, patch).map_err(Rejection::EncodePatch)?;
        Ok((review, outcome))
    }
}

// === impl Rejection ===

impl Rejection {
    fn status(&self) -> http::StatusCode {
        match self {
            Self::EncodeReview(_) => http::StatusCode::INTERNAL_SERVER_ERROR,
            Self::Decode(_) | Self::Extract(_) | Self::Diff { .. } | Self::EncodePatch(_) => {
                http::StatusCode::BAD_REQUEST
            }
        }
    }
}

// === impl Route ===

impl Route {
    fn recognize(method: &http::Method, path: &str) -> Option<Self> {
        if method != http::Method::POST {
            return None;
        }
        match path {
            VALIDATE_PATH => Some(Self::Validate),
            MUTATE_PATH => Some(Self::Mutate),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::Mutate => "mutate",
        }
    }
}

fn json_response(bytes: Vec<u8>) -> Response<Body> {
    Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, review::JSON_CONTENT_TYPE)
        .body(Body::from(bytes))
        .expect("admission review response must be valid")
}

fn text_response(status: http::StatusCode, error: &dyn fmt::Display) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(format!("{error}\n")))
        .expect("error response must be valid")
}

fn not_found() -> Response<Body> {
    Response::builder()
        .status(http::StatusCode::NOT_FOUND)
        .body(Body::default())
        .expect("not found response must be valid")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::fixtures;
    use k8s_openapi::api::core::v1::Pod;
    use serde_json::{json, Value};

    fn admission() -> Admission<Pod> {
        Admission::new(LabelPolicy::default(), AdmissionMetrics::default())
    }

    fn json_header() -> HeaderValue {
        HeaderValue::from_static("application/json")
    }

    fn body(labels: Option<Value>) -> Vec<u8> {
        fixtures::review("Pod", fixtures::pod(labels))
            .to_string()
            .into_bytes()
    }

    async fn read(rsp: Response<Body>) -> (http::StatusCode, Option<HeaderValue>, Vec<u8>) {
        let status = rsp.status();
        let content_type = rsp.headers().get(http::header::CONTENT_TYPE).cloned();
        let bytes = rsp
            .into_body()
            .collect()
            .await
            .expect("full body never fails")
            .to_bytes();
        (status, content_type, bytes.to_vec())
    }

    fn patch_of(review: &AdmissionReview) -> Value {
        let rsp = review.response.as_ref().expect("response must be set");
        serde_json::from_slice(rsp.patch.as_deref().expect("patch must be set")).unwrap()
    }

    #[test]
    fn recognizes_routes() {
        assert_eq!(
            Route::recognize(&http::Method::POST, "/validate-pods"),
            Some(Route::Validate)
        );
        assert_eq!(
            Route::recognize(&http::Method::POST, "/mutate-pods"),
            Some(Route::Mutate)
        );
        assert_eq!(Route::recognize(&http::Method::GET, "/validate-pods"), None);
        assert_eq!(Route::recognize(&http::Method::POST, "/"), None);
    }

    #[test]
    fn extracts_typed_object() {
        let req = review::decode(Some(&json_header()), &body(Some(json!({ "app": "web" }))))
            .unwrap();
        let pod = extract::<Pod>(&req, "Pod").unwrap();
        assert_eq!(pod.labels().get("app").map(String::as_str), Some("web"));
        let containers = pod.spec.expect("spec must be set").containers;
        assert_eq!(containers[0].image.as_deref(), Some("nginx:1.27"));
    }

    #[test]
    fn extract_rejects_other_kinds() {
        let bytes = fixtures::review("Deployment", fixtures::pod(None)).to_string();
        let req = review::decode(Some(&json_header()), bytes.as_bytes()).unwrap();
        let err = extract::<Pod>(&req, "Pod").unwrap_err();
        assert!(matches!(err, ExtractError::UnsupportedKind(_)));
        assert_eq!(err.to_string(), "only Pod resources are supported");
    }

    #[test]
    fn extract_rejects_missing_object() {
        let mut review = fixtures::review("Pod", Value::Null);
        review["request"]
            .as_object_mut()
            .unwrap()
            .remove("object");
        let req = review::decode(Some(&json_header()), review.to_string().as_bytes()).unwrap();
        let err = extract::<Pod>(&req, "Pod").unwrap_err();
        assert!(matches!(err, ExtractError::UnparsableObject(_)));
        assert_eq!(err.to_string(), "couldn't read pod");
    }

    #[test]
    fn extract_rejects_unparsable_object() {
        let mut pod = fixtures::pod(None);
        pod["spec"]["containers"] = json!("not-a-list");
        let bytes = fixtures::review("Pod", pod).to_string();
        let req = review::decode(Some(&json_header()), bytes.as_bytes()).unwrap();
        let err = extract::<Pod>(&req, "Pod").unwrap_err();
        assert!(matches!(err, ExtractError::UnparsableObject(_)));
    }

    #[tokio::test]
    async fn validate_allows_labelled_pod() {
        let rsp = admission().handle(
            Route::Validate,
            Some(&json_header()),
            &body(Some(json!({ "teacher": "x" }))),
        );
        let (status, content_type, bytes) = read(rsp).await;
        assert_eq!(status, http::StatusCode::OK);
        assert_eq!(content_type, Some(json_header()));

        let review: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(review["kind"], "AdmissionReview");
        assert_eq!(review["apiVersion"], "admission.k8s.io/v1");
        assert_eq!(review["response"]["uid"], fixtures::UID);
        assert_eq!(review["response"]["allowed"], true);
        assert_eq!(review["response"]["status"]["code"], 202);
        assert_eq!(review["response"]["status"]["message"], "valid pod");
    }

    #[tokio::test]
    async fn validate_denies_pod_without_label() {
        let rsp = admission().handle(Route::Validate, Some(&json_header()), &body(Some(json!({}))));
        let (status, _, bytes) = read(rsp).await;
        assert_eq!(status, http::StatusCode::OK, "decision lives in the review");

        let review: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(review["response"]["allowed"], false);
        assert_eq!(review["response"]["status"]["code"], 403);
        assert_eq!(review["response"]["status"]["message"], "pod label is invalid");
    }

    #[test]
    fn validate_denies_pod_without_labels_map() {
        let (review, outcome) = admission()
            .validate(Some(&json_header()), &body(None))
            .unwrap();
        assert_eq!(outcome, Outcome::Denied);
        assert!(!review.response.unwrap().allowed);
    }

    #[test]
    fn mutate_adds_labels_map() {
        let (review, outcome) = admission()
            .mutate(Some(&json_header()), &body(None))
            .unwrap();
        assert_eq!(outcome, Outcome::Patched);
        assert_eq!(
            patch_of(&review),
            json!([{
                "op": "add",
                "path": "/metadata/labels",
                "value": { "super-teacher": "Drewbernetes" },
            }])
        );
        let rsp = review.response.unwrap();
        assert!(rsp.allowed);
        assert_eq!(rsp.uid, fixtures::UID);
    }

    #[test]
    fn mutate_keeps_other_labels() {
        let (review, _) = admission()
            .mutate(
                Some(&json_header()),
                &body(Some(json!({ "app": "web", "super-teacher": "nope" }))),
            )
            .unwrap();
        assert_eq!(
            patch_of(&review),
            json!([{
                "op": "replace",
                "path": "/metadata/labels/super-teacher",
                "value": "Drewbernetes",
            }])
        );
    }

    #[test]
    fn mutate_compliant_pod_is_noop() {
        let (review, outcome) = admission()
            .mutate(
                Some(&json_header()),
                &body(Some(json!({ "super-teacher": "Drewbernetes" }))),
            )
            .unwrap();
        assert_eq!(outcome, Outcome::Allowed);
        assert_eq!(patch_of(&review), json!([]));
        assert!(review.response.unwrap().allowed);
    }

    #[tokio::test]
    async fn mutate_responds_with_json_patch() {
        let rsp = admission().handle(Route::Mutate, Some(&json_header()), &body(None));
        let (status, content_type, bytes) = read(rsp).await;
        assert_eq!(status, http::StatusCode::OK);
        assert_eq!(content_type, Some(json_header()));

        let review: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(review["response"]["allowed"], true);
        assert_eq!(review["response"]["patchType"], "JSONPatch");
        assert!(!review["response"]["patch"].is_null());
    }

    #[tokio::test]
    async fn rejects_wrong_content_type_as_text() {
        for route in [Route::Validate, Route::Mutate] {
            let rsp = admission().handle(
                route,
                Some(&HeaderValue::from_static("text/plain")),
                &body(None),
            );
            let (status, content_type, bytes) = read(rsp).await;
            assert_eq!(status, http::StatusCode::BAD_REQUEST);
            assert_eq!(
                content_type,
                Some(HeaderValue::from_static("text/plain; charset=utf-8"))
            );
            assert_eq!(
                String::from_utf8(bytes).unwrap(),
                "incorrect content type \"text/plain\" - should be application/json\n"
            );
        }
    }

    #[tokio::test]
    async fn rejects_empty_body() {
        let rsp = admission().handle(Route::Mutate, Some(&json_header()), b"");
        let (status, _, bytes) = read(rsp).await;
        assert_eq!(status, http::StatusCode::BAD_REQUEST);
        assert_eq!(String::from_utf8(bytes).unwrap(), "body is empty\n");
    }

    #[tokio::test]
    async fn rejects_other_kinds() {
        let bytes = fixtures::review("Namespace", fixtures::pod(None))
            .to_string()
            .into_bytes();
        let rsp = admission().handle(Route::Validate, Some(&json_header()), &bytes);
        let (status, _, bytes) = read(rsp).await;
        assert_eq!(status, http::StatusCode::BAD_REQUEST);
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            "only Pod resources are supported\n"
        );
    }

    #[test]
    fn rejection_status_codes() {
        assert_eq!(
            Rejection::from(DecodeError::EmptyBody).status(),
            http::StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Rejection::from(ExtractError::UnsupportedKind("Pod".to_string())).status(),
            http::StatusCode::BAD_REQUEST
        );
        let encode = serde_json::from_str::<Value>("{").unwrap_err();
        assert_eq!(
            Rejection::EncodeReview(encode).status(),
            http::StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn records_outcomes() {
        let mut reg = prometheus_client::registry::Registry::default();
        let metrics = AdmissionMetrics::register(&mut reg);
        let admission = Admission::<Pod>::new(LabelPolicy::default(), metrics);
        let _ = admission.handle(Route::Validate, Some(&json_header()), &body(None));
        let _ = admission.handle(Route::Mutate, None, &body(None));

        let mut text = String::new();
        prometheus_client::encoding::text::encode(&mut text, &reg).unwrap();
        assert!(
            text.contains(r#"admission_requests_total{route="validate",outcome="denied"} 1"#),
            "{text}"
        );
        assert!(
            text.contains(r#"admission_requests_total{route="mutate",outcome="rejected"} 1"#),
            "{text}"
        );
    }
}
