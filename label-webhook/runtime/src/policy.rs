use kube::{Resource, ResourceExt};
use thiserror::Error;

/// Describes which objects the webhook polices and the labels it enforces.
///
/// Read once at startup and shared by every request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelPolicy {
    /// The only resource kind admitted by this webhook (e.g. `Pod`).
    pub target_kind: String,

    /// Label key that must be present for an object to pass validation.
    pub required_label: String,

    /// Label key written by the mutating webhook.
    pub injected_label_key: String,

    /// Value the mutating webhook ensures `injected_label_key` holds.
    pub injected_label_value: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied(DenyReason),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DenyReason {
    #[error("required label {0} absent")]
    MissingLabel(String),
}

// === impl LabelPolicy ===

impl Default for LabelPolicy {
    fn default() -> Self {
        Self {
            target_kind: "Pod".to_string(),
            required_label: "teacher".to_string(),
            injected_label_key: "super-teacher".to_string(),
            injected_label_value: "Drewbernetes".to_string(),
        }
    }
}

impl LabelPolicy {
    pub(crate) fn allowed_message(&self) -> String {
        format!("valid {}", self.target_kind.to_lowercase())
    }

    pub(crate) fn denied_message(&self) -> String {
        format!("{} label is invalid", self.target_kind.to_lowercase())
    }
}

/// Checks that `obj` carries the policy's required label.
///
/// An object without any labels is treated the same as one missing the key.
pub fn evaluate<K: Resource>(obj: &K, policy: &LabelPolicy) -> Decision {
    if obj.labels().contains_key(&policy.required_label) {
        return Decision::Allowed;
    }
    Decision::Denied(DenyReason::MissingLabel(policy.required_label.clone()))
}

/// Returns true when `correct` would change `obj`.
pub fn needs_correction<K: Resource>(obj: &K, policy: &LabelPolicy) -> bool {
    obj.labels().get(&policy.injected_label_key) != Some(&policy.injected_label_value)
}

/// Returns a copy of `obj` with the injected label set to its required value.
///
/// The labels map is created when the object has none. Everything else is
/// left untouched, so `correct(correct(obj)) == correct(obj)`.
pub fn correct<K: Resource + Clone>(obj: &K, policy: &LabelPolicy) -> K {
    let mut corrected = obj.clone();
    if needs_correction(obj, policy) {
        corrected.labels_mut().insert(
            policy.injected_label_key.clone(),
            policy.injected_label_value.clone(),
        );
    }
    corrected
}
