use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("failed to serialize object for comparison: {0}")]
pub struct DiffError(#[from] serde_json::Error);

/// Computes the JSON Patch that turns `original` into `corrected`.
///
/// Both objects are compared through their JSON representation, so fields the
/// policy never touches produce no operations. Identical inputs yield an empty
/// patch.
pub fn diff<K: Serialize>(original: &K, corrected: &K) -> Result<json_patch::Patch, DiffError> {
    let original = serde_json::to_value(original)?;
    let corrected = serde_json::to_value(corrected)?;
    Ok(json_patch::diff(&original, &corrected))
}
