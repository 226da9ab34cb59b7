use serde::Serialize;
use steward_types::{StewardError, StewardResult};

/// Stable blake3 hash of a payload's JSON encoding.
pub fn fingerprint<T: Serialize + ?Sized>(payload: &T) -> StewardResult<String> {
    let bytes =
        serde_json::to_vec(payload).map_err(|e| StewardError::InvalidPayload(e.to_string()))?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}
