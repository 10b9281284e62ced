//! User identity as reported by the auth backend.

use serde::{Deserialize, Serialize};

/// Who the current session belongs to.
///
/// Returned by the auth service's identity endpoint and persisted next to
/// the session token. Immutable after creation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Stable account id.
    pub id: String,
    /// Human-facing name.
    pub display_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_field_names() {
        let id = Identity { id: "u1".into(), display_name: "Alice".into() };
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, r#"{"id":"u1","displayName":"Alice"}"#);
    }
}
