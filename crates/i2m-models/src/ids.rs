//! Identifier newtypes.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Minimum accepted id length.
const MIN_ID_LEN: usize = 8;

/// Maximum accepted id length.
const MAX_ID_LEN: usize = 64;

/// Validate an id taken from a path, header or query string.
///
/// Valid format: ASCII alphanumerics and hyphens only, 8-64 chars. Checked
/// before an id is ever interpolated into a Redis key or a file path.
pub fn is_valid_id(id: &str) -> bool {
    if id.len() < MIN_ID_LEN || id.len() > MAX_ID_LEN {
        return false;
    }
    id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Generate a new random id.
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Create from an existing string.
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Get the inner string.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Whether the id has an acceptable format.
            pub fn is_valid(&self) -> bool {
                is_valid_id(&self.0)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Unique identifier for a job (a batch of uploaded images).
    ///
    /// Also serves as the task id in status and stream URLs.
    JobId
);

string_id!(
    /// Identifier of one uploaded file within a job.
    FileId
);

string_id!(
    /// Browser session identifier used for job ownership.
    SessionId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_valid() {
        assert!(JobId::new().is_valid());
        assert!(FileId::new().is_valid());
        assert!(SessionId::new().is_valid());
    }

    #[test]
    fn test_id_validation() {
        assert!(is_valid_id("550e8400-e29b-41d4-a716-446655440000"));
        assert!(is_valid_id("abcd1234"));
        assert!(!is_valid_id("short"));
        assert!(!is_valid_id("../../etc/passwd"));
        assert!(!is_valid_id("job:1234567"));
        assert!(!is_valid_id(&"a".repeat(65)));
    }

    #[test]
    fn test_id_serializes_transparently() {
        let id = JobId::from_string("job-12345678");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"job-12345678\"");
    }
}
