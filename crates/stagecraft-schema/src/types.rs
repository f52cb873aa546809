//! Newtype wrappers for string identifiers, providing compile-time type safety.
//!
//! All newtypes serialize/deserialize as plain strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance from a string.
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Return the inner string as a slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<String> for $name {
            fn eq(&self, other: &String) -> bool {
                self.0 == *other
            }
        }

        impl PartialEq<$name> for String {
            fn eq(&self, other: &$name) -> bool {
                *self == other.0
            }
        }

        impl AsRef<std::path::Path> for $name {
            fn as_ref(&self) -> &std::path::Path {
                std::path::Path::new(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_newtype!(
    /// Opaque identifier of one staging area, assigned when the stage is created.
    StageId
);

string_newtype!(
    /// Identity of the claimant allowed to drive a stage's transitions.
    OwnerToken
);

string_newtype!(
    /// Logical site whose codebase a stage mutates. Namespaces persisted state.
    SiteKey
);

static STAGE_COUNTER: AtomicU64 = AtomicU64::new(0);

impl StageId {
    /// Generate a fresh stage identifier.
    ///
    /// Mixes the current time, process id, a process-local counter and the
    /// owner so two creates in the same nanosecond still differ.
    pub fn generate(owner: &OwnerToken) -> Self {
        let seq = STAGE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let now = chrono::Utc::now();
        let seed = format!(
            "{}:{}:{seq}:{owner}",
            now.timestamp_nanos_opt().unwrap_or_default(),
            std::process::id()
        );
        Self(blake3::hash(seed.as_bytes()).to_hex()[..32].to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_id_display_and_as_ref() {
        let id = StageId::new("abc123");
        assert_eq!(id.to_string(), "abc123");
        assert_eq!(id.as_str(), "abc123");
        assert_eq!(AsRef::<str>::as_ref(&id), "abc123");
    }

    #[test]
    fn stage_id_serde_roundtrip() {
        let id = StageId::new("deadbeef");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"deadbeef\"");
        let back: StageId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn generated_ids_are_unique_and_hex() {
        let owner = OwnerToken::new("alice");
        let a = StageId::generate(&owner);
        let b = StageId::generate(&owner);
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.bytes().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn owner_token_equality() {
        let a = OwnerToken::new("same");
        let b = OwnerToken::from("same");
        let c = OwnerToken::new("diff");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn site_key_into_inner() {
        let k = SiteKey::new("default".to_owned());
        assert_eq!(k.into_inner(), "default");
    }
}
