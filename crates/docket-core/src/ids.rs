//! Branded ID newtypes.
//!
//! Sessions and connections are both identified by strings on the wire, so
//! each gets its own newtype. IDs arriving from clients (URL path segments,
//! `resume` query parameters) are validated on construction: 1 to
//! [`MAX_ID_LEN`] characters drawn from `[A-Za-z0-9._:-]`.
//!
//! Server-generated IDs are UUID v7 (time-ordered) via [`uuid::Uuid::now_v7`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Longest accepted ID, in bytes.
pub const MAX_ID_LEN: usize = 128;

/// An ID string failed validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvalidId {
    /// Which ID type was being parsed.
    pub kind: &'static str,
    /// The rejected input (truncated for display).
    pub value: String,
}

impl fmt::Display for InvalidId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {:?}", self.kind, self.value)
    }
}

impl std::error::Error for InvalidId {}

fn is_valid_id(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_ID_LEN
        && s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b':' | b'-'))
}

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Generate a new server-side ID (UUID v7, time-ordered).
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::now_v7().to_string())
            }

            /// Validate and wrap a client-supplied ID.
            pub fn parse(s: &str) -> Result<Self, InvalidId> {
                if is_valid_id(s) {
                    Ok(Self(s.to_owned()))
                } else {
                    Err(InvalidId {
                        kind: $kind,
                        value: s.chars().take(32).collect(),
                    })
                }
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = InvalidId;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = InvalidId;
            fn try_from(s: String) -> Result<Self, Self::Error> {
                if is_valid_id(&s) {
                    Ok(Self(s))
                } else {
                    Self::parse(&s)
                }
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Identifies one logical event stream (one backend job's progress feed).
    SessionId, "session id"
}

branded_id! {
    /// Identifies one client attachment. Survives a resume after a dropped
    /// socket, so a reconnecting client keeps the same connection ID.
    ConnectionId, "connection id"
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn new_is_uuid_v7() {
        let id = SessionId::new();
        let parsed = Uuid::parse_str(id.as_str()).expect("should be valid UUID");
        assert_eq!(parsed.get_version(), Some(uuid::Version::SortRand));
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[test]
    fn parse_accepts_typical_ids() {
        for s in ["job-42", "contract_review.7", "tenant:abc:1", "A"] {
            assert_eq!(SessionId::parse(s).unwrap().as_str(), s);
        }
    }

    #[test]
    fn parse_rejects_empty() {
        let err = SessionId::parse("").unwrap_err();
        assert_eq!(err.kind, "session id");
    }

    #[test]
    fn parse_rejects_bad_characters() {
        assert!(SessionId::parse("a/b").is_err());
        assert!(SessionId::parse("a b").is_err());
        assert!(ConnectionId::parse("über").is_err());
    }

    #[test]
    fn parse_rejects_overlong() {
        let long = "x".repeat(MAX_ID_LEN + 1);
        assert!(SessionId::parse(&long).is_err());
        let max = "x".repeat(MAX_ID_LEN);
        assert!(SessionId::parse(&max).is_ok());
    }

    #[test]
    fn invalid_id_display_truncates() {
        let long = "/".repeat(200);
        let err = SessionId::parse(&long).unwrap_err();
        assert_eq!(err.value.len(), 32);
        assert!(err.to_string().starts_with("invalid session id"));
    }

    #[test]
    fn serde_is_transparent_string() {
        let id = SessionId::parse("sess-1").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"sess-1\"");
        let back: SessionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn serde_rejects_invalid() {
        let result: Result<SessionId, _> = serde_json::from_str("\"has space\"");
        assert!(result.is_err());
    }

    #[test]
    fn from_str_matches_parse() {
        let id: ConnectionId = "conn-9".parse().unwrap();
        assert_eq!(&*id, "conn-9");
    }

    proptest! {
        #[test]
        fn valid_alphabet_always_parses(s in "[A-Za-z0-9._:-]{1,128}") {
            prop_assert!(SessionId::parse(&s).is_ok());
        }
    }
}
