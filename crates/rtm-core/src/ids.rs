//! Branded ID newtypes.
//!
//! Connection and trace identifiers are distinct newtypes around `String` so a
//! trace id can never be passed where a client id is expected. Generated
//! values are UUID v7 (time-ordered) via [`uuid::Uuid::now_v7`].

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

fn new_v7() -> String {
    Uuid::now_v7().to_string()
}

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new random ID (UUID v7, time-ordered).
            #[must_use]
            pub fn new() -> Self {
                Self(new_v7())
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
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

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Opaque identifier generated for every accepted connection.
    ClientId
}

branded_id! {
    /// Correlation id attached to one dispatched message.
    ///
    /// Taken from the inbound `traceId` when present, generated otherwise.
    TraceId
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn client_id_new_is_uuid_v7() {
        let id = ClientId::new();
        let parsed = Uuid::parse_str(id.as_str()).expect("should be valid UUID");
        assert_eq!(parsed.get_version(), Some(uuid::Version::SortRand));
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = ClientId::new();
        let b = ClientId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn trace_id_from_str() {
        let id = TraceId::from("trace-1");
        assert_eq!(id.as_str(), "trace-1");
        assert_eq!(id.to_string(), "trace-1");
    }

    #[test]
    fn serde_is_transparent() {
        let id = ClientId::from("c1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"c1\"");
        let back: ClientId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn into_inner_returns_string() {
        let id = TraceId::from("t");
        let s: String = id.into_inner();
        assert_eq!(s, "t");
    }

    proptest! {
        #[test]
        fn string_conversion_preserves_value(s in "[a-zA-Z0-9_-]{0,40}") {
            let id = ClientId::from(s.clone());
            prop_assert_eq!(id.as_str(), s.as_str());
            prop_assert_eq!(String::from(id), s);
        }
    }
}
