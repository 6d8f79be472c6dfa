//! Secret configuration values.

use std::fmt;

use serde::{Deserialize, Serialize, Serializer};

/// Marker written in place of a secret whenever one is serialized.
pub const REDACTION_MARKER: &str = "REDACTED";

/// A sensitive configuration value.
///
/// Serializes to [`REDACTION_MARKER`] (or `""` when empty) and never prints its
/// contents through `Debug` or `Display`. Use [`Secret::expose`] at the call site
/// that actually needs the value.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Wrap a raw value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw value.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Display form of the secret.
    pub fn redacted(&self) -> &'static str {
        if self.0.is_empty() { "" } else { REDACTION_MARKER }
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.redacted())
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret({})", self.redacted())
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.redacted())
    }
}
