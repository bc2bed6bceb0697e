//! Identifiers for dynamos and repositories.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::IngressError;

/// Unique identifier of a dynamo or repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(Uuid);

impl Identifier {
    /// Create a new random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create an identifier from a UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// The first eight characters of the identifier, for log lines.
    pub fn brief_id(&self) -> String {
        let mut text = self.0.simple().to_string();
        text.truncate(8);
        text
    }
}

impl Default for Identifier {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Identifier {
    type Err = IngressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|err| IngressError::BadArguments(format!("invalid identifier '{s}': {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_unique() {
        assert_ne!(Identifier::new(), Identifier::new());
    }

    #[test]
    fn identifier_display_and_parse() {
        let id = Identifier::new();
        let parsed: Identifier = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<Identifier>().is_err());
    }

    #[test]
    fn identifier_brief_id() {
        let id: Identifier = "A1B2C3D4-0000-4000-8000-000000000000".parse().unwrap();
        assert_eq!(id.brief_id(), "a1b2c3d4");
    }

    #[test]
    fn identifier_serializes_as_string() {
        let id = Identifier::new();
        let json = serde_json::to_value(id).unwrap();
        assert_eq!(json, serde_json::Value::String(id.to_string()));
    }
}
