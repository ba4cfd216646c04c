use std::{borrow::Cow, fmt, str::FromStr};

use schemars::{JsonSchema, Schema, SchemaGenerator, json_schema};
use serde::{Deserialize, Serialize};

use crate::error::ChainError;

/// An addressable port, written `component:port` by the graph daemon.
///
/// Only the first `:` separates the two halves, so port names that contain
/// colons of their own survive a round trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortRef {
    pub component: String,
    pub port: String,
}

impl PortRef {
    pub fn new(component: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            port: port.into(),
        }
    }

    /// Same port, owned by another component.
    pub fn with_component(&self, component: impl Into<String>) -> Self {
        Self::new(component, self.port.clone())
    }
}

impl JsonSchema for PortRef {
    fn schema_name() -> Cow<'static, str> {
        "PortRef".into()
    }

    fn json_schema(_generator: &mut SchemaGenerator) -> Schema {
        json_schema!({
            "type": "string",
            "pattern": "^[^:]+:.+$",
            "description": "`component:port`, e.g. `system:playback_1`"
        })
    }
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.component, self.port)
    }
}

impl FromStr for PortRef {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.split_once(':') {
            Some((component, port)) if !component.is_empty() && !port.is_empty() => {
                Ok(PortRef::new(component, port))
            }
            _ => Err(ChainError::InvalidChain(format!(
                "`{s}` is not a `component:port` reference"
            ))),
        }
    }
}

impl TryFrom<String> for PortRef {
    type Error = ChainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PortRef> for String {
    fn from(value: PortRef) -> Self {
        value.to_string()
    }
}

/// A signal path from `src` to `dst`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Connection {
    pub src: PortRef,
    pub dst: PortRef,
}

impl Connection {
    pub fn new(src: PortRef, dst: PortRef) -> Self {
        Self { src, dst }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_component_and_port() {
        let p: PortRef = "system:playback_1".parse().unwrap();
        assert_eq!(p.component, "system");
        assert_eq!(p.port, "playback_1");
        assert_eq!(p.to_string(), "system:playback_1");
    }

    #[test]
    fn only_first_colon_splits() {
        let p: PortRef = "a2j:Midi Through [14] (capture): Port-0".parse().unwrap();
        assert_eq!(p.component, "a2j");
        assert_eq!(p.port, "Midi Through [14] (capture): Port-0");
    }

    #[test]
    fn rejects_malformed_refs() {
        assert!("no-colon".parse::<PortRef>().is_err());
        assert!(":out".parse::<PortRef>().is_err());
        assert!("gain:".parse::<PortRef>().is_err());
    }

    #[test]
    fn serializes_as_plain_string() {
        let p = PortRef::new("gain", "out_l");
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, "\"gain:out_l\"");
        let back: PortRef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }
}
