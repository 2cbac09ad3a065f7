//! Target platform descriptor
//!
//! A target is a backend kind (`llvm`, `c`, ...) plus an ordered set of
//! attributes, written the way compiler drivers take them on a command line:
//!
//! ```text
//! llvm -mcpu=skylake-avx512 -num-cores=4 -fast-math
//! ```

use crate::errors::{IrError, Result};
use serde::{de, Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Platform/backend description a program is compiled for
///
/// Serializes as `{"kind", "attrs"}`, which keeps every value intact; the
/// command-line text form is also accepted when deserializing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Target {
    kind: String,
    attrs: BTreeMap<String, String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TargetRepr {
    Text(String),
    Fields {
        kind: String,
        #[serde(default)]
        attrs: BTreeMap<String, String>,
    },
}

impl Target {
    /// Target of the given kind with no attributes
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            attrs: BTreeMap::new(),
        }
    }

    /// Parse the command-line form (`kind -key=value -flag ...`)
    pub fn parse(text: &str) -> Result<Self> {
        let mut tokens = text.split_whitespace();
        let kind = tokens
            .next()
            .ok_or_else(|| IrError::format("empty target string"))?;
        if kind.starts_with('-') {
            return Err(IrError::format(format!(
                "target string must start with a kind, got '{}'",
                kind
            )));
        }

        let mut target = Target::new(kind);
        for token in tokens {
            let option = token.strip_prefix('-').ok_or_else(|| {
                IrError::format(format!(
                    "target option '{}' must start with '-' (in '{}')",
                    token, text
                ))
            })?;
            let (key, value) = match option.split_once('=') {
                Some((key, value)) => (key, value),
                None => (option, "true"),
            };
            if key.is_empty() {
                return Err(IrError::format(format!(
                    "empty target option name in '{}'",
                    text
                )));
            }
            target.attrs.insert(key.to_string(), value.to_string());
        }
        Ok(target)
    }

    /// Builder-style attribute setter
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    pub fn attrs(&self) -> &BTreeMap<String, String> {
        &self.attrs
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        for (key, value) in &self.attrs {
            if value == "true" {
                write!(f, " -{}", key)?;
            } else {
                write!(f, " -{}={}", key, value)?;
            }
        }
        Ok(())
    }
}

impl FromStr for Target {
    type Err = IrError;

    fn from_str(s: &str) -> Result<Self> {
        Target::parse(s)
    }
}

impl<'de> Deserialize<'de> for Target {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match TargetRepr::deserialize(deserializer)? {
            TargetRepr::Text(text) => Target::parse(&text).map_err(de::Error::custom),
            TargetRepr::Fields { kind, attrs } => Ok(Target { kind, attrs }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kind_only() {
        let target = Target::parse("llvm").unwrap();
        assert_eq!(target.kind(), "llvm");
        assert!(target.attrs().is_empty());
        assert_eq!(target.to_string(), "llvm");
    }

    #[test]
    fn test_parse_attrs_and_flags() {
        let target = Target::parse("llvm  -mcpu=skylake -fast-math").unwrap();
        assert_eq!(target.attr("mcpu"), Some("skylake"));
        assert_eq!(target.attr("fast-math"), Some("true"));
        // attributes print in key order
        assert_eq!(target.to_string(), "llvm -fast-math -mcpu=skylake");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Target::parse("").unwrap_err().is_format());
        assert!(Target::parse("   ").is_err());
        assert!(Target::parse("-mcpu=x").is_err());
        assert!(Target::parse("llvm mcpu=x").is_err());
        assert!(Target::parse("llvm -=x").is_err());
    }

    #[test]
    fn test_serde_keeps_values_the_text_form_cannot_carry() {
        let target = Target::new("llvm").with_attr("libs", "a b");
        let json = serde_json::to_value(&target).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "kind": "llvm", "attrs": { "libs": "a b" } })
        );
        let back: Target = serde_json::from_value(json).unwrap();
        assert_eq!(back, target);

        // not representable on a command line, still a valid value
        let odd = Target::new("-x").with_attr("", "");
        let back: Target = serde_json::from_str(&serde_json::to_string(&odd).unwrap()).unwrap();
        assert_eq!(back, odd);
    }

    #[test]
    fn test_deserialize_accepts_text_form() {
        let target: Target = serde_json::from_str("\"c -mcpu=cortex-a72\"").unwrap();
        assert_eq!(target, Target::new("c").with_attr("mcpu", "cortex-a72"));

        let target: Target = serde_json::from_str(r#"{"kind": "llvm"}"#).unwrap();
        assert!(target.attrs().is_empty());

        assert!(serde_json::from_str::<Target>("\"\"").is_err());
        assert!(serde_json::from_str::<Target>("42").is_err());
    }
}
