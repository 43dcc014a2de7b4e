//! Strongly-typed references to module declarations.
//!
//! A [`Ref`] names a declaration (verb, topic, FSM, subscription) as
//! `module.name`. Both components are identifiers matching
//! `[a-zA-Z_][a-zA-Z0-9_]*`. The text form is part of the durable schema
//! (it appears inside async-call origin keys), so parsing must round-trip
//! bit-exact.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Returns true if `s` is a valid module or declaration identifier.
#[must_use]
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A reference to a declaration in a module.
///
/// Displays as `module.name` and parses back losslessly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ref {
    /// The module the declaration lives in.
    pub module: String,
    /// The declaration name.
    pub name: String,
}

impl Ref {
    /// Creates a reference without validating the components.
    ///
    /// Use [`Ref::parse`](str::parse) for untrusted input.
    #[must_use]
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.name)
    }
}

impl FromStr for Ref {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some((module, name)) = s.split_once('.') else {
            return Err(Error::invalid_ref(s, "expected module.name"));
        };
        if !is_identifier(module) {
            return Err(Error::invalid_ref(s, "invalid module identifier"));
        }
        if !is_identifier(name) {
            return Err(Error::invalid_ref(s, "invalid declaration identifier"));
        }
        Ok(Self {
            module: module.to_string(),
            name: name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_round_trips() {
        let r = Ref::new("echo", "hello");
        let parsed: Ref = r.to_string().parse().unwrap();
        assert_eq!(parsed, r);
    }

    #[test]
    fn underscore_identifiers_are_valid() {
        let r: Ref = "_mod._decl_1".parse().unwrap();
        assert_eq!(r.module, "_mod");
        assert_eq!(r.name, "_decl_1");
    }

    #[test]
    fn rejects_missing_separator() {
        assert!("echohello".parse::<Ref>().is_err());
    }

    #[test]
    fn rejects_leading_digit() {
        assert!("1mod.name".parse::<Ref>().is_err());
        assert!("mod.1name".parse::<Ref>().is_err());
    }

    #[test]
    fn rejects_extra_components() {
        // Only the first '.' splits; the remainder must still be a valid
        // identifier, which 'b.c' is not.
        assert!("a.b.c".parse::<Ref>().is_err());
    }

    #[test]
    fn rejects_whitespace() {
        assert!("mod .name".parse::<Ref>().is_err());
        assert!("mod.na me".parse::<Ref>().is_err());
    }

    #[test]
    fn serde_round_trips() {
        let r = Ref::new("echo", "hello");
        let json = serde_json::to_string(&r).unwrap();
        let back: Ref = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }
}
