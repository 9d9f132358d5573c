// src/identity.rs
//! Validated identifiers
//!
//! The pool and the workspace manager only accept these types, so an
//! unvalidated lab id can never reach a kernel or a filesystem path.

use crate::utils::errors::SandboxError;
use crate::workspace::sandbox::validate_identifier;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Authenticated user. Always positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct UserId(u64);

impl UserId {
    pub fn new(raw: i64) -> Result<Self, SandboxError> {
        if raw <= 0 {
            return Err(SandboxError::InvalidUserId(raw));
        }
        Ok(Self(raw as u64))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! identifier {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn parse(raw: &str) -> Result<Self, SandboxError> {
                validate_identifier(raw).map(|id| Self(id.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = SandboxError;

            fn try_from(raw: String) -> Result<Self, Self::Error> {
                validate_identifier(&raw)?;
                Ok(Self(raw))
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
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
    };
}

identifier!(
    /// Lab exercise identifier, `^[A-Za-z0-9_-]{1,100}$`
    LabId
);

identifier!(
    /// Course identifier, `^[A-Za-z0-9_-]{1,100}$`
    CourseId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id() {
        assert_eq!(UserId::new(7).unwrap().get(), 7);
        assert!(UserId::new(0).is_err());
        assert!(UserId::new(-3).is_err());
    }

    #[test]
    fn test_lab_id_parse() {
        let lab = LabId::parse("lab-01").unwrap();
        assert_eq!(lab.as_str(), "lab-01");
        assert_eq!(lab.to_string(), "lab-01");
        assert!(LabId::parse("lab;rm -rf").is_err());
        assert!(LabId::parse("../x").is_err());
    }

    #[test]
    fn test_lab_id_deserialize_validates() {
        let ok: Result<LabId, _> = serde_json::from_str("\"intro_01\"");
        assert!(ok.is_ok());

        let bad: Result<LabId, _> = serde_json::from_str("\"lab;rm -rf\"");
        assert!(bad.is_err());
    }
}
