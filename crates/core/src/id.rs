//! Opaque identifiers used across the batch state model.
//!
//! Instance and chunk ids are generated as UUIDv7 strings but are never parsed
//! back: storage backends and external producers may supply any non-empty string.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of a job instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

/// Identifier of a work chunk.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(String);

/// Identifier of a step within a job definition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(String);

macro_rules! impl_string_id {
    ($t:ty, $name:literal) => {
        impl $t {
            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $t {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $t {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                if s.trim().is_empty() {
                    return Err(DomainError::invalid_id(format!("{}: empty", $name)));
                }
                Ok(Self(s.to_string()))
            }
        }
    };
}

impl_string_id!(InstanceId, "InstanceId");
impl_string_id!(ChunkId, "ChunkId");
impl_string_id!(StepId, "StepId");

impl InstanceId {
    /// Generate a new time-ordered identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkId {
    /// Generate a new time-ordered identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}

impl Default for ChunkId {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(InstanceId::new(), InstanceId::new());
        assert_ne!(ChunkId::new(), ChunkId::new());
    }

    #[test]
    fn empty_id_is_rejected() {
        assert!(matches!(
            "  ".parse::<StepId>(),
            Err(DomainError::InvalidId(msg)) if msg.contains("StepId")
        ));
        assert_eq!("load-ids".parse::<StepId>().unwrap().as_str(), "load-ids");
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = InstanceId::from("i-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"i-1\"");
    }
}
