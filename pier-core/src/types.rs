// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Pier Service Contributors

//! Newtype wrappers for validated inputs.
//!
//! Identifiers, ports and process ids validate their invariants at
//! construction, so the rest of the crate never re-checks them.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::HardValidationError;

/// Maximum length of a pier identifier.
const MAX_PIER_ID_LEN: usize = 64;

/// Validated pier identifier.
/// Must be non-empty, alphanumeric with hyphens/underscores, max 64 chars.
/// The id doubles as the default directory name, so path separators are
/// never accepted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PierId(String);

impl PierId {
    /// Create a new PierId with validation.
    pub fn new(id: impl Into<String>) -> Result<Self, HardValidationError> {
        let id = id.into();

        if id.is_empty() {
            return Err(HardValidationError::InvalidFieldValue {
                field: "pier_id",
                value: id,
                reason: "Pier ID cannot be empty".to_string(),
            });
        }

        if id.len() > MAX_PIER_ID_LEN {
            return Err(HardValidationError::InvalidFieldValue {
                field: "pier_id",
                value: id.clone(),
                reason: format!(
                    "Pier ID too long: {} chars (max {})",
                    id.len(),
                    MAX_PIER_ID_LEN
                ),
            });
        }

        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(HardValidationError::InvalidFieldValue {
                field: "pier_id",
                value: id,
                reason:
                    "Pier ID must contain only ASCII alphanumerics, hyphens, and underscores"
                        .to_string(),
            });
        }

        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for PierId {
    type Error = HardValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PierId> for String {
    fn from(id: PierId) -> Self {
        id.0
    }
}

/// Validated network port.
/// Must be in range 1-65535 (0 is reserved).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct Port(u16);

impl Port {
    /// Create a new Port with validation.
    pub fn new(port: u16) -> Result<Self, HardValidationError> {
        if port == 0 {
            return Err(HardValidationError::InvalidPort {
                port,
                reason: "Port 0 is reserved and cannot be used".to_string(),
            });
        }
        Ok(Self(port))
    }

    /// Get the inner port value.
    pub fn value(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u16> for Port {
    type Error = HardValidationError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Port> for u16 {
    fn from(port: Port) -> Self {
        port.0
    }
}

/// The two ports a pier owns exclusively.
/// `web` serves the external interface, `loopback` local-only traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortPair {
    pub web: Port,
    pub loopback: Port,
}

impl PortPair {
    /// Create a pair, rejecting a pier that would use one port twice.
    pub fn new(web: Port, loopback: Port) -> Result<Self, HardValidationError> {
        if web == loopback {
            return Err(HardValidationError::InvalidPort {
                port: web.value(),
                reason: "Web and loopback ports must differ".to_string(),
            });
        }
        Ok(Self { web, loopback })
    }

    /// Whether either port of this pair is `port`.
    pub fn contains(&self, port: Port) -> bool {
        self.web == port || self.loopback == port
    }
}

impl fmt::Display for PortPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.web, self.loopback)
    }
}

/// Validated process ID.
/// Must be positive (non-zero).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessId(u32);

impl ProcessId {
    /// Create a new ProcessId with validation.
    pub fn new(pid: u32) -> Result<Self, HardValidationError> {
        if pid == 0 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "process_id",
                value: "0".to_string(),
                reason: "Process ID 0 is reserved".to_string(),
            });
        }
        Ok(Self(pid))
    }

    /// Get the inner PID value.
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<ProcessId> for u32 {
    fn from(pid: ProcessId) -> Self {
        pid.0
    }
}

/// Wall-clock time in milliseconds since the unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pier_id_valid() {
        assert!(PierId::new("zod").is_ok());
        assert!(PierId::new("sampel-palnet").is_ok());
        assert!(PierId::new("moon_01").is_ok());
    }

    #[test]
    fn test_pier_id_invalid() {
        assert!(PierId::new("").is_err());
        assert!(PierId::new("a".repeat(65)).is_err());
        assert!(PierId::new("../etc").is_err());
        assert!(PierId::new("two words").is_err());
        assert!(PierId::new("ñame").is_err());
    }

    #[test]
    fn test_pier_id_serde_rejects_invalid() {
        let ok: Result<PierId, _> = serde_json::from_str("\"zod\"");
        assert!(ok.is_ok());
        let bad: Result<PierId, _> = serde_json::from_str("\"a/b\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_port_valid() {
        assert!(Port::new(8080).is_ok());
        assert!(Port::new(1).is_ok());
        assert!(Port::new(65535).is_ok());
    }

    #[test]
    fn test_port_invalid() {
        assert!(Port::new(0).is_err());
    }

    #[test]
    fn test_port_pair_requires_distinct_ports() {
        let p = Port::new(8080).unwrap();
        let q = Port::new(12321).unwrap();
        assert!(PortPair::new(p, q).is_ok());
        assert!(PortPair::new(p, p).is_err());

        let pair = PortPair::new(p, q).unwrap();
        assert!(pair.contains(p));
        assert!(pair.contains(q));
        assert!(!pair.contains(Port::new(9000).unwrap()));
        assert_eq!(pair.to_string(), "(8080, 12321)");
    }

    #[test]
    fn test_process_id() {
        assert!(ProcessId::new(1).is_ok());
        assert!(ProcessId::new(0).is_err());
    }
}
