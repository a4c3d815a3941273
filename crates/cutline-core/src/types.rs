//! Strong type definitions for Cutline.
//!
//! Identifiers are newtypes so an endpoint can never be confused with a
//! snapshot id at a call site.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// Network identity of a node: the address its transport listens on.
///
/// Equality and hashing are structural, so an `Endpoint` is used directly as
/// a map key for links and per-sender message logs.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Create an endpoint from a host name (or address) and a port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The host part.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port part.
    pub const fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Endpoint({}:{})", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = CoreError;

    /// Parse `host:port`. The port is taken after the last colon.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| CoreError::InvalidEndpoint(format!("missing port in {s:?}")))?;
        if host.is_empty() {
            return Err(CoreError::InvalidEndpoint(format!("missing host in {s:?}")));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| CoreError::InvalidEndpoint(format!("bad port in {s:?}: {e}")))?;
        Ok(Self::new(host, port))
    }
}

/// Identifier of one global snapshot.
///
/// Derived as the first 8 bytes of `Blake3(domain || host || port || counter)`
/// where `counter` is the initiator's local, monotonically increasing
/// snapshot counter. Uniqueness is best-effort: two initiators colliding on
/// 64 bits is not guarded against.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotId(pub u64);

impl SnapshotId {
    /// Derive the id of the `counter`-th snapshot initiated by `initiator`.
    pub fn derive(initiator: &Endpoint, counter: u64) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"cutline-snapshot-v0:");
        hasher.update(initiator.host().as_bytes());
        hasher.update(b":");
        hasher.update(&initiator.port().to_be_bytes());
        hasher.update(b":");
        hasher.update(&counter.to_be_bytes());
        let digest = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest.as_bytes()[..8]);
        Self(u64::from_be_bytes(head))
    }

    /// Create from a raw value.
    pub const fn from_u64(value: u64) -> Self {
        Self(value)
    }

    /// The raw value.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Convert to a 16-character hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_be_bytes())
    }

    /// Parse from a 16-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, CoreError> {
        let bytes = hex::decode(s).map_err(|e| CoreError::InvalidSnapshotId(e.to_string()))?;
        let arr: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CoreError::InvalidSnapshotId(format!("expected 8 bytes, got {}", bytes.len())))?;
        Ok(Self(u64::from_be_bytes(arr)))
    }
}

impl fmt::Debug for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SnapshotId({})", self.to_hex())
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<u64> for SnapshotId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_endpoint_display_and_parse() {
        let ep = Endpoint::new("localhost", 11111);
        assert_eq!(ep.to_string(), "localhost:11111");
        let parsed: Endpoint = "localhost:11111".parse().unwrap();
        assert_eq!(parsed, ep);
    }

    #[test]
    fn test_endpoint_parse_rejects_garbage() {
        assert!("localhost".parse::<Endpoint>().is_err());
        assert!(":80".parse::<Endpoint>().is_err());
        assert!("host:99999".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_endpoint_parse_ipv6_uses_last_colon() {
        let ep: Endpoint = "::1:8080".parse().unwrap();
        assert_eq!(ep.host(), "::1");
        assert_eq!(ep.port(), 8080);
    }

    #[test]
    fn test_snapshot_id_depends_on_counter_and_initiator() {
        let a = Endpoint::new("localhost", 1);
        let b = Endpoint::new("localhost", 2);
        assert_ne!(SnapshotId::derive(&a, 0), SnapshotId::derive(&a, 1));
        assert_ne!(SnapshotId::derive(&a, 0), SnapshotId::derive(&b, 0));
    }

    #[test]
    fn test_snapshot_id_hex_roundtrip() {
        let id = SnapshotId::from_u64(0xdead_beef_0102_0304);
        assert_eq!(id.to_hex(), "deadbeef01020304");
        assert_eq!(SnapshotId::from_hex(&id.to_hex()).unwrap(), id);
        assert!(SnapshotId::from_hex("abcd").is_err());
    }

    proptest! {
        #[test]
        fn test_snapshot_id_deterministic(host in "[a-z]{1,12}", port: u16, counter: u64) {
            let ep = Endpoint::new(host, port);
            prop_assert_eq!(SnapshotId::derive(&ep, counter), SnapshotId::derive(&ep, counter));
        }
    }
}
