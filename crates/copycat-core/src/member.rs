//! Cluster Addresses and Member Identity
//!
//! A member is identified on the wire by a `u64` id derived from its address
//! with a fixed FNV-1a hash. The hash algorithm is part of the protocol
//! contract: two processes must compute the same id for the same address, so
//! the std `DefaultHasher` (randomly seeded per process) cannot be used.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A `(host, port)` pair identifying a cluster member or client endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Stable member id for this address.
    pub fn id(&self) -> u64 {
        fnv1a(format!("{}:{}", self.host, self.port).as_bytes())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl std::str::FromStr for Address {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| crate::Error::invalid(format!("address missing port: {s}")))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| crate::Error::invalid(format!("invalid port in address: {s}")))?;
        Ok(Address::new(host, port))
    }
}

/// Whether a member participates in elections and commitment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberKind {
    /// Voting participant.
    Active,
    /// Non-voting replica (learner).
    Passive,
}

/// A cluster member: an address plus its voting kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub address: Address,
    pub kind: MemberKind,
}

impl Member {
    pub fn active(address: Address) -> Self {
        Self {
            address,
            kind: MemberKind::Active,
        }
    }

    pub fn passive(address: Address) -> Self {
        Self {
            address,
            kind: MemberKind::Passive,
        }
    }

    pub fn id(&self) -> u64 {
        self.address.id()
    }
}

/// 64-bit FNV-1a. Stable across processes and platforms.
fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}
