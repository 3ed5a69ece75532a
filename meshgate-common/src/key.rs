//! Device key types.
//!
//! A machine key identifies one agent install and survives logout/login.
//! A node key belongs to a single login session and is replaced every time
//! the device authenticates again.

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Length of the raw key material in bytes.
pub const KEY_LEN: usize = 32;

const MACHINE_KEY_PREFIX: &str = "mkey:";
const NODE_KEY_PREFIX: &str = "nodekey:";

/// Errors produced when parsing a key from its text form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("Key is empty")]
    Empty,
    #[error("Missing '{0}' prefix")]
    MissingPrefix(&'static str),
    #[error("Invalid hex: {0}")]
    InvalidHex(String),
    #[error("Expected {expected} bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },
}

fn parse_key(s: &str, prefix: &'static str) -> Result<[u8; KEY_LEN], KeyError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(KeyError::Empty);
    }
    let hex_part = s
        .strip_prefix(prefix)
        .ok_or(KeyError::MissingPrefix(prefix))?;
    let bytes = hex::decode(hex_part).map_err(|e| KeyError::InvalidHex(e.to_string()))?;
    if bytes.len() != KEY_LEN {
        return Err(KeyError::InvalidLength {
            expected: KEY_LEN,
            got: bytes.len(),
        });
    }
    let mut out = [0u8; KEY_LEN];
    out.copy_from_slice(&bytes);
    Ok(out)
}

fn random_key() -> [u8; KEY_LEN] {
    let mut bytes = [0u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Long-lived identifier of a device install.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MachineKey([u8; KEY_LEN]);

impl MachineKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh machine key, as a newly installed agent would.
    pub fn generate() -> Self {
        Self(random_key())
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Short form for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for MachineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", MACHINE_KEY_PREFIX, hex::encode(self.0))
    }
}

impl FromStr for MachineKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_key(s, MACHINE_KEY_PREFIX).map(Self)
    }
}

impl TryFrom<String> for MachineKey {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MachineKey> for String {
    fn from(key: MachineKey) -> Self {
        key.to_string()
    }
}

/// Per-session key, rotated on every successful login.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeKey([u8; KEY_LEN]);

impl NodeKey {
    pub fn generate() -> Self {
        Self(random_key())
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", NODE_KEY_PREFIX, hex::encode(self.0))
    }
}

impl FromStr for NodeKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_key(s, NODE_KEY_PREFIX).map(Self)
    }
}

impl TryFrom<String> for NodeKey {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NodeKey> for String {
    fn from(key: NodeKey) -> Self {
        key.to_string()
    }
}
