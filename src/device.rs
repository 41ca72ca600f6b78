//! Identity of a discoverable hand.

use std::hash::{Hash, Hasher};

/// Transport address plus the advertised name, if any.
///
/// Two identities are equal when their addresses are equal; the name is
/// informational only.
#[derive(Debug, Clone, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceIdentity {
    address: String,
    name: Option<String>,
}

impl DeviceIdentity {
    /// Create an identity.
    pub fn new(address: impl Into<String>, name: Option<String>) -> Self {
        Self {
            address: address.into(),
            name,
        }
    }

    /// The transport address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The advertised name.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The name if advertised, otherwise the address.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }
}

impl PartialEq for DeviceIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Hash for DeviceIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl std::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.address),
            None => write!(f, "{}", self.address),
        }
    }
}
