//! Identity Mapping Store
//!
//! Maps an overlay source IP to the Kubernetes identity the proxy impersonates
//! for requests from that IP. Entries live only in memory.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize};

/// Identity assigned to an overlay source IP
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMapping {
    /// Kubernetes user name to impersonate
    pub user: String,
    /// Kubernetes groups to impersonate
    #[serde(default, deserialize_with = "null_as_default")]
    pub groups: Vec<String>,
}

/// Decode an explicit JSON `null` as the type's default
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl UserMapping {
    /// Create a mapping
    pub fn new(user: impl Into<String>, groups: Vec<String>) -> Self {
        Self {
            user: user.into(),
            groups,
        }
    }
}

/// Concurrency-safe table of IP to identity mappings
///
/// Reads take a shared lock, writes an exclusive one. Keys are used verbatim.
#[derive(Debug, Default)]
pub struct UserMappingStore {
    entries: RwLock<HashMap<String, UserMapping>>,
}

impl UserMappingStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the mapping for `ip`
    pub fn set(&self, ip: impl Into<String>, mapping: UserMapping) {
        self.entries.write().insert(ip.into(), mapping);
    }

    /// Look up the mapping for `ip`
    pub fn get(&self, ip: &str) -> Option<UserMapping> {
        self.entries.read().get(ip).cloned()
    }

    /// Remove the mapping for `ip`; absent keys are ignored
    pub fn remove(&self, ip: &str) {
        self.entries.write().remove(ip);
    }

    /// Snapshot of every mapping
    pub fn all(&self) -> HashMap<String, UserMapping> {
        self.entries.read().clone()
    }

    /// Number of mappings
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the store has no mappings
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
