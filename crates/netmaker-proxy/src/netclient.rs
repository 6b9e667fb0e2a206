//! Overlay agent status probe
//!
//! The Netmaker agent runs in a separate container; its only observable
//! footprint here is the WireGuard interface it creates under sysfs.

use std::path::PathBuf;

use serde::Serialize;

/// Default sysfs directory listing network interfaces
pub const SYSFS_NET: &str = "/sys/class/net";

/// Interface names checked directly, in order
const CANDIDATE_INTERFACES: &[&str] = &["wg0", "netmaker", "wg1", "wg2"];

/// Name prefixes accepted when scanning the directory
const INTERFACE_PREFIXES: &[&str] = &["wg", "nm-"];

/// Result of probing for the overlay interface
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NetclientStatus {
    /// Whether an overlay interface exists
    pub running: bool,
    /// Kind of check performed
    #[serde(rename = "type")]
    pub check_type: &'static str,
    /// Interface found by name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    /// Interfaces found by scanning
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interfaces: Option<Vec<String>>,
    /// Human readable summary
    pub message: String,
}

/// Looks for overlay interfaces under a sysfs root
#[derive(Clone, Debug)]
pub struct NetclientProbe {
    sysfs_net: PathBuf,
}

impl Default for NetclientProbe {
    fn default() -> Self {
        Self::new(SYSFS_NET)
    }
}

impl NetclientProbe {
    /// Probe interfaces listed under `sysfs_net`
    pub fn new(sysfs_net: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_net: sysfs_net.into(),
        }
    }

    /// Check the candidate names, then fall back to scanning the directory
    pub fn status(&self) -> NetclientStatus {
        let mut status = NetclientStatus {
            running: false,
            check_type: "wireguard_interface_check",
            interface: None,
            interfaces: None,
            message: "Checking for WireGuard interfaces".to_string(),
        };

        if let Some(name) = CANDIDATE_INTERFACES
            .iter()
            .find(|name| self.sysfs_net.join(name).exists())
        {
            status.running = true;
            status.interface = Some(name.to_string());
            status.message = format!("WireGuard interface {name} detected");
            return status;
        }

        let Ok(entries) = std::fs::read_dir(&self.sysfs_net) else {
            return status;
        };

        let mut found: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| INTERFACE_PREFIXES.iter().any(|p| name.starts_with(p)))
            .collect();
        found.sort();

        if !found.is_empty() {
            status.running = true;
            status.message = format!("Found WireGuard interfaces: {}", found.join(", "));
            status.interfaces = Some(found);
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sysfs(interfaces: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for name in interfaces {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        dir
    }

    #[test]
    fn test_wg0_takes_priority() {
        let dir = sysfs(&["eth0", "netmaker", "wg0"]);
        let status = NetclientProbe::new(dir.path()).status();

        assert!(status.running);
        assert_eq!(status.interface.as_deref(), Some("wg0"));
        assert_eq!(status.message, "WireGuard interface wg0 detected");
    }

    #[test]
    fn test_netmaker_candidate() {
        let dir = sysfs(&["eth0", "netmaker"]);
        let status = NetclientProbe::new(dir.path()).status();
        assert_eq!(status.interface.as_deref(), Some("netmaker"));
        assert!(status.interfaces.is_none());
    }

    #[test]
    fn test_scan_matches_prefixes() {
        let dir = sysfs(&["eth0", "lo", "wg-overlay", "nm-mesh"]);
        let status = NetclientProbe::new(dir.path()).status();

        assert!(status.running);
        assert!(status.interface.is_none());
        assert_eq!(
            status.interfaces,
            Some(vec!["nm-mesh".to_string(), "wg-overlay".to_string()])
        );
    }

    #[test]
    fn test_nothing_found() {
        let dir = sysfs(&["eth0", "lo"]);
        let status = NetclientProbe::new(dir.path()).status();
        assert!(!status.running);
        assert_eq!(status.message, "Checking for WireGuard interfaces");
    }

    #[test]
    fn test_missing_sysfs_reports_not_running() {
        let status = NetclientProbe::new("/nonexistent/sys/class/net").status();
        assert!(!status.running);
    }

    #[test]
    fn test_serialized_shape() {
        let dir = sysfs(&["wg0"]);
        let json = serde_json::to_value(NetclientProbe::new(dir.path()).status()).unwrap();
        assert_eq!(json["type"], "wireguard_interface_check");
        assert_eq!(json["interface"], "wg0");
        assert!(json.get("interfaces").is_none());
    }
}
