//! External collaborators driven by the persistence worker.
//!
//! - [`NeighborSource`] reads the local neighbor (ARP) cache.
//! - [`VendorLookup`] maps a hardware address to its vendor.
//! - [`GravitySource`] detects blocklist changes and rebuilds the blocklist.
//!
//! Each has one production implementation here; tests supply their own.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::debug;

use crate::error::SourceError;
use crate::model::NeighborEntry;

/// Default location of the kernel neighbor table on Linux.
pub const PROC_NET_ARP: &str = "/proc/net/arp";

/// Source of neighbor-cache entries.
pub trait NeighborSource: Send {
    /// Returns every complete entry currently in the cache.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Read`] if the cache cannot be read.
    fn neighbors(&self) -> Result<Vec<NeighborEntry>, SourceError>;
}

/// Reads the neighbor cache from a `/proc/net/arp`-formatted file.
#[derive(Debug, Clone)]
pub struct ProcNeighborSource {
    path: PathBuf,
}

impl ProcNeighborSource {
    /// Reads from `path` instead of [`PROC_NET_ARP`].
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl Default for ProcNeighborSource {
    fn default() -> Self {
        Self::new(PROC_NET_ARP)
    }
}

impl NeighborSource for ProcNeighborSource {
    fn neighbors(&self) -> Result<Vec<NeighborEntry>, SourceError> {
        let text = std::fs::read_to_string(&self.path).map_err(|e| SourceError::Read {
            what: "neighbor cache",
            path: self.path.clone(),
            source: e,
        })?;
        Ok(parse_arp_table(&text))
    }
}

/// Parses `/proc/net/arp` text.
///
/// The header line is skipped, as are incomplete entries (flags `0x0`) and
/// entries with an all-zero hardware address.
///
/// # Examples
///
/// ```rust
/// use sinkhole::sources::parse_arp_table;
///
/// let text = "IP address       HW type     Flags       HW address            Mask     Device\n\
///             192.168.1.1      0x1         0x2         AA:BB:CC:DD:EE:FF     *        eth0\n";
/// let entries = parse_arp_table(text);
/// assert_eq!(entries.len(), 1);
/// assert_eq!(entries[0].hwaddr, "aa:bb:cc:dd:ee:ff");
/// ```
pub fn parse_arp_table(text: &str) -> Vec<NeighborEntry> {
    text.lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let [ip, _hw_type, flags, hwaddr, _mask, device] = fields.as_slice() else {
                return None;
            };
            if *flags == "0x0" || *hwaddr == "00:00:00:00:00:00" {
                return None;
            }
            Some(NeighborEntry {
                ip: (*ip).to_string(),
                hwaddr: hwaddr.to_ascii_lowercase(),
                interface: (*device).to_string(),
            })
        })
        .collect()
}

/// Maps hardware addresses to vendor names.
pub trait VendorLookup: Send + Sync {
    /// Returns the vendor owning `hwaddr`, if known.
    fn vendor(&self, hwaddr: &str) -> Option<String>;
}

/// Vendor table keyed by OUI (first three octets, `aa:bb:cc`).
#[derive(Debug, Clone, Default)]
pub struct StaticVendorLookup {
    prefixes: HashMap<String, String>,
}

impl StaticVendorLookup {
    /// Builds a table from `(oui, vendor)` pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let prefixes = pairs
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_ascii_lowercase(), v.into()))
            .collect();
        Self { prefixes }
    }

    /// Number of known prefixes.
    pub fn len(&self) -> usize {
        self.prefixes.len()
    }

    /// Returns true if the table has no prefixes.
    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }
}

impl VendorLookup for StaticVendorLookup {
    fn vendor(&self, hwaddr: &str) -> Option<String> {
        let oui = hwaddr.get(..8)?.to_ascii_lowercase();
        self.prefixes.get(&oui).cloned()
    }
}

/// Blocklist collaborator.
pub trait GravitySource: Send {
    /// Returns true if the blocklist changed since the last reload.
    fn changed(&mut self) -> bool;

    /// Rebuilds the blocklist and returns how many domains it blocks.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if the blocklist cannot be rebuilt.
    fn reload(&mut self) -> Result<u64, SourceError>;
}

/// A blocklist kept as a plain text file, one domain per line.
///
/// Changes are detected through the file's modification time. Empty lines and
/// lines starting with `#` are not counted.
#[derive(Debug, Clone)]
pub struct FileGravitySource {
    path: PathBuf,
    loaded: Option<SystemTime>,
}

impl FileGravitySource {
    /// Watches the blocklist at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            loaded: None,
        }
    }

    fn modified(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.path).and_then(|m| m.modified()).ok()
    }
}

impl GravitySource for FileGravitySource {
    fn changed(&mut self) -> bool {
        match self.modified() {
            Some(modified) => self.loaded != Some(modified),
            None => false,
        }
    }

    fn reload(&mut self) -> Result<u64, SourceError> {
        let modified = self.modified();
        let text = std::fs::read_to_string(&self.path).map_err(|e| SourceError::Read {
            what: "blocklist",
            path: self.path.clone(),
            source: e,
        })?;
        let domains = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .count() as u64;
        self.loaded = modified;
        debug!(domains, path = %self.path.display(), "blocklist reloaded");
        Ok(domains)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const ARP: &str = "\
IP address       HW type     Flags       HW address            Mask     Device
192.168.1.1      0x1         0x2         aa:bb:cc:dd:ee:ff     *        eth0
192.168.1.7      0x1         0x0         00:00:00:00:00:00     *        eth0
192.168.1.9      0x1         0x2         11:22:33:44:55:66     *        wlan0
garbage line
";

    #[test]
    fn test_parse_arp_table() {
        let entries = parse_arp_table(ARP);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].ip, "192.168.1.1");
        assert_eq!(entries[1].interface, "wlan0");
    }

    #[test]
    fn test_proc_source_missing_file() {
        let dir = tempdir().unwrap();
        let source = ProcNeighborSource::new(dir.path().join("arp"));
        assert!(matches!(source.neighbors(), Err(SourceError::Read { .. })));
    }

    #[test]
    fn test_proc_source_reads_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("arp");
        std::fs::write(&path, ARP).unwrap();
        let source = ProcNeighborSource::new(&path);
        assert_eq!(source.neighbors().unwrap().len(), 2);
    }

    #[test]
    fn test_vendor_lookup_by_oui() {
        let vendors = StaticVendorLookup::from_pairs([("AA:BB:CC", "Acme")]);
        assert_eq!(vendors.vendor("aa:bb:cc:01:02:03").as_deref(), Some("Acme"));
        assert_eq!(vendors.vendor("AA:BB:CC:01:02:03").as_deref(), Some("Acme"));
        assert!(vendors.vendor("aa:bb").is_none());
        assert!(vendors.vendor("00:11:22:33:44:55").is_none());
    }

    #[test]
    fn test_file_gravity_detects_change() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gravity.list");
        let mut gravity = FileGravitySource::new(&path);
        assert!(!gravity.changed());

        std::fs::write(&path, "# header\nads.example\n\ntracker.example\n").unwrap();
        assert!(gravity.changed());
        assert_eq!(gravity.reload().unwrap(), 2);
        assert!(!gravity.changed());
    }
}
