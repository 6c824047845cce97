//! # Peer Table
//!
//! Normal nodes remember the peers they have met, each with a trust
//! counter. A successful connect raises trust (up to a cap), a failed one
//! lowers it, and a peer whose trust reaches zero is forgotten. The table is
//! kept as a JSON object `{ "ip": trust }` so a restarted node can rejoin
//! without going back through the super nodes.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::config;

/// Peer IP → trust.
pub type PeerMap = BTreeMap<String, u32>;

pub struct PeerTable {
    peers: RwLock<PeerMap>,
    path: Option<PathBuf>,
    max_trust: u32,
}

impl PeerTable {
    /// A table that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            peers: RwLock::new(PeerMap::new()),
            path: None,
            max_trust: config::MAX_PEER_TRUST,
        }
    }

    /// Loads the table at `path`. A missing file is an empty table; a corrupt
    /// one is logged and treated as empty.
    pub fn load<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let peers = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str::<PeerMap>(&raw).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "peer table unreadable, starting empty");
                PeerMap::new()
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => PeerMap::new(),
            Err(e) => return Err(e),
        };
        debug!(path = %path.display(), peers = peers.len(), "peer table loaded");
        Ok(Self {
            peers: RwLock::new(peers),
            path: Some(path),
            max_trust: config::MAX_PEER_TRUST,
        })
    }

    pub fn with_max_trust(mut self, max_trust: u32) -> Self {
        self.max_trust = max_trust.max(1);
        self
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    pub fn trust(&self, ip: &str) -> Option<u32> {
        self.peers.read().get(ip).copied()
    }

    /// Adds peers we do not know yet. Known peers keep their own trust.
    /// Zero-trust entries are ignored. Returns how many were added.
    pub fn merge<I>(&self, peers: I) -> usize
    where
        I: IntoIterator<Item = (String, u32)>,
    {
        let mut table = self.peers.write();
        let mut added = 0;
        for (ip, trust) in peers {
            if trust == 0 || table.contains_key(&ip) {
                continue;
            }
            table.insert(ip, trust.min(self.max_trust));
            added += 1;
        }
        added
    }

    /// Raises trust for `ip`, inserting it if unknown. Returns the new trust.
    pub fn record_success(&self, ip: &str) -> u32 {
        let mut table = self.peers.write();
        let trust = table.entry(ip.to_string()).or_insert(0);
        *trust = (*trust + 1).min(self.max_trust);
        *trust
    }

    /// Lowers trust for `ip`. Returns `None` once the peer has been evicted.
    pub fn record_failure(&self, ip: &str) -> Option<u32> {
        let mut table = self.peers.write();
        let trust = table.get_mut(ip)?;
        *trust = trust.saturating_sub(1);
        if *trust == 0 {
            table.remove(ip);
            debug!(peer = ip, "peer evicted from table");
            None
        } else {
            Some(*trust)
        }
    }

    pub fn remove(&self, ip: &str) -> bool {
        self.peers.write().remove(ip).is_some()
    }

    /// Peers worth dialing, most trusted first.
    pub fn candidates(&self) -> Vec<(String, u32)> {
        let mut peers: Vec<(String, u32)> = self
            .peers
            .read()
            .iter()
            .filter(|(_, trust)| **trust > 0)
            .map(|(ip, trust)| (ip.clone(), *trust))
            .collect();
        peers.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        peers
    }

    pub fn snapshot(&self) -> HashMap<String, u32> {
        self.peers
            .read()
            .iter()
            .map(|(ip, trust)| (ip.clone(), *trust))
            .collect()
    }

    /// Writes the table to its file, if it has one. Goes through a temporary
    /// file and a rename so a crash never leaves a half-written table.
    pub fn save(&self) -> io::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_vec_pretty(&*self.peers.read())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        debug!(path = %path.display(), "peer table saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_raises_trust_up_to_cap() {
        let table = PeerTable::in_memory().with_max_trust(3);
        assert_eq!(table.record_success("10.0.0.2"), 1);
        assert_eq!(table.record_success("10.0.0.2"), 2);
        assert_eq!(table.record_success("10.0.0.2"), 3);
        assert_eq!(table.record_success("10.0.0.2"), 3);
    }

    #[test]
    fn failure_evicts_at_zero() {
        let table = PeerTable::in_memory();
        table.merge([("10.0.0.2".to_string(), 2)]);
        assert_eq!(table.record_failure("10.0.0.2"), Some(1));
        assert_eq!(table.record_failure("10.0.0.2"), None);
        assert!(table.trust("10.0.0.2").is_none());
        assert_eq!(table.record_failure("10.0.0.2"), None);
    }

    #[test]
    fn merge_keeps_existing_trust_and_skips_zero() {
        let table = PeerTable::in_memory();
        table.record_success("10.0.0.2");
        table.record_success("10.0.0.2");
        let added = table.merge([
            ("10.0.0.2".to_string(), 1),
            ("10.0.0.3".to_string(), 1),
            ("10.0.0.4".to_string(), 0),
        ]);
        assert_eq!(added, 1);
        assert_eq!(table.trust("10.0.0.2"), Some(2));
        assert_eq!(table.trust("10.0.0.3"), Some(1));
        assert_eq!(table.trust("10.0.0.4"), None);
    }

    #[test]
    fn candidates_ordered_by_trust() {
        let table = PeerTable::in_memory();
        table.merge([
            ("10.0.0.2".to_string(), 1),
            ("10.0.0.3".to_string(), 5),
            ("10.0.0.4".to_string(), 3),
        ]);
        let ips: Vec<String> = table.candidates().into_iter().map(|(ip, _)| ip).collect();
        assert_eq!(ips, vec!["10.0.0.3", "10.0.0.4", "10.0.0.2"]);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("peers.json");
        let table = PeerTable::load(&path).unwrap();
        assert!(table.is_empty());
        table.record_success("10.0.0.2");
        table.record_success("10.0.0.3");
        table.record_success("10.0.0.3");
        table.save().unwrap();

        let reloaded = PeerTable::load(&path).unwrap();
        assert_eq!(reloaded.trust("10.0.0.2"), Some(1));
        assert_eq!(reloaded.trust("10.0.0.3"), Some(2));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");
        fs::write(&path, "[not a map").unwrap();
        let table = PeerTable::load(&path).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn in_memory_save_is_noop() {
        let table = PeerTable::in_memory();
        table.record_success("10.0.0.2");
        assert!(table.save().is_ok());
    }
}
