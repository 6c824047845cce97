//! # Super-Node Roster
//!
//! The static list of super nodes every participant agrees on. It is read
//! once at bootstrap and never changes while the node runs.
//!
//! File format, keyed by the node code:
//!
//! ```json
//! {
//!   "1": { "ip": "10.0.0.1", "address": "9f2c…" },
//!   "2": { "ip": "10.0.0.2", "address": "51ab…" }
//! }
//! ```
//!
//! `address` is the hex-encoded stake address the node mines with.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum RosterError {
    #[error("failed to read roster: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid roster json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid roster entry {code}: {reason}")]
    InvalidEntry { code: String, reason: String },
}

/// One super node as listed in the roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperNodeRecord {
    pub code: i32,
    pub ip: String,
    pub stake_address: Vec<u8>,
}

impl SuperNodeRecord {
    pub fn stake_address_hex(&self) -> String {
        hex::encode(&self.stake_address)
    }
}

#[derive(Deserialize)]
struct RawEntry {
    ip: String,
    #[serde(default)]
    address: String,
}

#[derive(Debug, Clone, Default)]
pub struct SuperNodeRoster {
    by_ip: HashMap<String, SuperNodeRecord>,
    // Roster order (by code), used wherever iteration order matters.
    order: Vec<String>,
}

impl SuperNodeRoster {
    pub fn new(records: Vec<SuperNodeRecord>) -> Self {
        let mut records = records;
        records.sort_by_key(|r| r.code);
        let order = records.iter().map(|r| r.ip.clone()).collect();
        let by_ip = records.into_iter().map(|r| (r.ip.clone(), r)).collect();
        Self { by_ip, order }
    }

    pub fn from_json(raw: &str) -> Result<Self, RosterError> {
        let entries: BTreeMap<String, RawEntry> = serde_json::from_str(raw)?;
        let mut records = Vec::with_capacity(entries.len());
        for (code, entry) in entries {
            let parsed_code = code.parse::<i32>().map_err(|e| RosterError::InvalidEntry {
                code: code.clone(),
                reason: e.to_string(),
            })?;
            if entry.ip.parse::<std::net::IpAddr>().is_err() {
                return Err(RosterError::InvalidEntry {
                    code,
                    reason: format!("bad ip {:?}", entry.ip),
                });
            }
            let stake_address =
                hex::decode(entry.address.trim()).map_err(|e| RosterError::InvalidEntry {
                    code: code.clone(),
                    reason: e.to_string(),
                })?;
            records.push(SuperNodeRecord {
                code: parsed_code,
                ip: entry.ip,
                stake_address,
            });
        }
        Ok(Self::new(records))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, RosterError> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    pub fn contains(&self, ip: &str) -> bool {
        self.by_ip.contains_key(ip)
    }

    pub fn get(&self, ip: &str) -> Option<&SuperNodeRecord> {
        self.by_ip.get(ip)
    }

    /// Roster IPs in code order.
    pub fn ips(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn records(&self) -> Vec<SuperNodeRecord> {
        self.order
            .iter()
            .filter_map(|ip| self.by_ip.get(ip).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROSTER: &str = r#"{
        "2": { "ip": "10.0.0.2", "address": "bbbb" },
        "1": { "ip": "10.0.0.1", "address": "aaaa" },
        "10": { "ip": "10.0.0.10", "address": "" }
    }"#;

    #[test]
    fn parses_and_orders_by_code() {
        let roster = SuperNodeRoster::from_json(ROSTER).unwrap();
        assert_eq!(roster.len(), 3);
        assert_eq!(roster.ips(), vec!["10.0.0.1", "10.0.0.2", "10.0.0.10"]);
        let rec = roster.get("10.0.0.2").unwrap();
        assert_eq!(rec.code, 2);
        assert_eq!(rec.stake_address, vec![0xbb, 0xbb]);
        assert_eq!(rec.stake_address_hex(), "bbbb");
        assert!(roster.get("10.0.0.10").unwrap().stake_address.is_empty());
    }

    #[test]
    fn contains_checks_ip() {
        let roster = SuperNodeRoster::from_json(ROSTER).unwrap();
        assert!(roster.contains("10.0.0.1"));
        assert!(!roster.contains("10.0.0.3"));
    }

    #[test]
    fn rejects_bad_code_ip_and_address() {
        assert!(matches!(
            SuperNodeRoster::from_json(r#"{ "x": { "ip": "10.0.0.1" } }"#),
            Err(RosterError::InvalidEntry { .. })
        ));
        assert!(SuperNodeRoster::from_json(r#"{ "1": { "ip": "nope" } }"#).is_err());
        assert!(
            SuperNodeRoster::from_json(r#"{ "1": { "ip": "10.0.0.1", "address": "zz" } }"#)
                .is_err()
        );
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("super_nodes.json");
        fs::write(&path, ROSTER).unwrap();
        let roster = SuperNodeRoster::load(&path).unwrap();
        assert_eq!(roster.records().len(), 3);
    }
}
