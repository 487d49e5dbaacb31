//! # configuration
//!
//! why: describe who participates in a replication group
//! relations: carried by configuration log entries, snapshot meta, ConfigurationManager
//! what: PeerId, NodeId, Configuration (peer set), ConfigurationEntry (conf + joint old conf)

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RaftError;
use crate::log::{LogEntry, LogId};

pub type GroupId = String;

/// Group id with version, formatted as `{group_id}_{index}`
pub type VersionedGroupId = String;

/// Whether a peer keeps a full copy of the log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    #[default]
    Replica = 0,
    /// Counts toward quorum without holding the full log
    Witness = 1,
}

/// A participant in a replication group, written as `ip:port:idx:role`.
///
/// Identity is `(addr, idx)`; the role is descriptive and does not take part in
/// equality or ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId {
    pub addr: SocketAddr,
    /// Index among replicas sharing the same address
    pub idx: u32,
    pub role: Role,
}

impl PeerId {
    pub fn new(addr: SocketAddr, idx: u32) -> Self {
        Self { addr, idx, role: Role::Replica }
    }

    pub fn witness(addr: SocketAddr, idx: u32) -> Self {
        Self { addr, idx, role: Role::Witness }
    }

    pub fn is_empty(&self) -> bool {
        self.addr.ip().is_unspecified() && self.addr.port() == 0 && self.idx == 0
    }

    pub fn is_witness(&self) -> bool {
        self.role == Role::Witness
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0), 0)
    }
}

impl PartialEq for PeerId {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr && self.idx == other.idx
    }
}

impl Eq for PeerId {}

impl Hash for PeerId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr.hash(state);
        self.idx.hash(state);
    }
}

impl PartialOrd for PeerId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PeerId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.addr.cmp(&other.addr).then(self.idx.cmp(&other.idx))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.addr, self.idx, self.role as u8)
    }
}

impl FromStr for PeerId {
    type Err = RaftError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RaftError::InvalidArgument(format!("invalid peer id `{}`", s));
        let mut parts = s.trim().split(':');
        let ip: IpAddr = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        let port: u16 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        let idx: u32 = match parts.next() {
            Some(p) => p.parse().map_err(|_| invalid())?,
            None => 0,
        };
        let role = match parts.next() {
            None | Some("0") => Role::Replica,
            Some("1") => Role::Witness,
            Some(_) => return Err(invalid()),
        };
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self { addr: SocketAddr::new(ip, port), idx, role })
    }
}

impl TryFrom<String> for PeerId {
    type Error = RaftError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PeerId> for String {
    fn from(peer: PeerId) -> Self {
        peer.to_string()
    }
}

/// A raft node inside a group: `(group_id, peer_id)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId {
    pub group_id: GroupId,
    pub peer_id: PeerId,
}

impl NodeId {
    pub fn new(group_id: impl Into<GroupId>, peer_id: PeerId) -> Self {
        Self { group_id: group_id.into(), peer_id }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group_id, self.peer_id)
    }
}

/// A set of peers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    peers: BTreeSet<PeerId>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_peers<I: IntoIterator<Item = PeerId>>(peers: I) -> Self {
        Self { peers: peers.into_iter().collect() }
    }

    pub fn reset(&mut self) {
        self.peers.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerId> {
        self.peers.iter()
    }

    pub fn list_peers(&self) -> Vec<PeerId> {
        self.peers.iter().cloned().collect()
    }

    /// Returns true if the peer is newly added.
    pub fn add_peer(&mut self, peer: PeerId) -> bool {
        self.peers.insert(peer)
    }

    /// Returns true if the peer was present.
    pub fn remove_peer(&mut self, peer: &PeerId) -> bool {
        self.peers.remove(peer)
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.peers.contains(peer)
    }

    /// True if every peer in `peers` is a member.
    pub fn contains_all(&self, peers: &[PeerId]) -> bool {
        peers.iter().all(|p| self.peers.contains(p))
    }

    /// True if `peers` names exactly this set (duplicates ignored).
    pub fn equals(&self, peers: &[PeerId]) -> bool {
        let other: BTreeSet<&PeerId> = peers.iter().collect();
        other.len() == self.peers.len() && self.contains_all(peers)
    }

    /// Returns `(self - rhs, rhs - self)`.
    pub fn diffs(&self, rhs: &Configuration) -> (Configuration, Configuration) {
        let included = self.peers.difference(&rhs.peers).cloned().collect();
        let excluded = rhs.peers.difference(&self.peers).cloned().collect();
        (Configuration { peers: included }, Configuration { peers: excluded })
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for peer in &self.peers {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            write!(f, "{}", peer)?;
        }
        Ok(())
    }
}

impl FromStr for Configuration {
    type Err = RaftError;

    /// Parses a comma separated list of peer ids; blank items are skipped.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut conf = Configuration::new();
        for item in s.split(',').map(str::trim).filter(|item| !item.is_empty()) {
            conf.add_peer(item.parse()?);
        }
        Ok(conf)
    }
}

impl FromIterator<PeerId> for Configuration {
    fn from_iter<I: IntoIterator<Item = PeerId>>(iter: I) -> Self {
        Self::from_peers(iter)
    }
}

/// Membership as introduced at a given log position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationEntry {
    pub id: LogId,
    pub conf: Configuration,
    pub old_conf: Configuration,
}

impl ConfigurationEntry {
    pub fn new(id: LogId, conf: Configuration, old_conf: Configuration) -> Self {
        Self { id, conf, old_conf }
    }

    /// Builds the entry described by a configuration log entry.
    pub fn from_log_entry(entry: &LogEntry) -> Self {
        let conf = entry.peers.iter().flatten().cloned().collect();
        let old_conf = entry.old_peers.iter().flatten().cloned().collect();
        Self { id: entry.id, conf, old_conf }
    }

    /// No joint consensus in progress
    pub fn stable(&self) -> bool {
        self.old_conf.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.conf.is_empty()
    }

    /// Union of the new and old membership.
    pub fn list_peers(&self) -> BTreeSet<PeerId> {
        self.conf.iter().chain(self.old_conf.iter()).cloned().collect()
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.conf.contains(peer) || self.old_conf.contains(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(s: &str) -> PeerId {
        s.parse().unwrap()
    }

    #[test]
    fn peer_id_parses_full_and_short_forms() {
        let p = peer("1.1.1.1:1000:2:1");
        assert_eq!(p.addr.port(), 1000);
        assert_eq!(p.idx, 2);
        assert!(p.is_witness());

        let short = peer("1.1.1.1:1000");
        assert_eq!(short.idx, 0);
        assert!(!short.is_witness());
        assert_eq!(short.to_string(), "1.1.1.1:1000:0:0");
    }

    #[test]
    fn peer_id_rejects_garbage() {
        assert!("1.1.1.1".parse::<PeerId>().is_err());
        assert!("host:port".parse::<PeerId>().is_err());
        assert!("1.1.1.1:1000:0:7".parse::<PeerId>().is_err());
    }

    #[test]
    fn role_does_not_affect_identity() {
        assert_eq!(peer("1.1.1.1:1000:0:0"), peer("1.1.1.1:1000:0:1"));
        assert_ne!(peer("1.1.1.1:1000:0"), peer("1.1.1.1:1000:1"));
        assert!(PeerId::default().is_empty());
    }

    #[test]
    fn peer_id_serializes_as_string() {
        let json = serde_json::to_string(&peer("10.0.0.1:8100:1")).unwrap();
        assert_eq!(json, "\"10.0.0.1:8100:1:0\"");
        let back: PeerId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, peer("10.0.0.1:8100:1"));
    }

    #[test]
    fn configuration_diffs() {
        let a: Configuration = "1.1.1.1:1,1.1.1.1:2,1.1.1.1:3".parse().unwrap();
        let b: Configuration = "1.1.1.1:2,1.1.1.1:3,1.1.1.1:4".parse().unwrap();
        let (included, excluded) = a.diffs(&b);
        assert_eq!(included.list_peers(), vec![peer("1.1.1.1:1")]);
        assert_eq!(excluded.list_peers(), vec![peer("1.1.1.1:4")]);
    }

    #[test]
    fn configuration_equals_ignores_order_and_duplicates() {
        let conf: Configuration = "1.1.1.1:1,1.1.1.1:2".parse().unwrap();
        assert!(conf.equals(&[peer("1.1.1.1:2"), peer("1.1.1.1:1"), peer("1.1.1.1:2")]));
        assert!(!conf.equals(&[peer("1.1.1.1:1")]));
        assert!(conf.contains_all(&[peer("1.1.1.1:1")]));
    }

    #[test]
    fn configuration_round_trips_through_display() {
        let conf: Configuration = " 1.1.1.1:1 , 1.1.1.1:2:1 ,".parse().unwrap();
        assert_eq!(conf.len(), 2);
        let again: Configuration = conf.to_string().parse().unwrap();
        assert_eq!(conf, again);
    }

    #[test]
    fn entry_is_stable_without_old_conf() {
        let mut entry = ConfigurationEntry::default();
        entry.conf.add_peer(peer("1.1.1.1:1"));
        assert!(entry.stable());
        entry.old_conf.add_peer(peer("1.1.1.1:2"));
        assert!(!entry.stable());
        assert_eq!(entry.list_peers().len(), 2);
        assert!(entry.contains(&peer("1.1.1.1:2")));
    }
}
