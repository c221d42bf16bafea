//! Core data model for the monitoring pipeline
//!
//! All types use camelCase JSON serialization so alert payloads keep the
//! field names report subscribers already understand (`originAs`,
//! `matchedRule`, `ignoreMorespecifics`, ...).

use crate::error::{Result, WatchError};
use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::str::FromStr;

/// A CIDR prefix in canonical form (host bits cleared)
///
/// Serializes as its string form, e.g. `"180.50.120.0/21"`.
#[derive(Debug, Clone, Copy)]
pub struct Prefix(IpNetwork);

impl Prefix {
    /// Build a canonical prefix from an address and mask length
    pub fn new(addr: IpAddr, len: u8) -> Result<Self> {
        let net = IpNetwork::new(addr, len)
            .map_err(|e| WatchError::InvalidPrefix(format!("{}/{}: {}", addr, len, e)))?;
        let canonical = IpNetwork::new(net.network(), len)
            .map_err(|e| WatchError::InvalidPrefix(format!("{}/{}: {}", addr, len, e)))?;
        Ok(Self(canonical))
    }

    /// Network address
    pub fn network(&self) -> IpAddr {
        self.0.network()
    }

    /// Mask length
    pub fn len(&self) -> u8 {
        self.0.prefix()
    }

    pub fn is_ipv4(&self) -> bool {
        self.0.is_ipv4()
    }

    /// True if `self` is strictly contained in `other` (longer mask, same family)
    pub fn is_more_specific_of(&self, other: &Prefix) -> bool {
        self.is_ipv4() == other.is_ipv4()
            && self.len() > other.len()
            && other.0.contains(self.network())
    }

    fn key(&self) -> (IpAddr, u8) {
        (self.network(), self.len())
    }
}

impl PartialEq for Prefix {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Prefix {}

impl Hash for Prefix {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl PartialOrd for Prefix {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Prefix {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl FromStr for Prefix {
    type Err = WatchError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if !trimmed.contains('/') {
            return Err(WatchError::InvalidPrefix(s.to_string()));
        }
        let net = IpNetwork::from_str(trimmed)
            .map_err(|e| WatchError::InvalidPrefix(format!("{}: {}", s, e)))?;
        Prefix::new(net.ip(), net.prefix())
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.len())
    }
}

impl Serialize for Prefix {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Prefix {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Kind of routing update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Announcement,
    Withdrawal,
}

/// Canonical routing event produced by a normalizer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingEvent {
    /// Announcement or withdrawal
    #[serde(rename = "type")]
    pub kind: EventKind,

    /// Announced or withdrawn prefix
    pub prefix: Prefix,

    /// Origin AS (last element of the path); absent on withdrawals
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_as: Option<u32>,

    /// AS path in path order (origin last)
    #[serde(default)]
    pub path: Vec<u32>,

    /// Peer the update was received from
    pub peer: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_hop: Option<String>,

    /// Unix timestamp in milliseconds
    #[serde(default)]
    pub timestamp: u64,
}

impl RoutingEvent {
    /// Create an announcement; the origin is taken from the end of the path
    pub fn announcement(
        prefix: Prefix,
        path: Vec<u32>,
        peer: impl Into<String>,
        next_hop: Option<String>,
    ) -> Self {
        Self {
            kind: EventKind::Announcement,
            prefix,
            origin_as: path.last().copied(),
            path,
            peer: peer.into(),
            next_hop,
            timestamp: now_millis(),
        }
    }

    /// Create a withdrawal
    pub fn withdrawal(prefix: Prefix, peer: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Withdrawal,
            prefix,
            origin_as: None,
            path: Vec::new(),
            peer: peer.into(),
            next_hop: None,
            timestamp: now_millis(),
        }
    }

    /// Override the event timestamp
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn is_announcement(&self) -> bool {
        self.kind == EventKind::Announcement
    }
}

/// A monitored prefix and its authorization policy
///
/// Identified by `(prefix, user)`. Never mutated after load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrefixRule {
    pub prefix: Prefix,

    /// Authorized origin ASNs; the first one is the primary owner
    pub asn: Vec<u32>,

    /// Skip more-specific announcements under this prefix
    pub ignore_morespecifics: bool,

    /// Owner tag
    pub user: String,

    pub description: String,
}

impl PrefixRule {
    /// True iff `origin_as` is one of the authorized ASNs
    pub fn is_authorized(&self, origin_as: u32) -> bool {
        self.asn.contains(&origin_as)
    }

    /// The legitimate owner reported as `affected` in alerts
    pub fn primary_asn(&self) -> u32 {
        self.asn.first().copied().unwrap_or_default()
    }

    /// Authorized ASNs rendered as `AS1, AS2`
    pub fn asn_label(&self) -> String {
        self.asn
            .iter()
            .map(|a| format!("AS{}", a))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// A policy record as supplied by an external loader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrefixRecord {
    #[serde(deserialize_with = "one_or_many")]
    pub asn: Vec<u32>,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub ignore_morespecifics: bool,

    pub prefix: String,

    #[serde(default = "default_user")]
    pub user: String,
}

fn default_user() -> String {
    "default".to_string()
}

impl PrefixRecord {
    /// Validate the record and turn it into an immutable rule
    pub fn into_rule(self) -> Result<PrefixRule> {
        let prefix: Prefix = self.prefix.parse().map_err(|e: WatchError| WatchError::InvalidRule {
            prefix: self.prefix.clone(),
            reason: e.to_string(),
        })?;
        if self.asn.is_empty() {
            return Err(WatchError::InvalidRule {
                prefix: self.prefix,
                reason: "no authorized origin ASN".to_string(),
            });
        }
        if self.user.trim().is_empty() {
            return Err(WatchError::InvalidRule {
                prefix: self.prefix,
                reason: "empty user".to_string(),
            });
        }
        Ok(PrefixRule {
            prefix,
            asn: self.asn,
            ignore_morespecifics: self.ignore_morespecifics,
            user: self.user,
            description: self.description,
        })
    }
}

/// Accept either `asn: 4713` or `asn: [4713, 2914]`
fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(u32),
        Many(Vec<u32>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(a) => vec![a],
        OneOrMany::Many(v) => v,
    })
}

/// Evidence attached to an incident and accumulated in an alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evidence {
    pub matched_message: RoutingEvent,
    pub matched_rule: PrefixRule,
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A candidate alert produced by a detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    /// Deterministic incident key, detector-defined
    pub id: String,

    /// Bus channel the resulting alert is published on
    pub channel: String,

    /// Name of the detector that raised it
    pub origin: String,

    /// Legitimate owner ASN
    pub affected: u32,

    pub message: String,

    pub evidence: Evidence,

    pub timestamp: DateTime<Utc>,
}

/// Aggregated alert owned by the lifecycle manager
///
/// Every entry in `data` belongs to the same incident `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: String,
    pub origin: String,
    pub affected: u32,
    pub message: String,
    pub data: Vec<Evidence>,
    pub earliest: DateTime<Utc>,
    pub latest: DateTime<Utc>,
}

impl Alert {
    /// Open a new alert from its first incident
    pub fn from_incident(incident: Incident) -> Self {
        Self {
            id: incident.id,
            origin: incident.origin,
            affected: incident.affected,
            message: incident.message,
            data: vec![incident.evidence],
            earliest: incident.timestamp,
            latest: incident.timestamp,
        }
    }

    /// Append evidence from a further incident with the same id
    pub fn absorb(&mut self, incident: Incident) {
        debug_assert_eq!(self.id, incident.id);
        self.message = incident.message;
        self.data.push(incident.evidence);
        self.latest = incident.timestamp;
    }
}

/// Current time in Unix milliseconds
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
