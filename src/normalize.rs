//! Routing event normalizers: the ingress contract
//!
//! Connectors hand raw provider messages to a `Normalizer`, which turns
//! them into canonical `RoutingEvent`s. A message that cannot be parsed is
//! skipped with a warning; it never stops the stream. Duplicates and
//! out-of-order delivery pass straight through, detectors handle them.

use crate::error::{Result, WatchError};
use crate::types::{now_millis, EventKind, Prefix, RoutingEvent};
use serde::Deserialize;

/// Converts provider-native messages into canonical routing events
pub trait Normalizer: Send + Sync {
    /// Normalizer name, used in logs
    fn name(&self) -> &str;

    /// Parse one raw message into zero or more events
    ///
    /// `Ok(vec![])` means the message carried nothing routable
    /// (keepalives, state notifications).
    fn normalize(&self, raw: &str) -> Result<Vec<RoutingEvent>>;
}

/// Normalize one raw message, logging and skipping it on failure
pub fn ingest(normalizer: &dyn Normalizer, raw: &str) -> Vec<RoutingEvent> {
    match normalizer.normalize(raw) {
        Ok(events) => events,
        Err(e) => {
            tracing::warn!(
                normalizer = normalizer.name(),
                error = %e,
                "Skipping malformed message"
            );
            Vec::new()
        }
    }
}

/// Accepts messages already in the canonical `RoutingEvent` JSON shape
///
/// Missing `originAs` on an announcement is derived from the path;
/// a missing timestamp is set to the time of ingestion.
#[derive(Debug, Default, Clone)]
pub struct CanonicalNormalizer;

impl Normalizer for CanonicalNormalizer {
    fn name(&self) -> &str {
        "canonical"
    }

    fn normalize(&self, raw: &str) -> Result<Vec<RoutingEvent>> {
        let mut event: RoutingEvent =
            serde_json::from_str(raw).map_err(|e| WatchError::Normalize(e.to_string()))?;

        if event.kind == EventKind::Announcement {
            if event.origin_as.is_none() {
                event.origin_as = event.path.last().copied();
            }
            if event.origin_as.is_none() {
                return Err(WatchError::Normalize(format!(
                    "announcement of {} has no origin",
                    event.prefix
                )));
            }
        }
        if event.timestamp == 0 {
            event.timestamp = now_millis();
        }
        Ok(vec![event])
    }
}

#[derive(Debug, Deserialize)]
struct RisFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RisUpdate {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    timestamp: f64,
    peer: String,
    #[serde(default)]
    path: Vec<serde_json::Value>,
    #[serde(default)]
    announcements: Vec<RisAnnouncement>,
    #[serde(default)]
    withdrawals: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RisAnnouncement {
    #[serde(default)]
    next_hop: Option<String>,
    #[serde(default)]
    prefixes: Vec<String>,
}

/// Parses RIPE RIS Live `ris_message` frames
///
/// One UPDATE frame fans out into one event per announced and withdrawn
/// prefix. Frames whose origin is an AS-set are rejected.
#[derive(Debug, Default, Clone)]
pub struct RisLiveNormalizer;

impl RisLiveNormalizer {
    fn parse_path(path: &[serde_json::Value]) -> Result<Vec<u32>> {
        let mut out = Vec::with_capacity(path.len());
        for (i, hop) in path.iter().enumerate() {
            match hop {
                serde_json::Value::Number(n) => out.push(as_asn(n)?),
                serde_json::Value::Array(set) => {
                    if i + 1 == path.len() {
                        return Err(WatchError::Normalize(
                            "origin is an AS-set".to_string(),
                        ));
                    }
                    for member in set {
                        match member {
                            serde_json::Value::Number(n) => out.push(as_asn(n)?),
                            other => {
                                return Err(WatchError::Normalize(format!(
                                    "invalid AS-set member {}",
                                    other
                                )))
                            }
                        }
                    }
                }
                other => {
                    return Err(WatchError::Normalize(format!("invalid path hop {}", other)))
                }
            }
        }
        Ok(out)
    }
}

fn as_asn(n: &serde_json::Number) -> Result<u32> {
    n.as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| WatchError::Normalize(format!("invalid ASN {}", n)))
}

impl Normalizer for RisLiveNormalizer {
    fn name(&self) -> &str {
        "ris-live"
    }

    fn normalize(&self, raw: &str) -> Result<Vec<RoutingEvent>> {
        let frame: RisFrame =
            serde_json::from_str(raw).map_err(|e| WatchError::Normalize(e.to_string()))?;

        match frame.kind.as_str() {
            "ris_message" => {}
            "ris_error" => {
                return Err(WatchError::Normalize(format!(
                    "provider error: {}",
                    frame.data.unwrap_or_default()
                )))
            }
            other => {
                tracing::debug!(kind = other, "Ignoring non-update frame");
                return Ok(Vec::new());
            }
        }

        let data = frame
            .data
            .ok_or_else(|| WatchError::Normalize("ris_message without data".to_string()))?;
        let update: RisUpdate =
            serde_json::from_value(data).map_err(|e| WatchError::Normalize(e.to_string()))?;
        if update.kind != "UPDATE" {
            return Ok(Vec::new());
        }

        let timestamp = if update.timestamp > 0.0 {
            (update.timestamp * 1000.0) as u64
        } else {
            now_millis()
        };

        let mut events = Vec::new();

        // A bad path only invalidates the announcements; withdrawals carry none
        let path = if update.announcements.is_empty() {
            None
        } else {
            match Self::parse_path(&update.path).and_then(|path| {
                if path.is_empty() {
                    Err(WatchError::Normalize(
                        "announcement without AS path".to_string(),
                    ))
                } else {
                    Ok(path)
                }
            }) {
                Ok(path) => Some(path),
                Err(e) if update.withdrawals.is_empty() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        peer = %update.peer,
                        error = %e,
                        "Skipping announcements with unusable AS path"
                    );
                    None
                }
            }
        };

        if let Some(path) = path {
            for announcement in &update.announcements {
                for raw_prefix in &announcement.prefixes {
                    let Some(prefix) = parse_prefix(raw_prefix) else {
                        continue;
                    };
                    events.push(
                        RoutingEvent::announcement(
                            prefix,
                            path.clone(),
                            update.peer.clone(),
                            announcement.next_hop.clone(),
                        )
                        .with_timestamp(timestamp),
                    );
                }
            }
        }

        for raw_prefix in &update.withdrawals {
            let Some(prefix) = parse_prefix(raw_prefix) else {
                continue;
            };
            events.push(
                RoutingEvent::withdrawal(prefix, update.peer.clone()).with_timestamp(timestamp),
            );
        }

        Ok(events)
    }
}

fn parse_prefix(raw: &str) -> Option<Prefix> {
    match raw.parse::<Prefix>() {
        Ok(prefix) => Some(prefix),
        Err(e) => {
            tracing::warn!(prefix = raw, error = %e, "Skipping unparsable prefix");
            None
        }
    }
}
