//! Visibility loss: a monitored prefix withdrawn by too many peers

use super::{Detector, Identity};
use crate::config::MonitorConfig;
use crate::error::{Result, WatchError};
use crate::policy::RuleSet;
use crate::types::{EventKind, Incident, Prefix, RoutingEvent};
use std::collections::{HashMap, HashSet};

/// Threshold used when a monitor does not configure one
pub const DEFAULT_THRESHOLD: usize = 10;

/// Upper bound on the peers simulated by the self-test
const MAX_CANNED_PEERS: usize = 1000;

#[derive(Debug, Default)]
struct PeerState {
    /// Peers currently announcing the prefix
    visible: HashSet<String>,
    /// Peers that withdrew and have not re-announced
    withdrawn: HashSet<String>,
    /// Set while the visible count is above threshold
    armed: bool,
}

/// Tracks, per monitored prefix, which peers currently announce it
///
/// Fires once when the visible count crosses from above `threshold` to
/// at-or-below it, and re-arms when the count recovers. Repeated alerts
/// while the outage lasts are the lifecycle manager's concern.
pub struct VisibilityDetector {
    identity: Identity,
    threshold: usize,
    peers: HashMap<Prefix, PeerState>,
}

impl VisibilityDetector {
    pub fn new(name: impl Into<String>, channel: impl Into<String>, threshold: usize) -> Self {
        Self {
            identity: Identity::new(name, channel),
            threshold,
            peers: HashMap::new(),
        }
    }

    pub fn from_config(monitor: &MonitorConfig) -> Result<Self> {
        let threshold = match monitor.param_u64("threshold")? {
            Some(t) => usize::try_from(t).map_err(|_| {
                WatchError::Config(format!("monitor '{}': threshold too large", monitor.name))
            })?,
            None => DEFAULT_THRESHOLD,
        };
        Ok(Self::new(&monitor.name, &monitor.channel, threshold))
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Number of peers currently announcing `prefix`
    pub fn visible_peers(&self, prefix: &Prefix) -> usize {
        self.peers.get(prefix).map(|s| s.visible.len()).unwrap_or(0)
    }
}

impl Detector for VisibilityDetector {
    fn name(&self) -> &str {
        &self.identity.name
    }

    fn channel(&self) -> &str {
        &self.identity.channel
    }

    fn on_event(&mut self, event: &RoutingEvent, rules: &RuleSet) -> Result<Vec<Incident>> {
        let Some(rule) = rules.exact(&event.prefix) else {
            return Ok(Vec::new());
        };

        match event.kind {
            EventKind::Announcement => {
                let state = self.peers.entry(event.prefix).or_default();
                state.visible.insert(event.peer.clone());
                state.withdrawn.remove(&event.peer);
                if state.visible.len() > self.threshold {
                    state.armed = true;
                }
                Ok(Vec::new())
            }
            EventKind::Withdrawal => {
                let Some(state) = self.peers.get_mut(&event.prefix) else {
                    return Ok(Vec::new());
                };
                if !state.visible.remove(&event.peer) {
                    return Ok(Vec::new());
                }
                state.withdrawn.insert(event.peer.clone());

                if !state.armed || state.visible.len() > self.threshold {
                    return Ok(Vec::new());
                }
                state.armed = false;

                let lost = state.withdrawn.len();
                let remaining = state.visible.len();
                tracing::debug!(
                    prefix = %event.prefix,
                    remaining,
                    lost,
                    "Visibility dropped to threshold"
                );

                let mut extra = serde_json::Map::new();
                extra.insert("visiblePeers".to_string(), remaining.into());
                extra.insert("withdrawnPeers".to_string(), lost.into());

                let message = format!(
                    "The prefix {} ({}) has been withdrawn. It is no longer visible from {} peers.",
                    rule.prefix, rule.description, lost
                );
                Ok(vec![self.identity.incident(
                    event.prefix.to_string(),
                    message,
                    event,
                    rule,
                    extra,
                )])
            }
        }
    }

    /// `2t` peers announce the prefix, then `t` of them withdraw it
    ///
    /// `t` is capped at `MAX_CANNED_PEERS`; above the cap the prefix never
    /// becomes visible enough to arm, so the self-test stays quiet.
    fn canned_events(&self) -> Vec<RoutingEvent> {
        let Ok(prefix) = "124.40.52.128/26".parse::<Prefix>() else {
            return Vec::new();
        };
        let threshold = self.threshold.min(MAX_CANNED_PEERS);
        let total = threshold.max(1).saturating_mul(2);
        let withdrawing = total - threshold;
        let peer = |i: usize| format!("124.0.{}.{}", i / 250, i % 250 + 1);

        let announcements = (0..total).map(|i| {
            RoutingEvent::announcement(prefix, vec![1, 2, 3, 50601], peer(i), Some(peer(i)))
        });
        let withdrawals = (0..withdrawing).map(|i| RoutingEvent::withdrawal(prefix, peer(i)));
        announcements.chain(withdrawals).collect()
    }

    fn reset(&mut self) {
        self.peers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::test_support::*;

    const PREFIX: &str = "124.40.52.128/26";

    fn detector() -> VisibilityDetector {
        VisibilityDetector::new("withdrawal-detection", "visibility", 4)
    }

    fn feed(d: &mut VisibilityDetector, rules: &RuleSet, events: &[RoutingEvent]) -> Vec<Incident> {
        events
            .iter()
            .flat_map(|e| d.on_event(e, rules).unwrap())
            .collect()
    }

    fn announce_from(n: usize) -> Vec<RoutingEvent> {
        (0..n)
            .map(|i| announce(PREFIX, &[1, 50601], &format!("peer{}", i)))
            .collect()
    }

    #[test]
    fn test_drop_from_five_to_three_fires_once() {
        let rules = rules();
        let mut d = detector();
        assert!(feed(&mut d, &rules, &announce_from(5)).is_empty());

        let incidents = feed(
            &mut d,
            &rules,
            &[withdraw(PREFIX, "peer0"), withdraw(PREFIX, "peer1")],
        );
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].id, "124.40.52.128/26");
        assert_eq!(incidents[0].affected, 50601);
        assert_eq!(incidents[0].channel, "visibility");
        assert_eq!(d.visible_peers(&PREFIX.parse().unwrap()), 3);
    }

    #[test]
    fn test_no_fire_while_above_threshold() {
        let rules = rules();
        let mut d = detector();
        feed(&mut d, &rules, &announce_from(8));
        let incidents = feed(
            &mut d,
            &rules,
            &[withdraw(PREFIX, "peer0"), withdraw(PREFIX, "peer1"), withdraw(PREFIX, "peer2")],
        );
        assert!(incidents.is_empty());
    }

    #[test]
    fn test_never_above_threshold_never_fires() {
        let rules = rules();
        let mut d = detector();
        feed(&mut d, &rules, &announce_from(3));
        assert!(feed(&mut d, &rules, &[withdraw(PREFIX, "peer0")]).is_empty());
    }

    #[test]
    fn test_rearms_after_recovery() {
        let rules = rules();
        let mut d = detector();
        feed(&mut d, &rules, &announce_from(5));
        assert_eq!(feed(&mut d, &rules, &[withdraw(PREFIX, "peer0")]).len(), 1);

        // Still below: no second incident
        assert!(feed(&mut d, &rules, &[withdraw(PREFIX, "peer1")]).is_empty());

        // Recover above threshold, then drop again
        feed(
            &mut d,
            &rules,
            &[announce(PREFIX, &[1, 50601], "peer0"), announce(PREFIX, &[1, 50601], "peer1")],
        );
        let again = feed(&mut d, &rules, &[withdraw(PREFIX, "peer4")]);
        assert_eq!(again.len(), 1);
    }

    #[test]
    fn test_duplicate_and_unknown_withdrawals_are_idempotent() {
        let rules = rules();
        let mut d = detector();
        feed(&mut d, &rules, &announce_from(5));
        // Duplicate announcement does not inflate the count
        feed(&mut d, &rules, &announce_from(5));
        assert_eq!(d.visible_peers(&PREFIX.parse().unwrap()), 5);
        // Withdrawal from a peer never seen changes nothing
        assert!(feed(&mut d, &rules, &[withdraw(PREFIX, "stranger")]).is_empty());
        assert_eq!(d.visible_peers(&PREFIX.parse().unwrap()), 5);
    }

    #[test]
    fn test_only_exact_prefixes_tracked() {
        let rules = rules();
        let mut d = detector();
        let sub = "124.40.52.128/27";
        for i in 0..6 {
            d.on_event(&announce(sub, &[1, 50601], &format!("p{}", i)), &rules)
                .unwrap();
        }
        assert!(d.on_event(&withdraw(sub, "p0"), &rules).unwrap().is_empty());
        assert_eq!(d.visible_peers(&sub.parse().unwrap()), 0);
    }

    #[test]
    fn test_canned_events_fire_with_message() {
        let rules = rules();
        let mut d = detector();
        let canned = d.canned_events();
        assert_eq!(canned.len(), 12);

        let incidents = feed(&mut d, &rules, &canned);
        assert_eq!(incidents.len(), 1);
        assert_eq!(
            incidents[0].message,
            "The prefix 124.40.52.128/26 (Solid Trading / Crossivity) has been withdrawn. It is no longer visible from 4 peers."
        );
        assert_eq!(incidents[0].evidence.extra["visiblePeers"], 4);
    }

    #[test]
    fn test_canned_events_bounded_for_huge_threshold() {
        let rules = rules();
        let mut d = VisibilityDetector::new("withdrawal-detection", "visibility", usize::MAX);
        let canned = d.canned_events();
        assert_eq!(canned.len(), 3 * MAX_CANNED_PEERS);
        assert!(feed(&mut d, &rules, &canned).is_empty());
    }

    #[test]
    fn test_canned_events_zero_threshold_withdraws_all() {
        let rules = rules();
        let mut d = VisibilityDetector::new("withdrawal-detection", "visibility", 0);
        let canned = d.canned_events();
        assert_eq!(canned.len(), 4);
        assert_eq!(feed(&mut d, &rules, &canned).len(), 1);
    }

    #[test]
    fn test_reset_clears_state() {
        let rules = rules();
        let mut d = detector();
        feed(&mut d, &rules, &announce_from(5));
        d.reset();
        assert_eq!(d.visible_peers(&PREFIX.parse().unwrap()), 0);
        assert!(feed(&mut d, &rules, &[withdraw(PREFIX, "peer0")]).is_empty());
    }
}
