//! Detector engine
//!
//! Detectors are independent: each one sees every normalized event,
//! keeps its own per-prefix state, and returns zero or more incidents.
//! The engine feeds the same event to all of them and isolates failures,
//! so one misbehaving detector never starves the others.

use crate::error::Result;
use crate::policy::RuleSet;
use crate::types::{Evidence, Incident, PrefixRule, RoutingEvent};
use chrono::Utc;
use std::panic::{catch_unwind, AssertUnwindSafe};

pub mod hijack;
pub mod newprefix;
pub mod registry;
pub mod visibility;

pub use hijack::HijackDetector;
pub use newprefix::NewPrefixDetector;
pub use registry::{DetectorFactory, DetectorRegistry};
pub use visibility::VisibilityDetector;

/// Common interface of all detectors
///
/// `on_event` takes `&mut self`: a detector instance is owned by exactly
/// one engine shard and its state is never shared.
///
/// Events are sharded by prefix, so an incident id must be a function of
/// the event's prefix. Each `(channel, id)` alert key is then fed by a
/// single shard and its snapshots reach the bus in order. An id shared
/// across prefixes can be updated from two shards at once and subscribers
/// may see its snapshots reordered.
pub trait Detector: Send {
    /// Monitor name, reported as the alert `origin`
    fn name(&self) -> &str;

    /// Bus channel incidents are published on
    fn channel(&self) -> &str;

    /// Evaluate one event against the current rule set
    fn on_event(&mut self, event: &RoutingEvent, rules: &RuleSet) -> Result<Vec<Incident>>;

    /// Canned events that make this detector fire, used by the self-test channel
    fn canned_events(&self) -> Vec<RoutingEvent> {
        Vec::new()
    }

    /// Drop all per-prefix state
    fn reset(&mut self) {}
}

/// Name and channel shared by every built-in detector
#[derive(Debug, Clone)]
pub(crate) struct Identity {
    pub name: String,
    pub channel: String,
}

impl Identity {
    pub fn new(name: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            channel: channel.into(),
        }
    }

    /// Build an incident carrying this detector's identity
    pub fn incident(
        &self,
        id: String,
        message: String,
        event: &RoutingEvent,
        rule: &PrefixRule,
        extra: serde_json::Map<String, serde_json::Value>,
    ) -> Incident {
        Incident {
            id,
            channel: self.channel.clone(),
            origin: self.name.clone(),
            affected: rule.primary_asn(),
            message,
            evidence: Evidence {
                matched_message: event.clone(),
                matched_rule: rule.clone(),
                extra,
            },
            timestamp: Utc::now(),
        }
    }
}

/// Runs a fixed set of detectors over each event
#[derive(Default)]
pub struct DetectorEngine {
    detectors: Vec<Box<dyn Detector>>,
}

impl DetectorEngine {
    pub fn new(detectors: Vec<Box<dyn Detector>>) -> Self {
        Self { detectors }
    }

    /// Add a detector; the engine itself needs no change for new kinds
    pub fn push(&mut self, detector: Box<dyn Detector>) {
        self.detectors.push(detector);
    }

    /// Feed `event` to every detector and collect their incidents
    ///
    /// A detector that errors or panics is logged and skipped for this
    /// event only.
    pub fn process(&mut self, event: &RoutingEvent, rules: &RuleSet) -> Vec<Incident> {
        let mut incidents = Vec::new();
        for detector in self.detectors.iter_mut() {
            let outcome = catch_unwind(AssertUnwindSafe(|| detector.on_event(event, rules)));
            match outcome {
                Ok(Ok(found)) => incidents.extend(found),
                Ok(Err(e)) => {
                    tracing::warn!(
                        detector = detector.name(),
                        prefix = %event.prefix,
                        error = %e,
                        "Detector failed on event"
                    );
                }
                Err(_) => {
                    tracing::error!(
                        detector = detector.name(),
                        prefix = %event.prefix,
                        "Detector panicked on event"
                    );
                }
            }
        }
        incidents
    }

    /// Canned events of every detector whose channel or name is `target`
    ///
    /// A detector that panics while building them contributes nothing.
    pub fn canned_events(&self, target: &str) -> Vec<RoutingEvent> {
        let mut events = Vec::new();
        for detector in self
            .detectors
            .iter()
            .filter(|d| d.channel() == target || d.name() == target)
        {
            match catch_unwind(AssertUnwindSafe(|| detector.canned_events())) {
                Ok(canned) => events.extend(canned),
                Err(_) => {
                    tracing::error!(
                        detector = detector.name(),
                        "Detector panicked building self-test events"
                    );
                }
            }
        }
        events
    }

    /// Reset every detector's state
    pub fn reset(&mut self) {
        for detector in self.detectors.iter_mut() {
            detector.reset();
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.detectors.iter().map(|d| d.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.detectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::policy::{RuleSet, TieBreak};
    use crate::types::{Prefix, PrefixRecord, RoutingEvent};

    pub fn rules() -> RuleSet {
        RuleSet::from_records(
            vec![
                PrefixRecord {
                    asn: vec![50601],
                    description: "Solid Trading / Crossivity".to_string(),
                    ignore_morespecifics: false,
                    prefix: "124.40.52.128/26".to_string(),
                    user: "default".to_string(),
                },
                PrefixRecord {
                    asn: vec![4713],
                    description: "OCN prefix".to_string(),
                    ignore_morespecifics: false,
                    prefix: "180.50.120.0/21".to_string(),
                    user: "default".to_string(),
                },
                PrefixRecord {
                    asn: vec![4713],
                    description: "OCN prefix".to_string(),
                    ignore_morespecifics: true,
                    prefix: "180.57.120.0/21".to_string(),
                    user: "default".to_string(),
                },
            ],
            TieBreak::default(),
        )
        .unwrap()
    }

    pub fn announce(prefix: &str, path: &[u32], peer: &str) -> RoutingEvent {
        let prefix: Prefix = prefix.parse().unwrap();
        RoutingEvent::announcement(prefix, path.to_vec(), peer, Some(peer.to_string()))
    }

    pub fn withdraw(prefix: &str, peer: &str) -> RoutingEvent {
        let prefix: Prefix = prefix.parse().unwrap();
        RoutingEvent::withdrawal(prefix, peer)
    }
}
