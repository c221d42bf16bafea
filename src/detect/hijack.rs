//! Hijack detection: monitored space announced by an unauthorized origin

use super::{Detector, Identity};
use crate::config::MonitorConfig;
use crate::error::Result;
use crate::policy::RuleSet;
use crate::types::{Incident, Prefix, RoutingEvent};

/// Flags announcements of a monitored prefix, or of a more-specific of a
/// rule that does not ignore more-specifics, from an unauthorized origin
pub struct HijackDetector {
    identity: Identity,
}

impl HijackDetector {
    pub fn new(name: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            identity: Identity::new(name, channel),
        }
    }

    pub fn from_config(monitor: &MonitorConfig) -> Result<Self> {
        Ok(Self::new(&monitor.name, &monitor.channel))
    }
}

impl Detector for HijackDetector {
    fn name(&self) -> &str {
        &self.identity.name
    }

    fn channel(&self) -> &str {
        &self.identity.channel
    }

    fn on_event(&mut self, event: &RoutingEvent, rules: &RuleSet) -> Result<Vec<Incident>> {
        if !event.is_announcement() {
            return Ok(Vec::new());
        }
        let Some(origin) = event.origin_as else {
            return Ok(Vec::new());
        };
        let Some(rule) = rules.match_prefix(&event.prefix) else {
            return Ok(Vec::new());
        };

        let exact = rule.prefix == event.prefix;
        if (!exact && rule.ignore_morespecifics) || rule.is_authorized(origin) {
            return Ok(Vec::new());
        }

        let message = if exact {
            format!(
                "The prefix {} ({}) is announced by AS{} instead of {}",
                rule.prefix,
                rule.description,
                origin,
                rule.asn_label()
            )
        } else {
            format!(
                "A new prefix {} is announced by AS{}. It should be instead {} ({}) announced by {}",
                event.prefix,
                origin,
                rule.prefix,
                rule.description,
                rule.asn_label()
            )
        };

        Ok(vec![self.identity.incident(
            format!("{}-{}", origin, event.prefix),
            message,
            event,
            rule,
            serde_json::Map::new(),
        )])
    }

    fn canned_events(&self) -> Vec<RoutingEvent> {
        let Ok(prefix) = "180.50.120.0/22".parse::<Prefix>() else {
            return Vec::new();
        };
        vec![RoutingEvent::announcement(
            prefix,
            vec![1, 2, 3, 4],
            "124.0.0.2",
            Some("124.0.0.2".to_string()),
        )]
    }
}
