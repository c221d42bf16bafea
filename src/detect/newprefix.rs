//! More-specific announcements by an authorized origin

use super::{Detector, Identity};
use crate::config::MonitorConfig;
use crate::error::Result;
use crate::policy::RuleSet;
use crate::types::{Incident, Prefix, RoutingEvent};

/// Flags a more-specific of a monitored prefix announced by its own
/// (authorized) origin: likely a configuration change, not an attack.
///
/// Authorization is the discriminator against `HijackDetector`, so the
/// two never fire on the same event.
pub struct NewPrefixDetector {
    identity: Identity,
}

impl NewPrefixDetector {
    pub fn new(name: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            identity: Identity::new(name, channel),
        }
    }

    pub fn from_config(monitor: &MonitorConfig) -> Result<Self> {
        Ok(Self::new(&monitor.name, &monitor.channel))
    }
}

impl Detector for NewPrefixDetector {
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
        if rule.ignore_morespecifics
            || !event.prefix.is_more_specific_of(&rule.prefix)
            || !rule.is_authorized(origin)
        {
            return Ok(Vec::new());
        }

        let message = format!(
            "Possible change of configuration. A new prefix {} is announced by AS{}. It is a more specific of {} ({}).",
            event.prefix, origin, rule.prefix, rule.description
        );

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
            vec![1, 2, 3, 4713],
            "124.0.0.2",
            Some("124.0.0.2".to_string()),
        )]
    }
}
