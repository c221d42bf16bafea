//! Detector class registry
//!
//! Maps the `class` string of a monitor configuration to a constructor.
//! Resolved once at startup; unknown classes are a configuration error.

use super::{Detector, HijackDetector, NewPrefixDetector, VisibilityDetector};
use crate::config::MonitorConfig;
use crate::error::{Result, WatchError};
use std::collections::BTreeMap;

/// Builds a detector from its monitor configuration
pub type DetectorFactory = fn(&MonitorConfig) -> Result<Box<dyn Detector>>;

/// Class name of the built-in hijack detector
pub const HIJACK_CLASS: &str = "MonitorHijack";
/// Class name of the built-in more-specific detector
pub const NEW_PREFIX_CLASS: &str = "MonitorNewPrefix";
/// Class name of the built-in visibility detector
pub const VISIBILITY_CLASS: &str = "MonitorVisibility";

fn build_hijack(monitor: &MonitorConfig) -> Result<Box<dyn Detector>> {
    Ok(Box::new(HijackDetector::from_config(monitor)?))
}

fn build_new_prefix(monitor: &MonitorConfig) -> Result<Box<dyn Detector>> {
    Ok(Box::new(NewPrefixDetector::from_config(monitor)?))
}

fn build_visibility(monitor: &MonitorConfig) -> Result<Box<dyn Detector>> {
    Ok(Box::new(VisibilityDetector::from_config(monitor)?))
}

/// Registry of detector constructors keyed by class name
pub struct DetectorRegistry {
    factories: BTreeMap<String, DetectorFactory>,
}

impl DetectorRegistry {
    /// An empty registry
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with the three built-in detectors
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.factories.insert(HIJACK_CLASS.to_string(), build_hijack);
        registry
            .factories
            .insert(NEW_PREFIX_CLASS.to_string(), build_new_prefix);
        registry
            .factories
            .insert(VISIBILITY_CLASS.to_string(), build_visibility);
        registry
    }

    /// Register an additional detector class
    pub fn register(&mut self, class: impl Into<String>, factory: DetectorFactory) -> Result<()> {
        let class = class.into();
        if self.factories.contains_key(&class) {
            return Err(WatchError::Config(format!(
                "detector class already registered: {}",
                class
            )));
        }
        self.factories.insert(class, factory);
        Ok(())
    }

    pub fn contains(&self, class: &str) -> bool {
        self.factories.contains_key(class)
    }

    pub fn classes(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Build one detector
    pub fn build(&self, monitor: &MonitorConfig) -> Result<Box<dyn Detector>> {
        let factory = self
            .factories
            .get(&monitor.class)
            .ok_or_else(|| WatchError::UnknownDetector(monitor.class.clone()))?;
        factory(monitor)
    }

    /// Build one detector per monitor, in configuration order
    pub fn build_all(&self, monitors: &[MonitorConfig]) -> Result<Vec<Box<dyn Detector>>> {
        monitors.iter().map(|m| self.build(m)).collect()
    }
}

impl Default for DetectorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
