//! Configuration values consumed by the pipeline
//!
//! Mirrors the YAML configuration file of the monitoring service. Only the
//! keys the core needs are modelled; connector, report and logging
//! sections belong to external collaborators and are ignored here.

use crate::detect::registry::{DetectorRegistry, HIJACK_CLASS, NEW_PREFIX_CLASS, VISIBILITY_CLASS};
use crate::error::{Result, WatchError};
use crate::lifecycle::LifecycleConfig;
use crate::policy::{parse_prefix_file, TieBreak};
use crate::types::PrefixRecord;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// One configured detector instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Monitor name, reported as alert origin
    pub name: String,

    /// Bus channel alerts are published on
    pub channel: String,

    /// Detector class selector (see `DetectorRegistry`)
    pub class: String,

    /// Detector-specific parameters, e.g. `{threshold: 4}`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl MonitorConfig {
    /// Read an optional unsigned integer parameter
    pub fn param_u64(&self, key: &str) -> Result<Option<u64>> {
        let Some(value) = self.params.as_ref().and_then(|p| p.get(key)) else {
            return Ok(None);
        };
        value.as_u64().map(Some).ok_or_else(|| {
            WatchError::Config(format!(
                "monitor '{}': parameter '{}' must be a non-negative integer",
                self.name, key
            ))
        })
    }
}

/// Engine sizing and delivery knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    /// Number of detector shards (events are routed by prefix)
    #[serde(default = "default_shards")]
    pub shards: usize,

    /// Capacity of each shard queue and each subscriber queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How long a publish waits on a full subscriber queue
    #[serde(default = "default_delivery_timeout_millis")]
    pub delivery_timeout_millis: u64,

    /// Choice among same-prefix rules of different users
    #[serde(default)]
    pub tie_break: TieBreak,
}

fn default_shards() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_delivery_timeout_millis() -> u64 {
    5_000
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            shards: default_shards(),
            queue_capacity: default_queue_capacity(),
            delivery_timeout_millis: default_delivery_timeout_millis(),
            tie_break: TieBreak::default(),
        }
    }
}

impl PipelineConfig {
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_millis)
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_monitors")]
    pub monitors: Vec<MonitorConfig>,

    #[serde(default = "default_check_stale")]
    pub check_stale_notifications_seconds: u64,

    #[serde(default = "default_notification_interval")]
    pub notification_interval_seconds: u64,

    #[serde(default = "default_clear_after")]
    pub clear_notification_queue_after_seconds: u64,

    /// Prefix files, relative to the config file
    #[serde(default)]
    pub monitored_prefixes_files: Vec<String>,

    #[serde(default)]
    pub pipeline: PipelineConfig,
}

fn default_check_stale() -> u64 {
    60
}

fn default_notification_interval() -> u64 {
    14_400
}

fn default_clear_after() -> u64 {
    1_800
}

/// The three built-in monitors
pub fn default_monitors() -> Vec<MonitorConfig> {
    vec![
        MonitorConfig {
            name: "basic-hijack-detection".to_string(),
            channel: "hijack".to_string(),
            class: HIJACK_CLASS.to_string(),
            params: None,
        },
        MonitorConfig {
            name: "prefix-detection".to_string(),
            channel: "newprefix".to_string(),
            class: NEW_PREFIX_CLASS.to_string(),
            params: None,
        },
        MonitorConfig {
            name: "withdrawal-detection".to_string(),
            channel: "visibility".to_string(),
            class: VISIBILITY_CLASS.to_string(),
            params: Some(serde_json::json!({ "threshold": 10 })),
        },
    ]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            monitors: default_monitors(),
            check_stale_notifications_seconds: default_check_stale(),
            notification_interval_seconds: default_notification_interval(),
            clear_notification_queue_after_seconds: default_clear_after(),
            monitored_prefixes_files: Vec::new(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl Config {
    /// Parse configuration from a YAML string
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Read and parse a YAML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            WatchError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Check monitors against the registry and timers for sanity
    pub fn validate(&self, registry: &DetectorRegistry) -> Result<()> {
        if self.monitors.is_empty() {
            return Err(WatchError::Config("no monitors configured".to_string()));
        }
        let mut names = HashSet::new();
        for monitor in &self.monitors {
            if monitor.name.is_empty() || monitor.channel.is_empty() {
                return Err(WatchError::Config(
                    "monitor name and channel must not be empty".to_string(),
                ));
            }
            if !names.insert(monitor.name.as_str()) {
                return Err(WatchError::Config(format!(
                    "duplicate monitor name: {}",
                    monitor.name
                )));
            }
            if !registry.contains(&monitor.class) {
                return Err(WatchError::UnknownDetector(monitor.class.clone()));
            }
        }
        if self.check_stale_notifications_seconds == 0 {
            return Err(WatchError::Config(
                "checkStaleNotificationsSeconds must be positive".to_string(),
            ));
        }
        if self.pipeline.shards == 0 || self.pipeline.queue_capacity == 0 {
            return Err(WatchError::Config(
                "pipeline shards and queueCapacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Read every `monitoredPrefixesFiles` entry, resolved against `base`
    ///
    /// Records are tagged with the default user and keep file order.
    pub fn load_prefixes(&self, base: &Path) -> Result<Vec<PrefixRecord>> {
        let mut records = Vec::new();
        for file in &self.monitored_prefixes_files {
            let path = base.join(file);
            let content = std::fs::read_to_string(&path).map_err(|e| {
                WatchError::Config(format!("Failed to read prefixes {}: {}", path.display(), e))
            })?;
            let parsed = parse_prefix_file(&content, "default")?;
            tracing::debug!(file = %path.display(), prefixes = parsed.len(), "Prefix file loaded");
            records.extend(parsed);
        }
        Ok(records)
    }

    /// Timer values for the lifecycle manager
    pub fn lifecycle(&self) -> LifecycleConfig {
        LifecycleConfig {
            stale_after: Duration::from_secs(self.check_stale_notifications_seconds),
            notification_interval: Duration::from_secs(self.notification_interval_seconds),
            clear_after: Duration::from_secs(self.clear_notification_queue_after_seconds),
            sweep_interval: Duration::from_secs(self.check_stale_notifications_seconds.max(1)),
        }
    }
}
