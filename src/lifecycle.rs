//! Alert lifecycle: aggregation, debounce and expiry
//!
//! Each incident key moves through ABSENT → ACTIVE → STALE → CLEARED.
//! Two sources drive transitions: incident arrival (`on_incident`) and the
//! periodic sweep (`sweep`). Both take the same table lock, so a transition
//! never interleaves with another on the same key. Bus publishes happen
//! after the lock is released.

use crate::bus::AlertBus;
use crate::types::{Alert, Incident};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Timer values driving the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleConfig {
    /// Idle time after which an active alert turns stale
    pub stale_after: Duration,
    /// Minimum gap between two publishes of the same active alert
    pub notification_interval: Duration,
    /// Additional idle time after which a stale alert is cleared
    pub clear_after: Duration,
    /// Period of the background sweep
    pub sweep_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(60),
            notification_interval: Duration::from_secs(14_400),
            clear_after: Duration::from_secs(1_800),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Externally visible state of one incident key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertStatus {
    /// No alert held; the next incident opens a fresh one
    Absent,
    Active,
    Stale,
}

/// What one sweep pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Alert ids that went ACTIVE → STALE
    pub staled: Vec<String>,
    /// Alert ids removed from the table
    pub cleared: Vec<String>,
    /// The table was busy; timers are evaluated on the next tick
    pub skipped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Active,
    Stale,
}

struct Entry {
    alert: Alert,
    phase: Phase,
    last_incident: Instant,
    last_published: Instant,
}

/// Alerts are keyed by (channel, id) so detectors never share an entry
type AlertKey = (String, String);

/// Owns the alert table and publishes alert snapshots on the bus
pub struct LifecycleManager {
    config: LifecycleConfig,
    alerts: Mutex<HashMap<AlertKey, Entry>>,
    bus: Arc<AlertBus>,
}

impl LifecycleManager {
    pub fn new(config: LifecycleConfig, bus: Arc<AlertBus>) -> Self {
        Self {
            config,
            alerts: Mutex::new(HashMap::new()),
            bus,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Apply one incident to the table
    ///
    /// Returns the alert snapshot if it was published. The publish happens
    /// after the table lock is released, so snapshots of one key stay
    /// ordered only while a single task feeds that key (see `Detector`).
    pub async fn on_incident(&self, incident: Incident) -> Option<Alert> {
        let now = Instant::now();
        let channel = incident.channel.clone();
        let key = (channel.clone(), incident.id.clone());

        let to_publish = {
            let mut alerts = self.alerts.lock().await;
            match alerts.get_mut(&key) {
                None => {
                    let alert = Alert::from_incident(incident);
                    tracing::info!(
                        channel = %channel,
                        alert_id = %alert.id,
                        origin = %alert.origin,
                        "Alert opened"
                    );
                    let snapshot = alert.clone();
                    alerts.insert(
                        key,
                        Entry {
                            alert,
                            phase: Phase::Active,
                            last_incident: now,
                            last_published: now,
                        },
                    );
                    Some(snapshot)
                }
                Some(entry) => {
                    entry.alert.absorb(incident);
                    entry.last_incident = now;
                    match entry.phase {
                        Phase::Stale => {
                            entry.phase = Phase::Active;
                            entry.last_published = now;
                            tracing::info!(
                                channel = %channel,
                                alert_id = %entry.alert.id,
                                "Alert reactivated"
                            );
                            Some(entry.alert.clone())
                        }
                        Phase::Active => {
                            if now.duration_since(entry.last_published)
                                >= self.config.notification_interval
                            {
                                entry.last_published = now;
                                Some(entry.alert.clone())
                            } else {
                                tracing::debug!(
                                    channel = %channel,
                                    alert_id = %entry.alert.id,
                                    evidence = entry.alert.data.len(),
                                    "Alert updated, publish suppressed"
                                );
                                None
                            }
                        }
                    }
                }
            }
        };

        let alert = to_publish?;
        if let Err(e) = self.bus.publish_alert(&channel, alert.clone()).await {
            tracing::warn!(channel = %channel, alert_id = %alert.id, error = %e, "Alert publish failed");
        }
        Some(alert)
    }

    /// Evaluate staleness and expiry timers for every alert
    ///
    /// Never waits on the table: if the event path holds it, the pass is
    /// skipped and reported as such.
    pub async fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let expire_after = self.config.stale_after + self.config.clear_after;
        let mut report = SweepReport::default();

        let Ok(mut alerts) = self.alerts.try_lock() else {
            tracing::debug!("Alert table busy, sweep skipped");
            report.skipped = true;
            return report;
        };
        alerts.retain(|(_, id), entry| {
            let idle = now.duration_since(entry.last_incident);
            if idle >= expire_after {
                report.cleared.push(id.clone());
                return false;
            }
            if entry.phase == Phase::Active && idle >= self.config.stale_after {
                entry.phase = Phase::Stale;
                report.staled.push(id.clone());
            }
            true
        });
        drop(alerts);

        if !report.staled.is_empty() || !report.cleared.is_empty() {
            tracing::debug!(
                staled = report.staled.len(),
                cleared = report.cleared.len(),
                "Lifecycle sweep"
            );
        }
        report
    }

    /// Run `sweep` every `sweep_interval` until the handle is aborted
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let period = manager.config.sweep_interval.max(Duration::from_millis(1));
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.sweep().await;
            }
        })
    }

    pub async fn status(&self, channel: &str, id: &str) -> AlertStatus {
        let alerts = self.alerts.lock().await;
        match alerts.get(&(channel.to_string(), id.to_string())) {
            None => AlertStatus::Absent,
            Some(entry) if entry.phase == Phase::Active => AlertStatus::Active,
            Some(_) => AlertStatus::Stale,
        }
    }

    /// Snapshot of one alert
    pub async fn get(&self, channel: &str, id: &str) -> Option<Alert> {
        let alerts = self.alerts.lock().await;
        alerts
            .get(&(channel.to_string(), id.to_string()))
            .map(|e| e.alert.clone())
    }

    /// Snapshots of all alerts currently ACTIVE
    pub async fn active_alerts(&self) -> Vec<Alert> {
        let alerts = self.alerts.lock().await;
        alerts
            .values()
            .filter(|e| e.phase == Phase::Active)
            .map(|e| e.alert.clone())
            .collect()
    }

    /// Number of alerts held (ACTIVE or STALE)
    pub async fn len(&self) -> usize {
        self.alerts.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.alerts.lock().await.is_empty()
    }

    /// Drop every alert
    pub async fn reset(&self) {
        self.alerts.lock().await.clear();
    }
}
