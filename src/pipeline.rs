//! Process context wiring ingress, detectors, lifecycle and bus together
//!
//! Events are routed by prefix hash to a fixed number of shard tasks. Each
//! shard owns its own detector instances, so per-prefix state is only ever
//! touched by one task and needs no locking. Incidents go to the shared
//! `LifecycleManager`, which publishes alerts on the `AlertBus`.

use crate::bus::{AlertBus, Subscription, TEST_CHANNEL};
use crate::config::Config;
use crate::detect::{DetectorEngine, DetectorRegistry};
use crate::dlq::MemoryDlqHandler;
use crate::error::{Result, WatchError};
use crate::lifecycle::LifecycleManager;
use crate::normalize::{self, Normalizer};
use crate::policy::PolicyStore;
use crate::types::{Prefix, PrefixRecord, RoutingEvent};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

enum ShardCommand {
    Event(RoutingEvent),
    /// Run the canned events of detectors matching the target
    Control(String),
    /// Barrier: answered once every earlier command is fully processed
    Flush(oneshot::Sender<()>),
    Reset(oneshot::Sender<()>),
}

fn shard_index(prefix: &Prefix, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    prefix.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

struct ShardWorker {
    index: usize,
    shards: usize,
    engine: DetectorEngine,
    policy: Arc<PolicyStore>,
    lifecycle: Arc<LifecycleManager>,
}

impl ShardWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<ShardCommand>) {
        tracing::debug!(shard = self.index, detectors = ?self.engine.names(), "Shard started");
        while let Some(command) = rx.recv().await {
            match command {
                ShardCommand::Event(event) => self.handle(&event).await,
                ShardCommand::Control(target) => {
                    let canned: Vec<RoutingEvent> = self
                        .engine
                        .canned_events(&target)
                        .into_iter()
                        .filter(|e| shard_index(&e.prefix, self.shards) == self.index)
                        .collect();
                    if !canned.is_empty() {
                        tracing::info!(
                            shard = self.index,
                            target = %target,
                            events = canned.len(),
                            "Running self-test"
                        );
                    }
                    for event in &canned {
                        self.handle(event).await;
                    }
                }
                ShardCommand::Flush(done) => {
                    let _ = done.send(());
                }
                ShardCommand::Reset(done) => {
                    self.engine.reset();
                    let _ = done.send(());
                }
            }
        }
        tracing::debug!(shard = self.index, "Shard drained");
    }

    async fn handle(&mut self, event: &RoutingEvent) {
        let rules = match self.policy.snapshot() {
            Ok(rules) => rules,
            Err(e) => {
                tracing::warn!(prefix = %event.prefix, error = %e, "Policy unavailable, event skipped");
                return;
            }
        };
        for incident in self.engine.process(event, &rules) {
            self.lifecycle.on_incident(incident).await;
        }
    }
}

/// A running monitoring pipeline
pub struct Pipeline {
    shards: Vec<mpsc::Sender<ShardCommand>>,
    workers: Vec<JoinHandle<()>>,
    sweeper: JoinHandle<()>,
    control: JoinHandle<()>,
    policy: Arc<PolicyStore>,
    lifecycle: Arc<LifecycleManager>,
    bus: Arc<AlertBus>,
    normalizer: Arc<dyn Normalizer>,
}

impl Pipeline {
    /// Start with the built-in detectors and a fresh bus
    ///
    /// Undeliverable alerts go to an in-memory dead letter queue.
    pub async fn start(
        config: &Config,
        records: Vec<PrefixRecord>,
        normalizer: Arc<dyn Normalizer>,
    ) -> Result<Self> {
        let mut bus = AlertBus::new(
            config.pipeline.queue_capacity,
            config.pipeline.delivery_timeout(),
        );
        bus.set_dlq_handler(Arc::new(MemoryDlqHandler::default()));
        Self::start_with(
            config,
            records,
            normalizer,
            &DetectorRegistry::default(),
            Arc::new(bus),
        )
        .await
    }

    /// Start with a custom registry and bus
    ///
    /// Fails if the configuration is invalid or the initial policy cannot
    /// be loaded; nothing is spawned in that case.
    pub async fn start_with(
        config: &Config,
        records: Vec<PrefixRecord>,
        normalizer: Arc<dyn Normalizer>,
        registry: &DetectorRegistry,
        bus: Arc<AlertBus>,
    ) -> Result<Self> {
        config.validate(registry)?;
        let policy = Arc::new(PolicyStore::new(records, config.pipeline.tie_break.clone())?);

        let shard_count = config.pipeline.shards;
        let mut engines = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            engines.push(DetectorEngine::new(registry.build_all(&config.monitors)?));
        }

        let lifecycle = Arc::new(LifecycleManager::new(config.lifecycle(), bus.clone()));

        let mut shards = Vec::with_capacity(shard_count);
        let mut workers = Vec::with_capacity(shard_count);
        for (index, engine) in engines.into_iter().enumerate() {
            let (tx, rx) = mpsc::channel(config.pipeline.queue_capacity);
            let worker = ShardWorker {
                index,
                shards: shard_count,
                engine,
                policy: policy.clone(),
                lifecycle: lifecycle.clone(),
            };
            workers.push(tokio::spawn(worker.run(rx)));
            shards.push(tx);
        }

        let sweeper = lifecycle.spawn_sweeper();
        let control = Self::spawn_control_listener(&bus, shards.clone()).await;

        tracing::info!(
            shards = shard_count,
            monitors = config.monitors.len(),
            normalizer = normalizer.name(),
            "Pipeline started"
        );

        Ok(Self {
            shards,
            workers,
            sweeper,
            control,
            policy,
            lifecycle,
            bus,
            normalizer,
        })
    }

    /// Forward `test-type` control messages to every shard
    async fn spawn_control_listener(
        bus: &AlertBus,
        shards: Vec<mpsc::Sender<ShardCommand>>,
    ) -> JoinHandle<()> {
        let mut subscription = bus.subscribe(TEST_CHANNEL).await;
        tokio::spawn(async move {
            while let Some(message) = subscription.next().await {
                let Some(target) = message.control() else {
                    tracing::warn!(message_id = %message.id, "Non-control message on test channel");
                    continue;
                };
                for shard in &shards {
                    if shard.send(ShardCommand::Control(target.to_string())).await.is_err() {
                        return;
                    }
                }
            }
        })
    }

    pub fn bus(&self) -> &Arc<AlertBus> {
        &self.bus
    }

    pub fn policy(&self) -> &Arc<PolicyStore> {
        &self.policy
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Normalize one raw message and submit its events
    ///
    /// Malformed messages are skipped; returns the number of events queued.
    pub async fn ingest(&self, raw: &str) -> Result<usize> {
        let events = normalize::ingest(self.normalizer.as_ref(), raw);
        let count = events.len();
        for event in events {
            self.submit(event).await?;
        }
        Ok(count)
    }

    /// Queue one canonical event on its shard
    ///
    /// Waits while the shard queue is full.
    pub async fn submit(&self, event: RoutingEvent) -> Result<()> {
        let index = shard_index(&event.prefix, self.shards.len());
        self.shards[index]
            .send(ShardCommand::Event(event))
            .await
            .map_err(|_| WatchError::Shutdown)
    }

    /// Run the self-test of detectors whose channel or name is `target`
    ///
    /// Same effect as publishing `target` on the `test-type` channel, but
    /// ordered with respect to `submit` and `flush`.
    pub async fn trigger_self_test(&self, target: &str) -> Result<()> {
        for shard in &self.shards {
            shard
                .send(ShardCommand::Control(target.to_string()))
                .await
                .map_err(|_| WatchError::Shutdown)?;
        }
        Ok(())
    }

    /// Wait until every event queued so far has been processed
    pub async fn flush(&self) -> Result<()> {
        self.barrier(ShardCommand::Flush).await
    }

    /// Clear all detector state and the alert table
    pub async fn reset(&self) -> Result<()> {
        self.barrier(ShardCommand::Reset).await?;
        self.lifecycle.reset().await;
        tracing::info!("Pipeline reset");
        Ok(())
    }

    /// Atomically replace the policy; the old rules stay on error
    pub fn reload_policy(&self, records: Vec<PrefixRecord>) -> Result<usize> {
        self.policy.reload(records)
    }

    /// Stop timers, drain queued events and wait for the shards to finish
    ///
    /// Alerts due to timer transitions after this point are not published.
    pub async fn shutdown(mut self) {
        self.sweeper.abort();
        self.control.abort();
        let _ = (&mut self.sweeper).await;
        let _ = (&mut self.control).await;

        drop(std::mem::take(&mut self.shards));
        for worker in std::mem::take(&mut self.workers) {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "Shard task failed");
            }
        }
        tracing::info!("Pipeline stopped");
    }

    /// Send an acknowledged command to every shard and wait for all acks
    async fn barrier(&self, command: fn(oneshot::Sender<()>) -> ShardCommand) -> Result<()> {
        let mut pending = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            let (tx, rx) = oneshot::channel();
            shard
                .send(command(tx))
                .await
                .map_err(|_| WatchError::Shutdown)?;
            pending.push(rx);
        }
        for rx in pending {
            rx.await.map_err(|_| WatchError::Shutdown)?;
        }
        Ok(())
    }
}

/// Dropping without `shutdown` stops the background tasks; shard workers
/// then exit once their queues close, without waiting for them
impl Drop for Pipeline {
    fn drop(&mut self) {
        self.sweeper.abort();
        self.control.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusSubscription, HIJACK_CHANNEL, NEW_PREFIX_CHANNEL};
    use crate::normalize::CanonicalNormalizer;
    use std::time::Duration;

    fn records() -> Vec<PrefixRecord> {
        vec![PrefixRecord {
            asn: vec![4713],
            description: "OCN prefix".to_string(),
            ignore_morespecifics: false,
            prefix: "180.50.120.0/21".to_string(),
            user: "default".to_string(),
        }]
    }

    async fn pipeline(shards: usize) -> Pipeline {
        let mut config = Config::default();
        config.pipeline.shards = shards;
        Pipeline::start(&config, records(), Arc::new(CanonicalNormalizer))
            .await
            .unwrap()
    }

    fn drain(sub: &mut BusSubscription) -> Vec<String> {
        let mut ids = Vec::new();
        while let Some(msg) = sub.try_next() {
            if let Some(alert) = msg.alert() {
                ids.push(alert.id.clone());
            }
        }
        ids
    }

    #[test]
    fn test_shard_index_is_stable_and_in_range() {
        let p: Prefix = "180.50.120.0/22".parse().unwrap();
        for shards in 1..8 {
            let i = shard_index(&p, shards);
            assert!(i < shards);
            assert_eq!(i, shard_index(&p, shards));
        }
    }

    #[tokio::test]
    async fn test_start_rejects_empty_policy() {
        let result = Pipeline::start(&Config::default(), Vec::new(), Arc::new(CanonicalNormalizer)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_ingest_to_alert() {
        let p = pipeline(3).await;
        assert_eq!(p.shard_count(), 3);
        let mut hijack = p.bus().subscribe(HIJACK_CHANNEL).await;

        let raw = r#"{"type":"announcement","prefix":"180.50.120.0/22","path":[1,2,3,4],"peer":"124.0.0.2"}"#;
        assert_eq!(p.ingest(raw).await.unwrap(), 1);
        assert_eq!(p.ingest("not json").await.unwrap(), 0);
        p.flush().await.unwrap();

        assert_eq!(drain(&mut hijack), vec!["4-180.50.120.0/22"]);
        p.shutdown().await;
    }

    #[tokio::test]
    async fn test_self_test_and_reset() {
        let p = pipeline(2).await;
        let mut newprefix = p.bus().subscribe(NEW_PREFIX_CHANNEL).await;

        p.trigger_self_test(NEW_PREFIX_CHANNEL).await.unwrap();
        p.flush().await.unwrap();
        assert_eq!(drain(&mut newprefix), vec!["4713-180.50.120.0/22"]);
        assert_eq!(p.lifecycle().len().await, 1);

        p.reset().await.unwrap();
        assert!(p.lifecycle().is_empty().await);
        p.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_events() {
        let p = pipeline(1).await;
        let lifecycle = p.lifecycle().clone();
        let raw = r#"{"type":"announcement","prefix":"180.50.120.0/22","path":[1,2,3,4],"peer":"124.0.0.2"}"#;
        p.ingest(raw).await.unwrap();
        p.shutdown().await;
        assert_eq!(lifecycle.len().await, 1);
    }

    #[tokio::test]
    async fn test_dropped_pipeline_releases_tasks() {
        let p = pipeline(2).await;
        let lifecycle = Arc::downgrade(p.lifecycle());
        let bus = Arc::downgrade(p.bus());
        let raw = r#"{"type":"announcement","prefix":"180.50.120.0/22","path":[1,2,3,4],"peer":"124.0.0.2"}"#;
        p.ingest(raw).await.unwrap();
        drop(p);

        tokio::time::timeout(Duration::from_secs(5), async {
            while lifecycle.upgrade().is_some() || bus.upgrade().is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("pipeline tasks still hold the lifecycle or bus after drop");
    }

    #[tokio::test]
    async fn test_shard_survives_huge_visibility_threshold() {
        let mut config = Config::default();
        config.pipeline.shards = 1;
        for monitor in config.monitors.iter_mut() {
            if monitor.channel == "visibility" {
                monitor.params = Some(serde_json::json!({ "threshold": u64::MAX }));
            }
        }
        let p = Pipeline::start(&config, records(), Arc::new(CanonicalNormalizer))
            .await
            .unwrap();

        p.trigger_self_test("visibility").await.unwrap();
        p.flush().await.unwrap();

        let raw = r#"{"type":"announcement","prefix":"180.50.120.0/22","path":[1,2,3,4],"peer":"124.0.0.2"}"#;
        assert_eq!(p.ingest(raw).await.unwrap(), 1);
        p.flush().await.unwrap();
        p.shutdown().await;
    }
}
