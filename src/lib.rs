//! # routewatch
//!
//! Stateful BGP prefix monitoring: checks a live stream of routing updates
//! against declared prefix policy and raises alerts for hijacks,
//! unexpected more-specific announcements and visibility loss.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use routewatch::{CanonicalNormalizer, Config, Pipeline, PrefixRecord, HIJACK_CHANNEL};
//! use std::sync::Arc;
//!
//! # async fn example() -> routewatch::Result<()> {
//! let records = vec![PrefixRecord {
//!     asn: vec![4713],
//!     description: "OCN prefix".to_string(),
//!     ignore_morespecifics: false,
//!     prefix: "180.50.120.0/21".to_string(),
//!     user: "default".to_string(),
//! }];
//!
//! let pipeline = Pipeline::start(&Config::default(), records, Arc::new(CanonicalNormalizer)).await?;
//! let mut alerts = pipeline.bus().subscribe(HIJACK_CHANNEL).await;
//!
//! pipeline
//!     .ingest(r#"{"type":"announcement","prefix":"180.50.120.0/22","path":[1,2,3,4],"peer":"124.0.0.2"}"#)
//!     .await?;
//! pipeline.flush().await?;
//!
//! if let Some(message) = alerts.try_next() {
//!     println!("{:?}", message.alert());
//! }
//! pipeline.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **PolicyStore** — longest-prefix match over the declared rules, atomically reloadable
//! - **Normalizer** — provider messages in, canonical `RoutingEvent`s out
//! - **DetectorEngine** — hijack, more-specific and visibility detectors, sharded by prefix
//! - **LifecycleManager** — aggregates incidents into alerts; debounce, stale and clear timers
//! - **AlertBus** — channel fan-out to subscribers, with a dead letter queue for stuck ones

pub mod bus;
pub mod config;
pub mod detect;
pub mod dlq;
pub mod error;
pub mod lifecycle;
pub mod normalize;
pub mod pipeline;
pub mod policy;
pub mod types;

// Re-export core types
pub use bus::{
    AlertBus, BusInfo, BusMessage, BusSubscription, Payload, Subscription, HIJACK_CHANNEL,
    NEW_PREFIX_CHANNEL, TEST_CHANNEL, VISIBILITY_CHANNEL,
};
pub use config::{Config, MonitorConfig, PipelineConfig};
pub use detect::{
    Detector, DetectorEngine, DetectorFactory, DetectorRegistry, HijackDetector,
    NewPrefixDetector, VisibilityDetector,
};
pub use dlq::{DeadLetter, DlqHandler, MemoryDlqHandler};
pub use error::{Result, WatchError};
pub use lifecycle::{AlertStatus, LifecycleConfig, LifecycleManager, SweepReport};
pub use normalize::{ingest, CanonicalNormalizer, Normalizer, RisLiveNormalizer};
pub use pipeline::Pipeline;
pub use policy::{parse_prefix_file, PolicyStore, RuleSet, TieBreak};
pub use types::{Alert, EventKind, Evidence, Incident, Prefix, PrefixRecord, PrefixRule, RoutingEvent};
