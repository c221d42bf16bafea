//! Performance benchmarks for routewatch
//!
//! Run with: cargo bench

use criterion::{criterion_group, criterion_main, Criterion};
use routewatch::{
    CanonicalNormalizer, Config, DetectorEngine, HijackDetector, NewPrefixDetector, Normalizer,
    Pipeline, Prefix, PrefixRecord, RoutingEvent, RuleSet, TieBreak, VisibilityDetector,
};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

/// 1000 /24 rules spread over 10.0.0.0/8, owned by AS65000
fn records() -> Vec<PrefixRecord> {
    (0..1000u32)
        .map(|i| PrefixRecord {
            asn: vec![65000],
            description: format!("block {}", i),
            ignore_morespecifics: false,
            prefix: format!("10.{}.{}.0/24", i / 256, i % 256),
            user: "default".to_string(),
        })
        .collect()
}

fn prefix(i: u32, len: u8) -> Prefix {
    let addr = IpAddr::V4(Ipv4Addr::new(10, (i / 256) as u8, (i % 256) as u8, 0));
    Prefix::new(addr, len).unwrap()
}

fn engine() -> DetectorEngine {
    DetectorEngine::new(vec![
        Box::new(HijackDetector::new("basic-hijack-detection", "hijack")),
        Box::new(NewPrefixDetector::new("prefix-detection", "newprefix")),
        Box::new(VisibilityDetector::new("withdrawal-detection", "visibility", 10)),
    ])
}

fn bench_policy_match(c: &mut Criterion) {
    let rules = RuleSet::from_records(records(), TieBreak::default()).unwrap();
    let exact = prefix(500, 24);
    let more_specific = prefix(500, 26);
    let miss = Prefix::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 0)), 24).unwrap();

    c.bench_function("RuleSet::match_prefix exact", |b| {
        b.iter(|| rules.match_prefix(&exact));
    });
    c.bench_function("RuleSet::match_prefix more-specific", |b| {
        b.iter(|| rules.match_prefix(&more_specific));
    });
    c.bench_function("RuleSet::match_prefix miss", |b| {
        b.iter(|| rules.match_prefix(&miss));
    });
}

fn bench_normalize(c: &mut Criterion) {
    let raw = r#"{"type":"announcement","prefix":"10.1.244.0/24","path":[3333,1299,65000],"peer":"193.0.0.56"}"#;
    let normalizer = CanonicalNormalizer;
    c.bench_function("CanonicalNormalizer::normalize", |b| {
        b.iter(|| normalizer.normalize(raw).unwrap());
    });
}

fn bench_engine_process(c: &mut Criterion) {
    let rules = RuleSet::from_records(records(), TieBreak::default()).unwrap();
    let events: Vec<RoutingEvent> = (0..1000u32)
        .map(|i| {
            let origin = if i % 10 == 0 { 666 } else { 65000 };
            RoutingEvent::announcement(prefix(i, 24), vec![3333, origin], format!("peer{}", i % 20), None)
        })
        .collect();

    let mut group = c.benchmark_group("engine_throughput");
    group.bench_function("1000 announcements", |b| {
        let mut engine = engine();
        b.iter(|| {
            let mut incidents = 0;
            for event in &events {
                incidents += engine.process(event, &rules).len();
            }
            incidents
        });
    });
    group.finish();
}

fn bench_pipeline_ingest(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let pipeline = rt.block_on(async {
        Pipeline::start(&Config::default(), records(), Arc::new(CanonicalNormalizer))
            .await
            .unwrap()
    });
    let lines: Vec<String> = (0..1000u32)
        .map(|i| {
            serde_json::json!({
                "type": "announcement",
                "prefix": format!("10.{}.{}.0/24", i / 256, i % 256),
                "path": [3333, 65000],
                "peer": "193.0.0.56",
            })
            .to_string()
        })
        .collect();

    c.bench_function("Pipeline ingest+flush (1000 events)", |b| {
        b.to_async(&rt).iter(|| async {
            for line in &lines {
                pipeline.ingest(line).await.unwrap();
            }
            pipeline.flush().await.unwrap();
        });
    });

    rt.block_on(pipeline.shutdown());
}

criterion_group!(
    benches,
    bench_policy_match,
    bench_normalize,
    bench_engine_process,
    bench_pipeline_ingest,
);
criterion_main!(benches);
