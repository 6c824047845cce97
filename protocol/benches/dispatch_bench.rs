// Dispatch path benchmarks for peerchain.
//
// Covers the block-arrival dedup cache, frame encoding, and a full
// validator + handler pass through the dispatcher.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use peerchain_protocol::network::{
    Dispatcher, MessageEnvelope, MessageHandler, MessageKind, MessageValidator, TtlCache,
};

struct DedupValidator {
    cache: TtlCache,
}

impl MessageValidator for DedupValidator {
    fn check(&self, envelope: &MessageEnvelope) -> bool {
        !self
            .cache
            .check_repeat(&envelope.payload_str(), Duration::from_secs(60))
    }
}

#[derive(Default)]
struct CountingHandler {
    seen: AtomicU64,
}

#[async_trait]
impl MessageHandler for CountingHandler {
    async fn handle(&self, _envelope: &MessageEnvelope) -> bool {
        self.seen.fetch_add(1, Ordering::Relaxed);
        true
    }
}

fn bench_cache_check_repeat(c: &mut Criterion) {
    let mut group = c.benchmark_group("ttl_cache");
    for prefill in [0usize, 1_000, 100_000] {
        let cache = TtlCache::new();
        for i in 0..prefill {
            cache.check_repeat(&format!("block-{i}"), Duration::from_secs(60));
        }
        group.bench_with_input(BenchmarkId::new("repeat_hit", prefill), &cache, |b, cache| {
            b.iter(|| cache.check_repeat("block-0", Duration::from_secs(60)))
        });
    }
    group.finish();
}

fn bench_envelope_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope_encode");
    for size in [64usize, 4 * 1024, 256 * 1024] {
        let env = MessageEnvelope::new(MessageKind::BlockArrived, vec![0x5Au8; size]);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &env, |b, env| {
            b.iter(|| env.encode().unwrap())
        });
    }
    group.finish();
}

fn bench_dispatch(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let dispatcher = Dispatcher::new();
    dispatcher.set_validator(
        MessageKind::BlockArrived,
        Arc::new(DedupValidator {
            cache: TtlCache::new(),
        }),
    );
    for _ in 0..3 {
        dispatcher.add_handler(MessageKind::BlockArrived, Arc::new(CountingHandler::default()));
    }

    let mut n = 0u64;
    c.bench_function("dispatch_fresh_envelope", |b| {
        b.iter(|| {
            n += 1;
            let env = MessageEnvelope::new(MessageKind::BlockArrived, n.to_string());
            rt.block_on(dispatcher.dispatch(env))
        })
    });
    c.bench_function("dispatch_duplicate_envelope", |b| {
        b.iter(|| {
            let env = MessageEnvelope::new(MessageKind::BlockArrived, "1");
            rt.block_on(dispatcher.dispatch(env))
        })
    });
}

criterion_group!(
    benches,
    bench_cache_check_repeat,
    bench_envelope_encode,
    bench_dispatch,
);
criterion_main!(benches);
