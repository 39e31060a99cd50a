//! # Router Benchmark Harness
//!
//! Purpose: Measure routing overhead of the sharded client over in-memory
//! backends, and show how evenly keys spread across groups.
//!
//! ## Design Principles
//! 1. **Deterministic Workload**: Fixed PRNG seeds keep runs comparable.
//! 2. **Allocation Control**: Keys and values are built before timing starts.
//! 3. **No Network**: Memory backends isolate hashing, routing and fan-out
//!    from socket latency.
//!
//! Usage: `bench_router [groups] [mirrors] [keys] [ops]`

use std::env;
use std::hint::black_box;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{ensure, Context, Result};
use skv_common::BackendClient;
use skv_engine::MemoryBackend;
use skv_shard::{ShardMap, ShardedClient};
use tracing::info;

const DEFAULT_GROUPS: usize = 4;
const DEFAULT_MIRRORS: usize = 2;
const DEFAULT_KEY_COUNT: usize = 1 << 14;
const DEFAULT_OP_COUNT: usize = 200_000;
const VALUE_SIZE: usize = 64;
const BATCH_SIZE: usize = 32;

struct BenchConfig {
    groups: usize,
    mirrors: usize,
    key_count: usize,
    key_mask: usize,
    op_count: usize,
}

impl BenchConfig {
    fn from_args() -> Self {
        let mut args = env::args().skip(1);
        let groups = parse_usize(args.next(), DEFAULT_GROUPS);
        let mirrors = parse_usize(args.next(), DEFAULT_MIRRORS);
        let key_count = parse_usize(args.next(), DEFAULT_KEY_COUNT)
            .max(1)
            .next_power_of_two();
        let op_count = parse_usize(args.next(), DEFAULT_OP_COUNT);

        BenchConfig {
            groups,
            mirrors,
            key_count,
            key_mask: key_count - 1,
            op_count,
        }
    }
}

fn parse_usize(value: Option<String>, fallback: usize) -> usize {
    value.and_then(|raw| raw.parse().ok()).unwrap_or(fallback)
}

/// XorShift keeps the workload reproducible without an RNG crate.
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    #[inline]
    fn next_index(&mut self, mask: usize) -> usize {
        (self.next_u64() as usize) & mask
    }
}

fn report(label: &str, ops: usize, elapsed: Duration) {
    let secs = elapsed.as_secs_f64();
    let ops_per_sec = (ops as f64) / secs;
    let nanos_per_op = (secs * 1e9) / (ops as f64);
    println!(
        "{label}: {ops} ops in {secs:.3}s ({ops_per_sec:.0} ops/s, {nanos_per_op:.1} ns/op)"
    );
}

fn build_client(config: &BenchConfig) -> Result<ShardedClient<MemoryBackend>> {
    let groups = (0..config.groups)
        .map(|g| {
            (0..config.mirrors)
                .map(|m| Arc::new(MemoryBackend::new(format!("g{g}m{m}"))))
                .collect()
        })
        .collect();
    let map = ShardMap::new(groups).context("building shard map")?;
    Ok(ShardedClient::new(map))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = BenchConfig::from_args();
    ensure!(config.groups > 0, "groups must be > 0");
    ensure!(config.mirrors > 0, "mirrors must be > 0");

    let client = build_client(&config)?;
    let keys: Vec<String> = (0..config.key_count).map(|idx| format!("key:{idx:08}")).collect();
    let value = vec![0x5Au8; VALUE_SIZE];

    info!(
        groups = config.groups,
        mirrors = config.mirrors,
        keys = config.key_count,
        ops = config.op_count,
        "starting router benchmark"
    );

    let mut per_group = vec![0usize; config.groups];
    for key in &keys {
        per_group[client.shard_map().shard_index(key)] += 1;
    }
    for (group, count) in per_group.iter().enumerate() {
        let share = (*count as f64) * 100.0 / (config.key_count as f64);
        println!("group {group}: {count} keys ({share:.1}%)");
    }

    let mut rng = XorShift64::new(0x0FED_CBA9_8765_4321);
    let start = Instant::now();
    for _ in 0..config.op_count {
        let key = keys[rng.next_index(config.key_mask)].as_str();
        let results = client.write(key, |backend| backend.set(key, &value, None))?;
        black_box(results);
    }
    report("SET", config.op_count, start.elapsed());

    let mut rng = XorShift64::new(0x1234_5678_9ABC_DEF0);
    let start = Instant::now();
    for _ in 0..config.op_count {
        let key = keys[rng.next_index(config.key_mask)].as_str();
        let found = client.read(key, |backend| backend.get(key))?;
        black_box(found);
    }
    report("GET", config.op_count, start.elapsed());

    let mut rng = XorShift64::new(0xA5A5_A5A5_A5A5_A5A5);
    let batches = (config.op_count / BATCH_SIZE).max(1);
    let mut batch = Vec::with_capacity(BATCH_SIZE);
    let start = Instant::now();
    for _ in 0..batches {
        batch.clear();
        batch.extend((0..BATCH_SIZE).map(|_| keys[rng.next_index(config.key_mask)].clone()));
        let values = client.read_many_keys(&batch, |backend, subset| backend.get_values(subset))?;
        black_box(values);
    }
    report("MGET", batches * BATCH_SIZE, start.elapsed());

    client.dispose();
    Ok(())
}
