//! Throughput benchmarks for bulk event processing.
//!
//! Run with: `cargo bench --bench throughput`

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::Rng;
use rust_decimal::Decimal;
use uuid::Uuid;

use correlation_engine::{CabalConfig, CabalDetector};
use sentinel_core::types::TradeEvent;
use sentinel_core::MemoryStore;
use signal_attribution::{
    AttributionConfig, AttributionLedger, CompletionDiagnostics, LeaderboardQuery, SourceType,
    TradeCompletion,
};

fn start() -> DateTime<Utc> {
    Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()
}

/// A trade stream where `wallets` wallets hit `tokens` tokens in bursts.
fn generate_trades(count: usize, wallets: usize, tokens: usize) -> Vec<TradeEvent> {
    let mut rng = rand::thread_rng();
    let mut clock = start();

    (0..count)
        .map(|i| {
            clock += Duration::milliseconds(rng.gen_range(1..400));
            TradeEvent {
                tx_hash: format!("tx-{i}"),
                wallet: format!("wallet-{}", rng.gen_range(0..wallets)),
                token: format!("token-{}", rng.gen_range(0..tokens)),
                slot: i as u64,
                time: clock,
            }
        })
        .collect()
}

fn generate_completions(count: usize, sources: usize) -> Vec<TradeCompletion> {
    let mut rng = rand::thread_rng();

    (0..count)
        .map(|i| {
            let won = rng.gen_bool(0.55);
            let pnl_cents: i64 = if won {
                rng.gen_range(1..5_000)
            } else {
                -rng.gen_range(1..5_000)
            };
            let source = i % sources;
            TradeCompletion {
                trade_id: Uuid::new_v4(),
                source_id: format!("cabal:{source}"),
                source_type: if source % 2 == 0 {
                    SourceType::Cabal
                } else {
                    SourceType::FreshWallet
                },
                pnl: Decimal::new(pnl_cents, 2),
                pnl_pct: pnl_cents as f64 / 10_000.0,
                won,
                position_size: Decimal::new(50, 0),
                completed_at: start() + Duration::seconds(i as i64),
                diagnostics: CompletionDiagnostics::default(),
            }
        })
        .collect()
}

/// Trade ingestion through the cabal detector, edges included.
fn bench_trade_ingestion(c: &mut Criterion) {
    let mut group = c.benchmark_group("trade_ingestion");
    let rt = tokio::runtime::Runtime::new().unwrap();

    for count in [100usize, 1_000].iter() {
        let trades = generate_trades(*count, 40, 5);

        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::new("process_trade", count), &trades, |b, trades| {
            b.to_async(&rt).iter(|| async {
                let detector = CabalDetector::new(Arc::new(MemoryStore::new()), CabalConfig::default());
                for trade in trades {
                    black_box(detector.process_trade(trade).await.unwrap());
                }
            })
        });
    }

    group.finish();
}

/// A clustering pass over an already populated graph.
fn bench_clustering_pass(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let trades = generate_trades(2_000, 60, 8);
    let detector = CabalDetector::new(Arc::new(MemoryStore::new()), CabalConfig::default());
    let last = rt.block_on(async {
        for trade in &trades {
            detector.process_trade(trade).await.unwrap();
        }
        trades.last().map(|t| t.time).unwrap_or_else(start)
    });

    c.bench_function("run_clustering_at", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(detector.run_clustering_at(last).await.unwrap()) })
    });
}

fn bench_attribution_updates(c: &mut Criterion) {
    let mut group = c.benchmark_group("attribution_updates");
    let rt = tokio::runtime::Runtime::new().unwrap();

    for sources in [10usize, 500].iter() {
        let completions = generate_completions(2_000, *sources);

        group.throughput(Throughput::Elements(completions.len() as u64));
        group.bench_with_input(
            BenchmarkId::new("record_completion", sources),
            &completions,
            |b, completions| {
                b.to_async(&rt).iter(|| async {
                    let ledger = AttributionLedger::new(AttributionConfig::default());
                    for completion in completions {
                        black_box(ledger.record_completion(completion).await.unwrap());
                    }
                })
            },
        );
    }

    group.finish();
}

fn bench_leaderboard(c: &mut Criterion) {
    let mut group = c.benchmark_group("leaderboard");
    let rt = tokio::runtime::Runtime::new().unwrap();

    for sources in [100usize, 5_000].iter() {
        let ledger = AttributionLedger::new(AttributionConfig::default());
        rt.block_on(async {
            for completion in generate_completions(sources * 6, *sources) {
                ledger.record_completion(&completion).await.unwrap();
            }
        });
        let query = LeaderboardQuery {
            limit: Some(20),
            ..Default::default()
        };

        group.throughput(Throughput::Elements(*sources as u64));
        group.bench_with_input(BenchmarkId::new("top_20", sources), &ledger, |b, ledger| {
            b.iter(|| black_box(ledger.leaderboard(black_box(&query))))
        });
        group.bench_with_input(BenchmarkId::new("type_summary", sources), &ledger, |b, ledger| {
            b.iter(|| black_box(ledger.type_summary()))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_trade_ingestion,
    bench_clustering_pass,
    bench_attribution_updates,
    bench_leaderboard,
);

criterion_main!(benches);
