//! Benchmark of the pure decision path (gates + edge computation)

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use spotperp_bot::config::TradingSettings;
use spotperp_bot::core::{compute_edge, BookQuote};

fn bench_compute_edge(c: &mut Criterion) {
    let trading = TradingSettings {
        min_position_size: 100.0,
        min_edge_threshold: 1.0,
        ..TradingSettings::default()
    };
    let spot = BookQuote::new(50_000.0, 50_010.0, 1_700_000_000_000);
    let perp = BookQuote::new(50_100.0, 50_120.0, 1_700_000_000_000);

    c.bench_function("compute_edge", |b| {
        b.iter(|| {
            compute_edge(
                black_box(&trading),
                black_box("BTC"),
                black_box(spot),
                black_box(perp),
                black_box(50_050.0),
                black_box(0.0001),
            )
        })
    });
}

criterion_group!(benches, bench_compute_edge);
criterion_main!(benches);
