use std::hint::black_box;

use criterion::{BatchSize, BenchmarkId, Criterion, criterion_group, criterion_main};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tally_common::time::UnixTimestamp;
use tally_metrics::{
    Aggregator, AggregatorConfig, EntityId, Granularity, Metric, MetricName, Observation,
};

/// Base timestamp of generated metrics, 2024-02-29 13:07:00 UTC.
const BASE_TIMESTAMP: u64 = 1709212020;

struct MetricsGenerator {
    num_metrics: usize,
    num_names: usize,
    num_entities: usize,
}

impl MetricsGenerator {
    fn generate(&self, seed: u64) -> Vec<Metric> {
        let mut rng = StdRng::seed_from_u64(seed);

        (0..self.num_metrics)
            .map(|_| {
                let name = MetricName::new(format!(
                    "service_cpm_{}",
                    rng.random_range(0..self.num_names)
                ))
                .unwrap();
                let entity = EntityId::from(format!(
                    "svc{}",
                    rng.random_range(0..self.num_entities)
                ));
                let timestamp = UnixTimestamp::from_secs(BASE_TIMESTAMP + rng.random_range(0..60));

                Metric::from_observation(name, entity, timestamp, Observation::Cpm(1)).unwrap()
            })
            .collect()
    }
}

impl std::fmt::Display for MetricsGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} metrics, {} names, {} entities",
            self.num_metrics, self.num_names, self.num_entities
        )
    }
}

fn bench_accept(c: &mut Criterion) {
    let inputs = [
        MetricsGenerator {
            num_metrics: 10_000,
            num_names: 1,
            num_entities: 1,
        },
        MetricsGenerator {
            num_metrics: 10_000,
            num_names: 20,
            num_entities: 100,
        },
        MetricsGenerator {
            num_metrics: 10_000,
            num_names: 100,
            num_entities: 10_000,
        },
    ];

    let mut group = c.benchmark_group("accept");
    for input in &inputs {
        group.bench_with_input(BenchmarkId::from_parameter(input), input, |b, input| {
            b.iter_batched(
                || {
                    let aggregator = Aggregator::named(
                        "bench".to_owned(),
                        Granularity::Minute,
                        AggregatorConfig::default(),
                    );
                    (aggregator, input.generate(42))
                },
                |(aggregator, metrics)| {
                    for metric in metrics {
                        black_box(aggregator.accept(metric).unwrap());
                    }
                    aggregator
                },
                BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

fn bench_drain(c: &mut Criterion) {
    let input = MetricsGenerator {
        num_metrics: 10_000,
        num_names: 100,
        num_entities: 10_000,
    };

    c.bench_function("drain", |b| {
        b.iter_batched(
            || {
                let aggregator = Aggregator::named(
                    "bench".to_owned(),
                    Granularity::Minute,
                    AggregatorConfig::default(),
                );
                for metric in input.generate(7) {
                    aggregator.accept(metric).unwrap();
                }
                aggregator
            },
            |aggregator| black_box(aggregator.drain(UnixTimestamp::from_secs(0))),
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_accept, bench_drain);
criterion_main!(benches);
