use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use kolosal_nas::config::NasConfig;
use kolosal_nas::nas::{Compact, DatasetApi, Genotype, NasBench301SearchSpace, SurrogateModel};
use kolosal_nas::optimizer::SuccessiveHalving;
use kolosal_nas::Result;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;

struct OpCount;

impl SurrogateModel for OpCount {
    fn predict(&self, genotype: &Genotype) -> Result<f64> {
        Ok(genotype.normal.iter().filter(|(op, _)| op.contains("conv")).count() as f64)
    }
}

fn bench_sampling(c: &mut Criterion) {
    let mut group = c.benchmark_group("sampling");
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(42);

    group.bench_function("compact", |b| b.iter(|| Compact::sample_random(black_box(&mut rng))));

    let mut space = NasBench301SearchSpace::try_default().unwrap();
    group.bench_function("set_compact", |b| {
        b.iter(|| space.sample_random_architecture(black_box(&mut rng), false).unwrap())
    });

    let template = NasBench301SearchSpace::try_default().unwrap();
    group.bench_function("discretize", |b| {
        b.iter(|| {
            let mut space = template.clone();
            space.sample_random_architecture(&mut rng, false).unwrap();
            space.prepare_discretization(&mut rng).unwrap();
            space
        })
    });

    group.finish();
}

fn bench_bracket(c: &mut Criterion) {
    let mut group = c.benchmark_group("successive_halving");
    group.sample_size(10);

    let space = NasBench301SearchSpace::try_default().unwrap();
    let api = Arc::new(DatasetApi::new(Box::new(OpCount), Box::new(OpCount)));

    for number_archs in [16, 64].iter() {
        let config = NasConfig::new().with_schedule(*number_archs, 2, 1, 64);
        group.bench_with_input(BenchmarkId::new("bracket", number_archs), &config, |b, config| {
            b.iter(|| {
                let mut sh: SuccessiveHalving = SuccessiveHalving::new(config).unwrap();
                sh.adapt_search_space(&space, Some(api.clone())).unwrap();
                while !sh.is_terminated() {
                    sh.new_epoch().unwrap();
                }
                sh.fidelity()
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_sampling, bench_bracket);
criterion_main!(benches);
