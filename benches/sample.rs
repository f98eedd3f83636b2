use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use prior_sensitivity::model::ModelParameters;
use prior_sensitivity::{
    DataGenerator, LinearRegression, PriorSpec, Sampler, SamplerConfig, SlopePrior, TrueParams,
};

fn model(n: usize) -> LinearRegression {
    let truth = TrueParams {
        intercept: 1.0,
        slope: 2.0,
        noise_sd: 0.5,
    };
    let data = DataGenerator::new(truth).unwrap().generate(n, 123).unwrap();
    LinearRegression::new(
        &data,
        PriorSpec::new(10.0, SlopePrior::Normal { sd: 1.0 }, 5.0).unwrap(),
    )
}

fn bench_gradient(c: &mut Criterion) {
    let model = model(1000);
    let params = ModelParameters::new(0.9, 2.1, -0.6);
    c.bench_function("gradient", |b| {
        b.iter(|| black_box(model.gradient(black_box(&params))))
    });
}

fn bench_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("nuts_chain");
    group.sample_size(10);
    for n in [10, 100, 1000] {
        let model = model(n);
        let config = SamplerConfig {
            n_warmup: 500,
            n_sampling: 500,
            ..SamplerConfig::default()
        };
        group.bench_with_input(BenchmarkId::from_parameter(n), &model, |b, model| {
            b.iter(|| {
                Sampler::new(model, config, 0, ModelParameters::default())
                    .unwrap()
                    .set_seed(42)
                    .run(None)
                    .unwrap()
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_gradient, bench_chain);
criterion_main!(benches);
