use criterion::{criterion_group, criterion_main, Criterion};

use statespace_rs::{
    GaussianObservationModel, LocalLevelStateModel, MleConfig, MleMethod, StateSpaceModel,
};

fn local_level_model() -> StateSpaceModel {
    let mut level = 0.0;
    let y: Vec<f64> = (0..200)
        .map(|t| {
            level += 0.3 * ((t * 17 % 11) as f64 / 11.0 - 0.5);
            level + ((t * 7 % 5) as f64 / 5.0 - 0.4)
        })
        .collect();
    let mut model = StateSpaceModel::new(GaussianObservationModel::new(y, 1.0).unwrap());
    let mut state = LocalLevelStateModel::new(1.0).unwrap();
    state.set_initial_state(0.0, 100.0).unwrap();
    model.add_state(Box::new(state)).unwrap();
    model
}

fn bench_mle(c: &mut Criterion) {
    for method in [MleMethod::Lbfgs, MleMethod::Em] {
        let config = MleConfig {
            method,
            ..MleConfig::default()
        };
        c.bench_function(&format!("mle_{}_n200", method.name()), |b| {
            b.iter(|| {
                let mut model = local_level_model();
                std::hint::black_box(model.mle(&config).unwrap())
            })
        });
    }
}

criterion_group!(benches, bench_mle);
criterion_main!(benches);
