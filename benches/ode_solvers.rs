use criterion::{criterion_group, criterion_main, Criterion};
use nalgebra::{dvector, DVector};
use polysol::{CallState, Closure, Lsoda, Task, Tolerance};

fn exponential_decay(c: &mut Criterion) {
    c.bench_function("lsoda_exponential_decay", |b| {
        b.iter(|| {
            let mut rhs = Closure::new(1, |_t, y: &DVector<f64>, dydt: &mut DVector<f64>| {
                dydt[0] = -y[0];
            });
            let mut solver = Lsoda::new(Tolerance::from(1e-8), Tolerance::from(1e-8));
            let mut y = dvector![1.0];
            let mut t = 0.0;
            solver
                .advance(&mut rhs, &mut y, &mut t, 10.0, Task::Normal, CallState::FirstCall)
                .unwrap();
            y
        })
    });
}

fn stiff_relaxation(c: &mut Criterion) {
    c.bench_function("lsoda_stiff_relaxation", |b| {
        b.iter(|| {
            let mut rhs = Closure::new(2, |_t, y: &DVector<f64>, dydt: &mut DVector<f64>| {
                dydt[0] = -1000.0 * (y[0] - y[1].cos());
                dydt[1] = 1.0;
            });
            let mut solver = Lsoda::new(Tolerance::from(1e-6), Tolerance::from(1e-6));
            let mut y = dvector![0.0, 0.0];
            let mut t = 0.0;
            solver
                .advance(&mut rhs, &mut y, &mut t, 5.0, Task::Normal, CallState::FirstCall)
                .unwrap();
            y
        })
    });
}

criterion_group!(benches, exponential_decay, stiff_relaxation);
criterion_main!(benches);
