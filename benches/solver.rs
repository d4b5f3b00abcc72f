//! Benchmarks for the decomposition solver.

use criterion::{criterion_group, criterion_main, Criterion};
use marrow::prelude::*;
use nalgebra::{Point3, Rotation3, Vector3};

fn twisting_grid(n: usize, frames: usize) -> MotionSequence {
    let mut rest = Vec::with_capacity((n + 1) * (n + 1));
    for j in 0..=n {
        for i in 0..=n {
            rest.push(Point3::new(i as f64, j as f64, 0.0));
        }
    }

    let mut polygons = Vec::with_capacity(n * n);
    for j in 0..n {
        for i in 0..n {
            let v00 = j * (n + 1) + i;
            let v10 = v00 + 1;
            let v01 = v00 + (n + 1);
            let v11 = v01 + 1;
            polygons.push(vec![v00, v10, v11, v01]);
        }
    }

    // Twist around the x axis, increasing along x and over time.
    let mut animated = Vec::with_capacity(frames);
    for k in 1..=frames {
        let frame: Vec<Point3<f64>> = rest
            .iter()
            .map(|p| {
                let angle = 0.2 * k as f64 * p.x / n as f64;
                let rot = Rotation3::from_axis_angle(&Vector3::x_axis(), angle);
                Point3::from(rot * p.coords)
            })
            .collect();
        animated.push(frame);
    }
    MotionSequence::single_subject(&rest, &animated, polygons).unwrap()
}

fn bench_initialization(c: &mut Criterion) {
    c.bench_function("init_grid_8x8_4_bones", |b| {
        b.iter(|| {
            let mut solver =
                Decomposition::new(twisting_grid(8, 4), 4, SolveOptions::default()).unwrap();
            solver.init().unwrap();
            solver.num_bones()
        });
    });
}

fn bench_solve(c: &mut Criterion) {
    c.bench_function("compute_grid_8x8_4_bones_3_rounds", |b| {
        b.iter(|| {
            let options = SolveOptions::default().with_iterations(3);
            let mut solver = Decomposition::new(twisting_grid(8, 4), 4, options).unwrap();
            solver.compute().unwrap();
            solver.rmse()
        });
    });
}

criterion_group!(benches, bench_initialization, bench_solve);
criterion_main!(benches);
