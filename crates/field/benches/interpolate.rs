// Copyright 2024 Ulvetanna Inc.

use apsi_field::{newton_interpolate, poly_from_roots, Modulus};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::{rngs::StdRng, Rng, SeedableRng};

fn bench_poly_from_roots(c: &mut Criterion) {
	let modulus = Modulus::new(65537).unwrap();
	let mut rng = StdRng::seed_from_u64(0);
	let mut group = c.benchmark_group("poly_from_roots");
	for size in [8usize, 32, 128] {
		let roots: Vec<u64> = (0..size).map(|_| rng.gen_range(0..65537)).collect();
		group.throughput(Throughput::Elements(size as u64));
		group.bench_with_input(BenchmarkId::from_parameter(size), &roots, |b, roots| {
			b.iter(|| poly_from_roots(roots, modulus));
		});
	}
	group.finish();
}

fn bench_newton_interpolate(c: &mut Criterion) {
	let modulus = Modulus::new(65537).unwrap();
	let mut rng = StdRng::seed_from_u64(0);
	let mut group = c.benchmark_group("newton_interpolate");
	for size in [8usize, 32, 128] {
		let mut points: Vec<u64> = (0..size as u64).collect();
		for p in points.iter_mut() {
			*p = *p * 509 + 1;
		}
		let values: Vec<u64> = (0..size).map(|_| rng.gen_range(0..65537)).collect();
		group.throughput(Throughput::Elements(size as u64));
		group.bench_with_input(
			BenchmarkId::from_parameter(size),
			&(points, values),
			|b, (points, values)| {
				b.iter(|| newton_interpolate(points, values, modulus).unwrap());
			},
		);
	}
	group.finish();
}

criterion_group!(benches, bench_poly_from_roots, bench_newton_interpolate);
criterion_main!(benches);
