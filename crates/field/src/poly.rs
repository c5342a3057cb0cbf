// Copyright 2024 Ulvetanna Inc.

use crate::{
	error::Error,
	felt::{Felt, Modulus},
};

/// Coefficients of the monic polynomial `prod_i (x - roots[i])`, low degree
/// first. The empty product is the constant polynomial `1`.
pub fn poly_from_roots(roots: &[Felt], modulus: Modulus) -> Vec<Felt> {
	let mut coeffs = Vec::with_capacity(roots.len() + 1);
	coeffs.push(1 as Felt);
	for &root in roots {
		let neg_root = modulus.neg(modulus.reduce(root));
		coeffs.push(0);
		for i in (0..coeffs.len() - 1).rev() {
			let scaled = modulus.mul(coeffs[i], neg_root);
			coeffs[i + 1] = modulus.add(coeffs[i + 1], coeffs[i]);
			coeffs[i] = scaled;
		}
	}
	coeffs
}

/// Newton divided-difference interpolation.
///
/// Returns the monomial coefficients (low degree first, `points.len()` of
/// them) of the unique polynomial of degree below `points.len()` with
/// `P(points[i]) = values[i]`. The points must be pairwise distinct.
pub fn newton_interpolate(points: &[Felt], values: &[Felt], modulus: Modulus) -> Result<Vec<Felt>, Error> {
	assert_eq!(points.len(), values.len());
	let n = points.len();
	if n == 0 {
		return Ok(Vec::new());
	}

	// Divided-difference table, kept in place: after pass `j`, entry `i`
	// holds f[x_i, ..., x_{i+j}].
	let mut table: Vec<Felt> = values.iter().map(|&v| modulus.reduce(v)).collect();
	for j in 1..n {
		for i in (j..n).rev() {
			let dx = modulus.sub(modulus.reduce(points[i]), modulus.reduce(points[i - j]));
			if dx == 0 {
				return Err(Error::RepeatedInterpolationPoint);
			}
			let dy = modulus.sub(table[i], table[i - 1]);
			table[i] = modulus.mul(dy, modulus.inv(dx)?);
		}
	}

	// Expand the Newton form into monomial coefficients.
	let mut coeffs = vec![0 as Felt; n];
	coeffs[0] = table[n - 1];
	let mut degree = 0usize;
	for j in (0..n - 1).rev() {
		let x = modulus.reduce(points[j]);
		let neg_x = modulus.neg(x);
		degree += 1;
		for i in (1..=degree).rev() {
			coeffs[i] = modulus.add(coeffs[i - 1], modulus.mul(coeffs[i], neg_x));
		}
		coeffs[0] = modulus.add(modulus.mul(coeffs[0], neg_x), table[j]);
	}
	Ok(coeffs)
}

/// Horner evaluation of a coefficient vector (low degree first).
pub fn poly_eval(coeffs: &[Felt], x: Felt, modulus: Modulus) -> Felt {
	let x = modulus.reduce(x);
	coeffs
		.iter()
		.rev()
		.fold(0, |acc, &c| modulus.add(modulus.mul(acc, x), modulus.reduce(c)))
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;
	use std::collections::BTreeSet;

	fn modulus() -> Modulus {
		Modulus::new(65537).unwrap()
	}

	#[test]
	fn empty_root_product_is_one() {
		let m = modulus();
		assert_eq!(poly_from_roots(&[], m), vec![1]);
	}

	#[test]
	fn root_product_vanishes_exactly_on_roots() {
		let m = modulus();
		let roots = [3u64, 17, 40000, 65536];
		let coeffs = poly_from_roots(&roots, m);
		assert_eq!(coeffs.len(), roots.len() + 1);
		assert_eq!(*coeffs.last().unwrap(), 1);
		for &r in &roots {
			assert_eq!(poly_eval(&coeffs, r, m), 0);
		}
		assert_ne!(poly_eval(&coeffs, 5, m), 0);
	}

	#[test]
	fn interpolation_hits_every_point() {
		let m = modulus();
		let points = [1u64, 2, 3, 5, 8];
		let values = [10u64, 20, 31, 400, 65000];
		let coeffs = newton_interpolate(&points, &values, m).unwrap();
		assert_eq!(coeffs.len(), points.len());
		for (&x, &y) in points.iter().zip(values.iter()) {
			assert_eq!(poly_eval(&coeffs, x, m), y);
		}
	}

	#[test]
	fn interpolation_of_constant() {
		let m = modulus();
		let coeffs = newton_interpolate(&[42], &[7], m).unwrap();
		assert_eq!(coeffs, vec![7]);
	}

	#[test]
	fn repeated_points_rejected() {
		let m = modulus();
		assert!(matches!(
			newton_interpolate(&[1, 2, 1], &[5, 6, 7], m),
			Err(Error::RepeatedInterpolationPoint)
		));
	}

	proptest! {
		#[test]
		fn interpolation_matches_arbitrary_data(
			raw in proptest::collection::vec((0u64..65537, 0u64..65537), 1..12)
		) {
			let m = modulus();
			// Dedup x-coordinates; interpolation needs them distinct.
			let mut seen = BTreeSet::new();
			let pairs: Vec<_> = raw.into_iter().filter(|(x, _)| seen.insert(*x)).collect();
			let points: Vec<_> = pairs.iter().map(|(x, _)| *x).collect();
			let values: Vec<_> = pairs.iter().map(|(_, y)| *y).collect();
			let coeffs = newton_interpolate(&points, &values, m).unwrap();
			for (&x, &y) in points.iter().zip(values.iter()) {
				prop_assert_eq!(poly_eval(&coeffs, x, m), y);
			}
		}
	}
}
