// Copyright 2024 Ulvetanna Inc.

use fhe::bfv::{Ciphertext, Multiplicator, Plaintext};
use itertools::process_results;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, PoisonError};

use crate::{
	error::Error,
	network::ResultPackage,
	sender::db::SenderDb,
};

/// A deserialized-on-the-wire query: the receiver's relinearization keys and,
/// per source power (plus the power-0 encryption of one), one ciphertext per
/// bundle index.
#[derive(Debug, Clone)]
pub struct QueryRequest {
	pub relin_keys: Vec<u8>,
	pub powers: BTreeMap<u32, Vec<Vec<u8>>>,
}

/// Runs a query against the database, streaming one [`ResultPackage`] per
/// bundle through `sink` as soon as it is computed.
///
/// Bundle evaluation parallelizes over bundle-index columns on the
/// database's thread pool; packages therefore arrive in no particular
/// order. The whole query aborts on the first error; no partial results
/// follow a failure report.
pub fn process_query<F>(db: &SenderDb, request: &QueryRequest, sink: F) -> Result<(), Error>
where
	F: FnMut(ResultPackage) -> Result<(), Error> + Send,
{
	if db.is_writing() {
		return Err(Error::State("query rejected while the database is writing"));
	}

	let params = db.params();
	let crypto = db.crypto();
	let columns = params.bundle_index_count() as usize;

	let mut expected: BTreeSet<u32> = params.query_params().query_powers.clone();
	expected.insert(0);
	let received: BTreeSet<u32> = request.powers.keys().copied().collect();
	if received != expected {
		return Err(Error::InvalidQuery(format!(
			"query sends powers {received:?}, parameters require {expected:?}"
		)));
	}
	for (power, cts) in &request.powers {
		if cts.len() != columns {
			return Err(Error::InvalidQuery(format!(
				"power {power} carries {} ciphertexts, expected one per bundle index ({columns})",
				cts.len()
			)));
		}
	}

	let relin_key = crypto.relin_key_from_bytes(&request.relin_keys)?;
	let multiplicator = crypto.multiplicator(&relin_key)?;
	let dag = params.powers_dag();
	let ps_low_degree = params.query_params().ps_low_degree as usize;
	let label_byte_count = db.label_byte_count() as u32;
	let nonce_byte_count = db.nonce_byte_count() as u32;

	let sink = Mutex::new(sink);
	db.pool().install(|| {
		(0..columns).into_par_iter().try_for_each(|column| -> Result<(), Error> {
			let row = db.rows()[column]
				.read()
				.unwrap_or_else(PoisonError::into_inner);
			if row.is_empty() {
				return Ok(());
			}

			// Source powers for this column, keyed by exponent; 0 maps to
			// the receiver's encryption of one.
			let mut powers: HashMap<u32, Ciphertext> = HashMap::new();
			for (&power, cts) in &request.powers {
				powers.insert(power, crypto.ciphertext_from_bytes(&cts[column])?);
			}

			let column_degree = process_results(
				row.iter().map(|bundle| bundle.cache().map(|c| c.max_degree)),
				|degrees| degrees.max().unwrap_or(0),
			)?;

			// Derive the remaining powers level by level; nodes within one
			// level are independent and multiply in parallel.
			let targets = required_powers(column_degree, ps_low_degree);
			for level in dag.closure_levels(&targets) {
				let computed = level
					.par_iter()
					.map(|node| {
						let (a, b) = node
							.parents
							.expect("closure levels contain only derived powers");
						let product = multiplicator.multiply(&powers[&a], &powers[&b])?;
						Ok((node.power, product))
					})
					.collect::<Result<Vec<_>, Error>>()?;
				powers.extend(computed);
			}
			tracing::debug!(
				column,
				degree = column_degree,
				powers = powers.len(),
				"query powers ready"
			);

			row.par_iter().try_for_each(|bundle| -> Result<(), Error> {
				let cache = bundle.cache()?;
				let match_ct = evaluate_rows(
					&cache.matching_rows,
					&powers,
					ps_low_degree,
					&multiplicator,
				)?;
				let label_cts = cache
					.label_rows
					.iter()
					.map(|rows| {
						evaluate_rows(rows, &powers, ps_low_degree, &multiplicator)
							.map(|ct| crypto.ciphertext_to_bytes(&ct))
					})
					.collect::<Result<Vec<_>, _>>()?;

				let package = ResultPackage {
					bundle_index: column as u32,
					label_byte_count,
					nonce_byte_count,
					match_ct: crypto.ciphertext_to_bytes(&match_ct),
					label_cts,
				};
				let mut sink = sink.lock().unwrap_or_else(PoisonError::into_inner);
				(*sink)(package)
			})
		})
	})
}

/// The powers evaluation will index into: all of `1..=degree` for the plain
/// dot product, or the Paterson-Stockmeyer working set (the low window plus
/// the multiples of the split) when a split is configured.
fn required_powers(degree: usize, ps_low_degree: usize) -> BTreeSet<u32> {
	let mut targets = BTreeSet::new();
	if ps_low_degree == 0 || ps_low_degree >= degree.max(1) {
		for power in 1..=degree {
			targets.insert(power as u32);
		}
	} else {
		for power in 1..ps_low_degree.min(degree + 1) {
			targets.insert(power as u32);
		}
		let mut q = 1;
		while q * ps_low_degree <= degree {
			targets.insert((q * ps_low_degree) as u32);
			q += 1;
		}
	}
	targets
}

/// Evaluates one batched polynomial (rows of coefficients, row `r` for
/// `x^r`) at the encrypted query.
fn evaluate_rows(
	rows: &[Plaintext],
	powers: &HashMap<u32, Ciphertext>,
	ps_low_degree: usize,
	multiplicator: &Multiplicator,
) -> Result<Ciphertext, Error> {
	debug_assert!(!rows.is_empty());
	let degree = rows.len() - 1;
	if ps_low_degree == 0 || ps_low_degree >= degree.max(1) {
		return dot_product(rows, 0, powers);
	}

	// Paterson-Stockmeyer: split into windows of ps_low_degree, evaluate
	// each window with plaintext products only, then shift window `q` by
	// the precomputed power `x^(q * ps_low_degree)`.
	let split = ps_low_degree;
	let mut acc: Option<Ciphertext> = None;
	let mut q = 0usize;
	while q * split <= degree {
		let lo = q * split;
		let hi = (lo + split - 1).min(degree);
		let inner = dot_product(&rows[lo..=hi], 0, powers)?;
		let term = if q == 0 {
			inner
		} else {
			multiplicator.multiply(&powers[&((q * split) as u32)], &inner)?
		};
		acc = Some(match acc {
			None => term,
			Some(sum) => &sum + &term,
		});
		q += 1;
	}
	acc.ok_or_else(|| Error::Crypto("polynomial evaluation produced no terms".to_string()))
}

/// `sum_s x^(base + s) * rows[s]`, with `x^0` being the receiver-supplied
/// encryption of one.
fn dot_product(
	rows: &[Plaintext],
	base: usize,
	powers: &HashMap<u32, Ciphertext>,
) -> Result<Ciphertext, Error> {
	let mut acc: Option<Ciphertext> = None;
	for (offset, row) in rows.iter().enumerate() {
		let power = (base + offset) as u32;
		let ct = powers.get(&power).ok_or_else(|| {
			Error::Crypto(format!("power {power} was not derived before evaluation"))
		})?;
		let term = ct * row;
		acc = Some(match acc {
			None => term,
			Some(sum) => &sum + &term,
		});
	}
	acc.ok_or_else(|| Error::Crypto("polynomial evaluation produced no terms".to_string()))
}
