// Copyright 2024 Ulvetanna Inc.

use fhe::bfv::Plaintext;

use apsi_field::{newton_interpolate, poly_from_roots, Felt, Modulus};

use crate::{crypto::CryptoContext, error::Error};

/// One item stored in a bin: its field elements and, for labeled databases,
/// the field elements of its encrypted label (`label_parts` chunks laid out
/// consecutively, `felts_per_item` felts each).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BundleEntry {
	pub item: Vec<Felt>,
	pub label: Vec<Felt>,
}

/// Precomputed polynomial data of a bundle, ready for homomorphic
/// evaluation. Slot `s` of coefficient row `r` holds the degree-`r`
/// coefficient of the polynomial attached to plaintext slot `s`.
pub(crate) struct BundleCache {
	pub max_degree: usize,
	pub matching_coeffs: Vec<Vec<u64>>,
	pub label_coeffs: Vec<Vec<Vec<u64>>>,
	pub matching_rows: Vec<Plaintext>,
	pub label_rows: Vec<Vec<Plaintext>>,
}

/// One cell of the sender database grid.
///
/// Holds `bin_count` bins of up to `max_items_per_bin` items each. Every
/// item spreads over `felts_per_item` consecutive plaintext slots; the
/// per-slot matching polynomial has the items' felts at that slot as roots,
/// so it decrypts to zero exactly where the query agrees. Mutation
/// invalidates the cache; [`BinBundle::encode`] rebuilds it.
pub struct BinBundle {
	felts_per_item: usize,
	bin_count: usize,
	max_items_per_bin: usize,
	label_parts: usize,
	bins: Vec<Vec<BundleEntry>>,
	cache: Option<BundleCache>,
	stripped: bool,
}

impl BinBundle {
	pub fn new(
		felts_per_item: usize,
		bin_count: usize,
		max_items_per_bin: usize,
		label_parts: usize,
	) -> Self {
		Self {
			felts_per_item,
			bin_count,
			max_items_per_bin,
			label_parts,
			bins: vec![Vec::new(); bin_count],
			cache: None,
			stripped: false,
		}
	}

	pub fn bin_count(&self) -> usize {
		self.bin_count
	}

	pub fn slot_count(&self) -> usize {
		self.bin_count * self.felts_per_item
	}

	pub fn is_labeled(&self) -> bool {
		self.label_parts > 0
	}

	pub fn is_stripped(&self) -> bool {
		self.stripped
	}

	pub fn item_count(&self) -> usize {
		self.bins.iter().map(Vec::len).sum()
	}

	pub fn max_load(&self) -> usize {
		self.bins.iter().map(Vec::len).max().unwrap_or(0)
	}

	pub(crate) fn find_entry(&self, bin: usize, item: &[Felt]) -> Option<usize> {
		self.bins[bin].iter().position(|entry| entry.item == item)
	}

	/// Whether `item` can join `bin`: the bin must have room and, in labeled
	/// bundles, no stored item may collide with it on any slot, since the
	/// label polynomial interpolates over per-slot felts and needs its
	/// interpolation points distinct.
	pub(crate) fn can_insert(&self, bin: usize, item: &[Felt]) -> bool {
		if self.stripped || self.bins[bin].len() >= self.max_items_per_bin {
			return false;
		}
		if self.is_labeled() {
			let collides = self.bins[bin].iter().any(|entry| {
				entry
					.item
					.iter()
					.zip(item.iter())
					.any(|(stored, new)| stored == new)
			});
			if collides {
				return false;
			}
		}
		true
	}

	pub(crate) fn insert(&mut self, bin: usize, entry: BundleEntry) -> Result<(), Error> {
		if !self.can_insert(bin, &entry.item) {
			return Err(Error::CapacityExceeded);
		}
		debug_assert_eq!(entry.item.len(), self.felts_per_item);
		debug_assert_eq!(entry.label.len(), self.label_parts * self.felts_per_item);
		self.bins[bin].push(entry);
		self.cache = None;
		Ok(())
	}

	pub(crate) fn update_label(&mut self, bin: usize, entry_index: usize, label: Vec<Felt>) {
		debug_assert_eq!(label.len(), self.label_parts * self.felts_per_item);
		self.bins[bin][entry_index].label = label;
		self.cache = None;
	}

	/// Recomputes polynomials and batched plaintexts if the bundle is stale.
	pub fn encode(&mut self, ctx: &CryptoContext, modulus: Modulus) -> Result<(), Error> {
		if self.cache.is_some() {
			return Ok(());
		}
		if self.stripped {
			return Err(Error::State("cannot re-encode a stripped bundle"));
		}

		let max_degree = self.max_load();
		let slot_count = self.slot_count();
		let mut matching_coeffs = vec![vec![0u64; slot_count]; max_degree + 1];
		let mut label_coeffs =
			vec![vec![vec![0u64; slot_count]; max_degree]; self.label_parts];

		for (bin_index, bin) in self.bins.iter().enumerate() {
			for felt_index in 0..self.felts_per_item {
				let slot = bin_index * self.felts_per_item + felt_index;
				let roots: Vec<Felt> =
					bin.iter().map(|entry| entry.item[felt_index]).collect();
				let coeffs = poly_from_roots(&roots, modulus);
				for (row, &coeff) in coeffs.iter().enumerate() {
					matching_coeffs[row][slot] = coeff;
				}

				if self.label_parts > 0 && !bin.is_empty() {
					for part in 0..self.label_parts {
						let values: Vec<Felt> = bin
							.iter()
							.map(|entry| entry.label[part * self.felts_per_item + felt_index])
							.collect();
						let coeffs = newton_interpolate(&roots, &values, modulus)?;
						for (row, &coeff) in coeffs.iter().enumerate() {
							label_coeffs[part][row][slot] = coeff;
						}
					}
				}
			}
		}

		self.cache = Some(Self::build_cache(
			ctx,
			max_degree,
			matching_coeffs,
			label_coeffs,
		)?);
		Ok(())
	}

	fn build_cache(
		ctx: &CryptoContext,
		max_degree: usize,
		matching_coeffs: Vec<Vec<u64>>,
		label_coeffs: Vec<Vec<Vec<u64>>>,
	) -> Result<BundleCache, Error> {
		let matching_rows = matching_coeffs
			.iter()
			.map(|row| ctx.encode_simd(row))
			.collect::<Result<Vec<_>, _>>()?;
		let label_rows = label_coeffs
			.iter()
			.map(|part| {
				part.iter()
					.map(|row| ctx.encode_simd(row))
					.collect::<Result<Vec<_>, _>>()
			})
			.collect::<Result<Vec<_>, _>>()?;
		Ok(BundleCache {
			max_degree,
			matching_coeffs,
			label_coeffs,
			matching_rows,
			label_rows,
		})
	}

	pub(crate) fn cache(&self) -> Result<&BundleCache, Error> {
		self.cache
			.as_ref()
			.ok_or(Error::State("bundle polynomials have not been encoded"))
	}

	/// Drops the raw items, keeping only the encoded polynomial data.
	pub(crate) fn strip(&mut self) -> Result<(), Error> {
		if self.cache.is_none() {
			return Err(Error::State("cannot strip an unencoded bundle"));
		}
		self.bins = Vec::new();
		self.stripped = true;
		Ok(())
	}

	/// Rebuilds a bundle from persisted cache data.
	pub(crate) fn from_parts(
		felts_per_item: usize,
		bin_count: usize,
		max_items_per_bin: usize,
		label_parts: usize,
		bins: Option<Vec<Vec<BundleEntry>>>,
		ctx: &CryptoContext,
		max_degree: usize,
		matching_coeffs: Vec<Vec<u64>>,
		label_coeffs: Vec<Vec<Vec<u64>>>,
	) -> Result<Self, Error> {
		let stripped = bins.is_none();
		let cache = Self::build_cache(ctx, max_degree, matching_coeffs, label_coeffs)?;
		Ok(Self {
			felts_per_item,
			bin_count,
			max_items_per_bin,
			label_parts,
			bins: bins.unwrap_or_default(),
			cache: Some(cache),
			stripped,
		})
	}

	pub(crate) fn bins(&self) -> &[Vec<BundleEntry>] {
		&self.bins
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::params::{BfvParams, ItemParams, PsiParams, QueryParams, TableParams};
	use apsi_field::poly_eval;

	fn context() -> (CryptoContext, Modulus) {
		let params = PsiParams::new(
			ItemParams { felts_per_item: 4 },
			TableParams {
				hash_func_count: 3,
				table_size: 256,
				max_items_per_bin: 16,
			},
			QueryParams {
				ps_low_degree: 0,
				query_powers: [1, 2, 4, 8].into_iter().collect(),
			},
			BfvParams {
				poly_modulus_degree: 2048,
				coeff_modulus_bits: vec![36, 37],
				plain_modulus: 40961,
			},
		)
		.unwrap();
		(CryptoContext::new(&params).unwrap(), params.plain_modulus())
	}

	fn entry(item: [u64; 4]) -> BundleEntry {
		BundleEntry {
			item: item.to_vec(),
			label: Vec::new(),
		}
	}

	#[test]
	fn matching_polynomials_vanish_on_inserted_items() {
		let (ctx, modulus) = context();
		let mut bundle = BinBundle::new(4, 8, 4, 0);
		bundle.insert(0, entry([1, 2, 3, 4])).unwrap();
		bundle.insert(0, entry([5, 6, 7, 8])).unwrap();
		bundle.insert(3, entry([9, 10, 11, 12])).unwrap();
		bundle.encode(&ctx, modulus).unwrap();

		let cache = bundle.cache().unwrap();
		assert_eq!(cache.max_degree, 2);

		// Slot polynomial of bin 0, felt 1 must vanish at 2 and 6.
		let coeffs: Vec<u64> = cache.matching_coeffs.iter().map(|row| row[1]).collect();
		assert_eq!(poly_eval(&coeffs, 2, modulus), 0);
		assert_eq!(poly_eval(&coeffs, 6, modulus), 0);
		assert_ne!(poly_eval(&coeffs, 3, modulus), 0);

		// Empty bins evaluate to a nonzero constant.
		let empty: Vec<u64> = cache.matching_coeffs.iter().map(|row| row[4 * 4]).collect();
		assert_eq!(empty[0], 1);
		assert_eq!(poly_eval(&empty, 0, modulus), 1);
	}

	#[test]
	fn label_polynomials_interpolate_labels() {
		let (ctx, modulus) = context();
		let mut bundle = BinBundle::new(4, 8, 4, 2);
		bundle
			.insert(
				2,
				BundleEntry {
					item: vec![10, 20, 30, 40],
					label: vec![100, 200, 300, 400, 500, 600, 700, 800],
				},
			)
			.unwrap();
		bundle
			.insert(
				2,
				BundleEntry {
					item: vec![11, 21, 31, 41],
					label: vec![101, 201, 301, 401, 501, 601, 701, 801],
				},
			)
			.unwrap();
		bundle.encode(&ctx, modulus).unwrap();

		let cache = bundle.cache().unwrap();
		for felt_index in 0..4 {
			let slot = 2 * 4 + felt_index;
			for part in 0..2 {
				let coeffs: Vec<u64> =
					cache.label_coeffs[part].iter().map(|row| row[slot]).collect();
				let expected_a = 100 * (part as u64 * 4 + felt_index as u64 + 1);
				let expected_b = expected_a + 1;
				let root_a = 10 + 10 * felt_index as u64;
				let root_b = 11 + 10 * felt_index as u64;
				assert_eq!(poly_eval(&coeffs, root_a, modulus), expected_a);
				assert_eq!(poly_eval(&coeffs, root_b, modulus), expected_b);
			}
		}
	}

	#[test]
	fn labeled_bundle_rejects_slot_collisions() {
		let mut bundle = BinBundle::new(4, 8, 4, 1);
		bundle
			.insert(
				0,
				BundleEntry {
					item: vec![1, 2, 3, 4],
					label: vec![9, 9, 9, 9],
				},
			)
			.unwrap();
		// Shares felt 2 at slot index 1.
		assert!(!bundle.can_insert(0, &[7, 2, 8, 9]));
		// A different bin is fine.
		assert!(bundle.can_insert(1, &[7, 2, 8, 9]));
	}

	#[test]
	fn full_bin_rejects_insertion() {
		let mut bundle = BinBundle::new(4, 2, 2, 0);
		bundle.insert(1, entry([1, 1, 1, 1])).unwrap();
		bundle.insert(1, entry([2, 2, 2, 2])).unwrap();
		assert!(matches!(
			bundle.insert(1, entry([3, 3, 3, 3])),
			Err(Error::CapacityExceeded)
		));
	}

	#[test]
	fn strip_requires_encoding_and_blocks_mutation() {
		let (ctx, modulus) = context();
		let mut bundle = BinBundle::new(4, 4, 4, 0);
		bundle.insert(0, entry([1, 2, 3, 4])).unwrap();
		assert!(bundle.strip().is_err());
		bundle.encode(&ctx, modulus).unwrap();
		bundle.strip().unwrap();
		assert!(bundle.is_stripped());
		assert!(!bundle.can_insert(0, &[5, 6, 7, 8]));
		assert!(bundle.cache().is_ok());
	}
}
