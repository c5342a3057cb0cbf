// Copyright 2024 Ulvetanna Inc.

use curve25519_dalek::ristretto::CompressedRistretto;
use curve25519_dalek::scalar::Scalar;
use rand::{CryptoRng, RngCore};
use rand_chacha_dalek::{rand_core::SeedableRng as DalekSeedableRng, ChaCha20Rng as DalekChaCha20Rng};
use zeroize::Zeroize;

use crate::error::Error;
use crate::item::{HashedItem, Item, LabelKey};
use crate::oprf::{extract_hashes, hash_to_curve, OPRF_POINT_BYTE_COUNT};

/// Receiver half of the OPRF exchange.
///
/// Blinds every item with a fresh nonzero scalar drawn from a per-object
/// CSPRNG, and keeps the inverse factors needed to unblind the sender's
/// responses. Inverse factors are wiped on drop.
pub struct OprfReceiver {
	inv_factors: Vec<Scalar>,
	queries: Vec<u8>,
}

impl OprfReceiver {
	pub fn new<R: RngCore + CryptoRng>(items: &[Item], seed_rng: &mut R) -> Result<Self, Error> {
		let mut seed = [0u8; 32];
		seed_rng.fill_bytes(&mut seed);
		let mut rng = DalekChaCha20Rng::from_seed(seed);

		let mut inv_factors = Vec::with_capacity(items.len());
		let mut queries = Vec::with_capacity(items.len() * OPRF_POINT_BYTE_COUNT);
		for item in items {
			let point = hash_to_curve(item);
			let factor = loop {
				let candidate = Scalar::random(&mut rng);
				if candidate != Scalar::ZERO {
					break candidate;
				}
			};
			queries.extend_from_slice((point * factor).compress().as_bytes());
			inv_factors.push(factor.invert());
		}
		Ok(Self {
			inv_factors,
			queries,
		})
	}

	pub fn item_count(&self) -> usize {
		self.inv_factors.len()
	}

	/// The `n · 32`-byte blinded request to send to the sender.
	pub fn queries(&self) -> &[u8] {
		&self.queries
	}

	/// Unblinds the sender's responses and extracts the per-item hashes.
	///
	/// A malformed response point invalidates only its own slot; the
	/// remaining items come through intact.
	pub fn process_responses(
		&self,
		responses: &[u8],
	) -> Result<Vec<Option<(HashedItem, LabelKey)>>, Error> {
		if responses.len() != self.item_count() * OPRF_POINT_BYTE_COUNT {
			return Err(Error::Protocol(format!(
				"OPRF response has {} bytes, expected {}",
				responses.len(),
				self.item_count() * OPRF_POINT_BYTE_COUNT
			)));
		}

		Ok(responses
			.chunks_exact(OPRF_POINT_BYTE_COUNT)
			.zip(self.inv_factors.iter())
			.enumerate()
			.map(|(index, (chunk, inv))| {
				let point = CompressedRistretto::from_slice(chunk)
					.ok()
					.and_then(|compressed| compressed.decompress());
				match point {
					Some(point) => Some(extract_hashes(&(point * inv))),
					None => {
						tracing::warn!(index, "OPRF response point malformed; skipping item");
						None
					}
				}
			})
			.collect())
	}
}

impl Drop for OprfReceiver {
	fn drop(&mut self) {
		for factor in self.inv_factors.iter_mut() {
			factor.zeroize();
		}
	}
}
