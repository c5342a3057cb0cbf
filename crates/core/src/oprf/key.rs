// Copyright 2024 Ulvetanna Inc.

use curve25519_dalek::scalar::Scalar;
use rand::{CryptoRng, RngCore};
use rand_chacha_dalek::{rand_core::SeedableRng as DalekSeedableRng, ChaCha20Rng as DalekChaCha20Rng};
use zeroize::Zeroize;

use crate::error::Error;
use crate::oprf::OPRF_KEY_BYTE_COUNT;

/// The sender's OPRF key: a uniformly random nonzero Ristretto scalar.
///
/// Immutable after construction; the scalar is wiped on drop.
#[derive(Clone)]
pub struct OprfKey {
	scalar: Scalar,
}

impl OprfKey {
	pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
		let mut seed = [0u8; 32];
		rng.fill_bytes(&mut seed);
		let mut dalek_rng = DalekChaCha20Rng::from_seed(seed);
		loop {
			let scalar = Scalar::random(&mut dalek_rng);
			if scalar != Scalar::ZERO {
				return Self { scalar };
			}
		}
	}

	pub fn to_bytes(&self) -> [u8; OPRF_KEY_BYTE_COUNT] {
		self.scalar.to_bytes()
	}

	pub fn from_bytes(bytes: &[u8; OPRF_KEY_BYTE_COUNT]) -> Result<Self, Error> {
		let scalar = Option::<Scalar>::from(Scalar::from_canonical_bytes(*bytes))
			.ok_or_else(|| Error::Crypto("OPRF key bytes are not a canonical scalar".to_string()))?;
		if scalar == Scalar::ZERO {
			return Err(Error::Crypto("OPRF key scalar must be nonzero".to_string()));
		}
		Ok(Self { scalar })
	}

	pub(crate) fn scalar(&self) -> &Scalar {
		&self.scalar
	}
}

impl Drop for OprfKey {
	fn drop(&mut self) {
		self.scalar.zeroize();
	}
}

impl std::fmt::Debug for OprfKey {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str("OprfKey(..)")
	}
}
