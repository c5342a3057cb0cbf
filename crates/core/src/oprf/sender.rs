// Copyright 2024 Ulvetanna Inc.

use curve25519_dalek::ristretto::CompressedRistretto;
use rayon::prelude::*;

use crate::error::Error;
use crate::item::{HashedItem, Item, LabelKey};
use crate::oprf::{extract_hashes, hash_to_curve, OprfKey, OPRF_POINT_BYTE_COUNT};

/// Evaluates the OPRF on a batch of blinded query points.
///
/// `queries` is `n · 32` bytes of compressed points; the response has the
/// same shape. Evaluation per point is independent and runs on the current
/// rayon pool. Any malformed point fails the whole batch, since a sender
/// cannot tell which receiver item it belonged to.
pub fn process_queries(queries: &[u8], key: &OprfKey) -> Result<Vec<u8>, Error> {
	if queries.len() % OPRF_POINT_BYTE_COUNT != 0 {
		return Err(Error::Protocol(format!(
			"OPRF query buffer of {} bytes is not a multiple of the point size",
			queries.len()
		)));
	}

	let evaluated: Vec<[u8; OPRF_POINT_BYTE_COUNT]> = queries
		.par_chunks_exact(OPRF_POINT_BYTE_COUNT)
		.map(|chunk| {
			let point = CompressedRistretto::from_slice(chunk)
				.ok()
				.and_then(|compressed| compressed.decompress())
				.ok_or_else(|| {
					Error::Crypto("OPRF query is not a valid curve point".to_string())
				})?;
			Ok((point * key.scalar()).compress().to_bytes())
		})
		.collect::<Result<_, Error>>()?;

	tracing::debug!(
		point_count = evaluated.len(),
		"evaluated OPRF query batch"
	);
	Ok(evaluated.concat())
}

/// Direct (non-oblivious) PRF evaluation on the sender's own items.
///
/// Byte-identical to what a receiver obtains for the same item through the
/// blinded exchange.
pub fn compute_hashes(items: &[Item], key: &OprfKey) -> Vec<(HashedItem, LabelKey)> {
	items
		.par_iter()
		.map(|item| extract_hashes(&(hash_to_curve(item) * key.scalar())))
		.collect()
}
