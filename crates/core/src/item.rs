// Copyright 2024 Ulvetanna Inc.

use blake2::{Blake2b512, Digest};
use rand::{CryptoRng, RngCore};
use std::fmt;

use crate::error::Error;

pub const ITEM_BYTE_COUNT: usize = 16;
pub const LABEL_KEY_BYTE_COUNT: usize = 32;
pub const MAX_NONCE_BYTE_COUNT: usize = 16;

/// An opaque 128-bit item, stored as two little-endian words.
///
/// Raw byte strings enter the protocol through [`Item::from_bytes`], which
/// hashes them down to this width; equality is value equality on the two
/// words.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Item {
	words: [u64; 2],
}

impl Item {
	/// Hashes an arbitrary byte string into an item.
	pub fn from_bytes(data: &[u8]) -> Self {
		let digest = Blake2b512::digest(data);
		let mut bytes = [0u8; ITEM_BYTE_COUNT];
		bytes.copy_from_slice(&digest[..ITEM_BYTE_COUNT]);
		Self::from_le_bytes(bytes)
	}

	pub fn from_words(low: u64, high: u64) -> Self {
		Self { words: [low, high] }
	}

	pub fn from_le_bytes(bytes: [u8; ITEM_BYTE_COUNT]) -> Self {
		let mut low = [0u8; 8];
		let mut high = [0u8; 8];
		low.copy_from_slice(&bytes[..8]);
		high.copy_from_slice(&bytes[8..]);
		Self {
			words: [u64::from_le_bytes(low), u64::from_le_bytes(high)],
		}
	}

	pub fn to_le_bytes(&self) -> [u8; ITEM_BYTE_COUNT] {
		let mut out = [0u8; ITEM_BYTE_COUNT];
		out[..8].copy_from_slice(&self.words[0].to_le_bytes());
		out[8..].copy_from_slice(&self.words[1].to_le_bytes());
		out
	}

	pub fn words(&self) -> [u64; 2] {
		self.words
	}

	/// The low 64 bits, which seed the cuckoo location functions.
	pub fn low_word(&self) -> u64 {
		self.words[0]
	}
}

impl fmt::Debug for Item {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Item({:016x}{:016x})", self.words[1], self.words[0])
	}
}

/// An item that went through the OPRF. Kept distinct from [`Item`] so
/// plaintext and blinded values cannot be mixed up.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct HashedItem(pub Item);

/// Symmetric key for label encryption, derived per item from the OPRF
/// evaluation.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct LabelKey([u8; LABEL_KEY_BYTE_COUNT]);

impl LabelKey {
	pub fn new(bytes: [u8; LABEL_KEY_BYTE_COUNT]) -> Self {
		Self(bytes)
	}

	pub fn as_bytes(&self) -> &[u8; LABEL_KEY_BYTE_COUNT] {
		&self.0
	}
}

impl fmt::Debug for LabelKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("LabelKey(..)")
	}
}

/// Encrypts a label under `key`, producing `nonce_byte_count` nonce bytes
/// followed by the XOR of the label with a Blake2b-derived keystream.
pub fn encrypt_label<R: RngCore + CryptoRng>(
	label: &[u8],
	key: &LabelKey,
	nonce_byte_count: usize,
	rng: &mut R,
) -> Vec<u8> {
	debug_assert!(nonce_byte_count <= MAX_NONCE_BYTE_COUNT);
	let mut out = vec![0u8; nonce_byte_count + label.len()];
	rng.fill_bytes(&mut out[..nonce_byte_count]);
	let (nonce, body) = out.split_at_mut(nonce_byte_count);
	body.copy_from_slice(label);
	apply_keystream(key, nonce, body);
	out
}

/// Inverse of [`encrypt_label`]; `data` must be exactly nonce plus
/// ciphertext.
pub fn decrypt_label(data: &[u8], key: &LabelKey, nonce_byte_count: usize) -> Result<Vec<u8>, Error> {
	if data.len() < nonce_byte_count {
		return Err(Error::Protocol(
			"encrypted label shorter than its nonce".to_string(),
		));
	}
	let (nonce, body) = data.split_at(nonce_byte_count);
	let mut label = body.to_vec();
	apply_keystream(key, nonce, &mut label);
	Ok(label)
}

fn apply_keystream(key: &LabelKey, nonce: &[u8], data: &mut [u8]) {
	for (block_index, chunk) in data.chunks_mut(64).enumerate() {
		let block = Blake2b512::new()
			.chain_update(key.as_bytes())
			.chain_update(nonce)
			.chain_update((block_index as u64).to_le_bytes())
			.finalize();
		for (b, k) in chunk.iter_mut().zip(block.iter()) {
			*b ^= k;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rand::{rngs::StdRng, SeedableRng};

	#[test]
	fn item_hashing_is_deterministic() {
		let a = Item::from_bytes(b"alice");
		let b = Item::from_bytes(b"alice");
		let c = Item::from_bytes(b"bob");
		assert_eq!(a, b);
		assert_ne!(a, c);
	}

	#[test]
	fn item_byte_roundtrip() {
		let item = Item::from_words(0x0123456789abcdef, 0xfedcba9876543210);
		assert_eq!(Item::from_le_bytes(item.to_le_bytes()), item);
	}

	#[test]
	fn label_roundtrip() {
		let mut rng = StdRng::seed_from_u64(7);
		let key = LabelKey::new([42u8; 32]);
		for nonce_len in [0usize, 1, 12, 16] {
			let ct = encrypt_label(b"PREMIUM_", &key, nonce_len, &mut rng);
			assert_eq!(ct.len(), nonce_len + 8);
			let pt = decrypt_label(&ct, &key, nonce_len).unwrap();
			assert_eq!(pt, b"PREMIUM_");
		}
	}

	#[test]
	fn label_ciphertext_depends_on_key_and_nonce() {
		let mut rng = StdRng::seed_from_u64(7);
		let ct1 = encrypt_label(b"secret!!", &LabelKey::new([1; 32]), 12, &mut rng);
		let ct2 = encrypt_label(b"secret!!", &LabelKey::new([2; 32]), 12, &mut rng);
		assert_ne!(ct1[12..], ct2[12..]);
		// Wrong key decrypts to garbage, not an error.
		let wrong = decrypt_label(&ct1, &LabelKey::new([3; 32]), 12).unwrap();
		assert_ne!(wrong, b"secret!!");
	}

	#[test]
	fn long_labels_span_keystream_blocks() {
		let mut rng = StdRng::seed_from_u64(9);
		let key = LabelKey::new([5u8; 32]);
		let label = vec![0xabu8; 200];
		let ct = encrypt_label(&label, &key, 16, &mut rng);
		assert_eq!(decrypt_label(&ct, &key, 16).unwrap(), label);
	}
}
