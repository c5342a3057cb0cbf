// Copyright 2024 Ulvetanna Inc.

use crate::{
	bitstring::{bit_copy, Bitstring, BitstringView},
	error::Error,
	felt::{Felt, Modulus},
};

/// An item paired with its label, algebraized slot by slot: entry `i` holds
/// the item's `i`-th field element together with the label field elements
/// that share its plaintext slot, one per label part.
pub type AlgItemLabel = Vec<(Felt, Vec<Felt>)>;

/// Packs a bitstring into `felt_count` field elements.
///
/// Bits are consumed LSB-first, least significant felt first; each felt
/// carries `floor(log2(p))` bits so no value wraps modulo `p`. Leftover high
/// bits of the top felt are zero.
pub fn to_field(bits: BitstringView<'_>, modulus: Modulus, felt_count: usize) -> Result<Vec<Felt>, Error> {
	let bits_per_felt = modulus.bits_per_felt();
	let bit_count = bits.bit_count();
	if bit_count as usize > felt_count * bits_per_felt as usize {
		return Err(Error::TooManyBits {
			bit_count,
			felt_count,
			bits_per_felt,
		});
	}

	let mut felts = vec![0 as Felt; felt_count];
	for (i, felt) in felts.iter_mut().enumerate() {
		let offset = i * bits_per_felt as usize;
		if offset >= bit_count as usize {
			break;
		}
		let take = (bits_per_felt as usize).min(bit_count as usize - offset);
		let mut word = [0u8; 8];
		bit_copy(bits.data(), offset, &mut word, 0, take);
		*felt = u64::from_le_bytes(word);
	}
	Ok(felts)
}

/// Exact inverse of [`to_field`] for inputs that came from it.
pub fn from_field(felts: &[Felt], bit_count: u32, modulus: Modulus) -> Result<Bitstring, Error> {
	let bits_per_felt = modulus.bits_per_felt();
	if bit_count as usize > felts.len() * bits_per_felt as usize {
		return Err(Error::TooManyBits {
			bit_count,
			felt_count: felts.len(),
			bits_per_felt,
		});
	}

	let mut out = Bitstring::zero(bit_count)?;
	for (i, &felt) in felts.iter().enumerate() {
		if !modulus.contains(felt) {
			return Err(Error::FeltOutOfRange(felt));
		}
		let offset = i * bits_per_felt as usize;
		if offset >= bit_count as usize {
			break;
		}
		let take = (bits_per_felt as usize).min(bit_count as usize - offset);
		let word = felt.to_le_bytes();
		bit_copy(&word, 0, out.data_mut(), offset, take);
	}
	Ok(out)
}

/// Number of plaintext "parts" a label of `byte_count` bytes occupies when
/// every part carries `item_bit_count` bits alongside one copy of the item.
pub fn label_part_count(byte_count: usize, item_bit_count: u32) -> usize {
	(byte_count * 8 + item_bit_count as usize - 1) / item_bit_count as usize
}

/// Algebraizes an item together with its (already encrypted) label.
///
/// The label bits are split into [`label_part_count`] chunks of
/// `item_bit_count` bits, the last chunk zero-extended, and every chunk is
/// packed into as many felts as the item itself so each label felt shares a
/// plaintext slot with an item felt.
pub fn alg_item_label(
	item_felts: &[Felt],
	encrypted_label: &[u8],
	item_bit_count: u32,
	modulus: Modulus,
) -> Result<AlgItemLabel, Error> {
	let parts = label_part_count(encrypted_label.len(), item_bit_count);
	let mut chunks = Vec::with_capacity(parts);
	for c in 0..parts {
		let offset = c * item_bit_count as usize;
		let take = (item_bit_count as usize).min(encrypted_label.len() * 8 - offset);
		let mut chunk = Bitstring::zero(item_bit_count)?;
		bit_copy(encrypted_label, offset, chunk.data_mut(), 0, take);
		chunks.push(to_field(chunk.as_view(), modulus, item_felts.len())?);
	}

	Ok(item_felts
		.iter()
		.enumerate()
		.map(|(i, &felt)| (felt, chunks.iter().map(|chunk| chunk[i]).collect()))
		.collect())
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;

	fn modulus() -> Modulus {
		Modulus::new(40961).unwrap()
	}

	#[test]
	fn packs_lsb_first() {
		let m = modulus();
		// 20 bits: 0xBCDEF, LSB-first over 15-bit felts.
		let bits = BitstringView::new(&[0xef, 0xcd, 0x0b], 20).unwrap();
		let felts = to_field(bits, m, 2).unwrap();
		assert_eq!(felts[0], 0xbcdef & 0x7fff);
		assert_eq!(felts[1], 0xbcdef >> 15);
	}

	#[test]
	fn rejects_overlong_input() {
		let m = modulus();
		let data = vec![0u8; 8];
		let bits = BitstringView::new(&data, 61).unwrap();
		assert!(to_field(bits, m, 4).is_err());
	}

	#[test]
	fn from_field_rejects_out_of_range_felts() {
		let m = modulus();
		assert!(from_field(&[40961, 0], 20, m).is_err());
	}

	#[test]
	fn label_parts_round_up() {
		assert_eq!(label_part_count(8, 60), 2);
		assert_eq!(label_part_count(20, 60), 3);
		assert_eq!(label_part_count(1, 60), 1);
		assert_eq!(label_part_count(16, 128), 1);
	}

	#[test]
	fn item_label_pairs_share_slots() {
		let m = modulus();
		let item = [5u64, 6, 7, 8];
		let label = [0xaau8; 20];
		let pairs = alg_item_label(&item, &label, 60, m).unwrap();
		assert_eq!(pairs.len(), 4);
		for (i, (felt, parts)) in pairs.iter().enumerate() {
			assert_eq!(*felt, item[i]);
			assert_eq!(parts.len(), 3);
		}
		// Reassembling the label parts recovers the ciphertext bytes.
		let mut reassembled = vec![0u8; 23];
		for c in 0..3 {
			let felts: Vec<_> = pairs.iter().map(|(_, parts)| parts[c]).collect();
			let bits = from_field(&felts, 60, m).unwrap();
			bit_copy(bits.data(), 0, &mut reassembled, c * 60, 60.min(label.len() * 8 - c * 60));
		}
		assert_eq!(&reassembled[..20], &label[..]);
	}

	proptest! {
		#[test]
		fn roundtrip_bitstring_felt(data in proptest::collection::vec(any::<u8>(), 1..16), last_bits in 1u32..=8) {
			let m = modulus();
			let bit_count = (data.len() as u32 - 1) * 8 + last_bits;
			let bs = Bitstring::new(data, bit_count).unwrap();
			let felt_count = (bit_count as usize + 14) / 15;
			let felts = to_field(bs.as_view(), m, felt_count).unwrap();
			for &f in &felts {
				prop_assert!(f < 1 << 15);
			}
			let back = from_field(&felts, bit_count, m).unwrap();
			prop_assert_eq!(back, bs);
		}
	}
}
