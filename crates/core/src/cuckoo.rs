// Copyright 2024 Ulvetanna Inc.

//! Cuckoo hashing of OPRF-hashed items.
//!
//! The receiver packs its query into a table where every item sits at one of
//! `hash_func_count` deterministic locations; the sender, which cannot know
//! which location the receiver's insertion ended up choosing, covers all of
//! them. Location functions are a pure function of the table size and the
//! function index, so the two sides always agree.

use blake2::{Blake2b512, Digest};
use rand::{CryptoRng, Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::error::Error;
use crate::item::HashedItem;

/// Location of `item` under hash function `func_index`.
///
/// The PRF input is the low 64 bits of the hashed item; the table size must
/// be a power of two.
pub fn location(item: &HashedItem, table_size: u32, func_index: u32) -> u32 {
	debug_assert!(table_size.is_power_of_two());
	let digest = Blake2b512::new()
		.chain_update(b"APSI cuckoo")
		.chain_update(func_index.to_le_bytes())
		.chain_update(item.0.low_word().to_le_bytes())
		.finalize();
	let mut word = [0u8; 8];
	word.copy_from_slice(&digest[..8]);
	(u64::from_le_bytes(word) & (table_size as u64 - 1)) as u32
}

/// All distinct locations of `item`, in hash-function order.
pub fn all_locations(item: &HashedItem, table_size: u32, hash_func_count: u32) -> Vec<u32> {
	let mut locations = Vec::with_capacity(hash_func_count as usize);
	for func_index in 0..hash_func_count {
		let loc = location(item, table_size, func_index);
		if !locations.contains(&loc) {
			locations.push(loc);
		}
	}
	locations
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CuckooCell {
	pub item: HashedItem,
	pub func_index: u32,
}

/// A cuckoo table with random-walk eviction.
pub struct CuckooTable {
	table_size: u32,
	hash_func_count: u32,
	max_probe: u32,
	cells: Vec<Option<CuckooCell>>,
	rng: ChaCha20Rng,
}

impl CuckooTable {
	pub fn new<R: RngCore + CryptoRng>(
		table_size: u32,
		hash_func_count: u32,
		seed_rng: &mut R,
	) -> Result<Self, Error> {
		let rng = ChaCha20Rng::from_rng(seed_rng);
		Ok(Self {
			table_size,
			hash_func_count,
			max_probe: 100 + 4 * table_size,
			cells: vec![None; table_size as usize],
			rng,
		})
	}

	pub fn table_size(&self) -> u32 {
		self.table_size
	}

	pub fn cells(&self) -> &[Option<CuckooCell>] {
		&self.cells
	}

	/// Places an item, displacing earlier ones if needed. Inserting an item
	/// that is already in the table is a no-op. Exhausting the probe budget
	/// is a hard failure: the parameter set cannot hold this query.
	pub fn insert(&mut self, item: HashedItem) -> Result<(), Error> {
		let mut current = item;
		for _ in 0..self.max_probe {
			let mut candidates = Vec::with_capacity(self.hash_func_count as usize);
			for func_index in 0..self.hash_func_count {
				let loc = location(&current, self.table_size, func_index);
				match &self.cells[loc as usize] {
					Some(cell) if cell.item == current => return Ok(()),
					Some(_) => candidates.push((func_index, loc, true)),
					None => candidates.push((func_index, loc, false)),
				}
			}

			if let Some(&(func_index, loc, _)) =
				candidates.iter().find(|(_, _, occupied)| !occupied)
			{
				self.cells[loc as usize] = Some(CuckooCell {
					item: current,
					func_index,
				});
				return Ok(());
			}

			// All candidates occupied: evict from a random one.
			let (func_index, loc, _) = candidates[self.rng.gen_range(0..candidates.len())];
			let evicted = self.cells[loc as usize]
				.replace(CuckooCell {
					item: current,
					func_index,
				})
				.expect("candidate was occupied");
			current = evicted.item;
		}
		Err(Error::InsufficientCapacity)
	}

	pub fn fill(&mut self, items: impl IntoIterator<Item = HashedItem>) -> Result<(), Error> {
		for item in items {
			self.insert(item)?;
		}
		Ok(())
	}
}
