// Copyright 2024 Ulvetanna Inc.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rand::{CryptoRng, RngCore};
use rayon::prelude::*;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use apsi_field::{alg_item_label, label_part_count, to_field, BitstringView, Felt};

use crate::{
	crypto::CryptoContext,
	cuckoo::all_locations,
	error::Error,
	item::{encrypt_label, Item, MAX_NONCE_BYTE_COUNT},
	oprf::{compute_hashes, process_queries, OprfKey, OPRF_KEY_BYTE_COUNT},
	params::PsiParams,
	sender::bin_bundle::{BinBundle, BundleEntry},
};

const DB_MAGIC: u32 = 0x42445041; // "APDB"
const DB_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertReport {
	/// Newly created (item, location) entries.
	pub inserted: usize,
	/// Labeled entries whose label was overwritten in place.
	pub updated: usize,
	/// Unlabeled entries that were already present.
	pub duplicates: usize,
}

/// The sender's bundle store.
///
/// A grid of [`BinBundle`]s: one row per bundle index, rows growing as bins
/// fill up. Inserts lock one row at a time and fan out over rows on the
/// database's own thread pool; the query path takes shared row locks. A
/// stripped database retains only encoded bundle data and can serve queries
/// but not inserts.
pub struct SenderDb {
	params: PsiParams,
	crypto: CryptoContext,
	pool: Arc<rayon::ThreadPool>,
	oprf_key: Option<OprfKey>,
	label_byte_count: usize,
	nonce_byte_count: usize,
	label_parts: usize,
	rows: Vec<RwLock<Vec<BinBundle>>>,
	writers: AtomicUsize,
	stripped: bool,
}

impl SenderDb {
	pub fn new<R: RngCore + CryptoRng>(
		params: PsiParams,
		label_byte_count: usize,
		nonce_byte_count: usize,
		thread_count: Option<usize>,
		rng: &mut R,
	) -> Result<Self, Error> {
		let oprf_key = OprfKey::random(rng);
		Self::with_key(params, label_byte_count, nonce_byte_count, thread_count, Some(oprf_key))
	}

	fn with_key(
		params: PsiParams,
		label_byte_count: usize,
		nonce_byte_count: usize,
		thread_count: Option<usize>,
		oprf_key: Option<OprfKey>,
	) -> Result<Self, Error> {
		if nonce_byte_count > MAX_NONCE_BYTE_COUNT {
			return Err(Error::Config(format!(
				"nonce_byte_count {nonce_byte_count} exceeds {MAX_NONCE_BYTE_COUNT}"
			)));
		}
		let label_parts = if label_byte_count > 0 {
			label_part_count(nonce_byte_count + label_byte_count, params.item_bit_count())
		} else {
			0
		};
		let pool = Arc::new(
			rayon::ThreadPoolBuilder::new()
				.num_threads(thread_count.unwrap_or(0))
				.build()
				.map_err(|e| Error::Config(format!("thread pool: {e}")))?,
		);
		let rows = (0..params.bundle_index_count())
			.map(|_| RwLock::new(Vec::new()))
			.collect();
		let crypto = CryptoContext::new(&params)?;
		Ok(Self {
			params,
			crypto,
			pool,
			oprf_key,
			label_byte_count,
			nonce_byte_count,
			label_parts,
			rows,
			writers: AtomicUsize::new(0),
			stripped: false,
		})
	}

	pub fn params(&self) -> &PsiParams {
		&self.params
	}

	pub fn crypto(&self) -> &CryptoContext {
		&self.crypto
	}

	pub fn pool(&self) -> &Arc<rayon::ThreadPool> {
		&self.pool
	}

	pub fn is_labeled(&self) -> bool {
		self.label_byte_count > 0
	}

	pub fn is_stripped(&self) -> bool {
		self.stripped
	}

	pub fn label_byte_count(&self) -> usize {
		self.label_byte_count
	}

	pub fn nonce_byte_count(&self) -> usize {
		self.nonce_byte_count
	}

	pub fn is_writing(&self) -> bool {
		self.writers.load(Ordering::Acquire) > 0
	}

	pub(crate) fn rows(&self) -> &[RwLock<Vec<BinBundle>>] {
		&self.rows
	}

	/// Total number of bundles, which is also the number of result packages
	/// a query produces.
	pub fn bundle_count(&self) -> usize {
		self.rows
			.iter()
			.map(|row| row.read().unwrap_or_else(PoisonError::into_inner).len())
			.sum()
	}

	pub fn item_entry_count(&self) -> usize {
		self.rows
			.iter()
			.map(|row| {
				row.read()
					.unwrap_or_else(PoisonError::into_inner)
					.iter()
					.map(BinBundle::item_count)
					.sum::<usize>()
			})
			.sum()
	}

	/// Number of table entries a bundle at this index covers; the last
	/// bundle row of a small table may cover less than a full plaintext.
	fn bin_count_at(&self, bundle_index: usize) -> usize {
		let per_bundle = self.params.items_per_bundle() as usize;
		let table_size = self.params.table_params().table_size as usize;
		per_bundle.min(table_size - bundle_index * per_bundle)
	}

	/// Evaluates the OPRF on a receiver's blinded query batch.
	pub fn process_oprf(&self, queries: &[u8]) -> Result<Vec<u8>, Error> {
		let key = self
			.oprf_key
			.as_ref()
			.ok_or(Error::State("OPRF key was discarded by strip"))?;
		self.pool.install(|| process_queries(queries, key))
	}

	/// Inserts items (with labels when the database is labeled), updating
	/// labels of already-present items in place.
	///
	/// Every item is stored under all of its cuckoo locations, since the
	/// receiver's table may have chosen any one of them.
	pub fn insert_or_assign<R: RngCore + CryptoRng>(
		&self,
		entries: &[(Item, Option<Vec<u8>>)],
		rng: &mut R,
	) -> Result<InsertReport, Error> {
		if self.stripped {
			return Err(Error::State("cannot insert into a stripped database"));
		}
		let key = self
			.oprf_key
			.as_ref()
			.ok_or(Error::State("OPRF key was discarded by strip"))?;

		for (_, label) in entries {
			match (self.is_labeled(), label) {
				(true, Some(label)) if label.len() == self.label_byte_count => {}
				(true, got) => {
					return Err(Error::LabelMismatch {
						expected: self.label_byte_count,
						got: got.as_ref().map_or(0, |l| l.len()),
					})
				}
				(false, None) => {}
				(false, Some(_)) => {
					return Err(Error::State("unlabeled database cannot store labels"))
				}
			}
		}

		let _guard = WritingGuard::enter(&self.writers);

		let items: Vec<Item> = entries.iter().map(|(item, _)| *item).collect();
		let hashes = self.pool.install(|| compute_hashes(&items, key));

		let modulus = self.params.plain_modulus();
		let item_bit_count = self.params.item_bit_count();
		let item_byte_count = (item_bit_count as usize + 7) / 8;
		let felts_per_item = self.params.item_params().felts_per_item as usize;
		let table_size = self.params.table_params().table_size;
		let hash_func_count = self.params.table_params().hash_func_count;
		let per_bundle = self.params.items_per_bundle() as usize;

		struct Pending {
			bin: usize,
			item_felts: Vec<Felt>,
			label_felts: Vec<Felt>,
		}
		let mut per_row: Vec<Vec<Pending>> = (0..self.rows.len()).map(|_| Vec::new()).collect();

		for ((_, label), (hashed, label_key)) in entries.iter().zip(hashes.iter()) {
			let hashed_bytes = hashed.0.to_le_bytes();
			let view = BitstringView::new(&hashed_bytes[..item_byte_count], item_bit_count)?;
			let item_felts = to_field(view, modulus, felts_per_item)?;

			let label_felts = if let Some(label) = label {
				let encrypted = encrypt_label(
					label,
					label_key,
					self.nonce_byte_count,
					rng,
				);
				let pairs = alg_item_label(&item_felts, &encrypted, item_bit_count, modulus)?;
				// Flatten part-major so part `p` of the label occupies felts
				// `[p * felts_per_item, (p + 1) * felts_per_item)`.
				let mut flat = vec![0 as Felt; self.label_parts * felts_per_item];
				for (felt_index, (_, parts)) in pairs.iter().enumerate() {
					for (part, &value) in parts.iter().enumerate() {
						flat[part * felts_per_item + felt_index] = value;
					}
				}
				flat
			} else {
				Vec::new()
			};

			for loc in all_locations(hashed, table_size, hash_func_count) {
				per_row[loc as usize / per_bundle].push(Pending {
					bin: loc as usize % per_bundle,
					item_felts: item_felts.clone(),
					label_felts: label_felts.clone(),
				});
			}
		}

		let labeled = self.is_labeled();
		let report = self.pool.install(|| {
			per_row
				.par_iter()
				.enumerate()
				.map(|(row_index, pending)| -> Result<InsertReport, Error> {
					let mut report = InsertReport::default();
					if pending.is_empty() {
						return Ok(report);
					}
					let mut row = self.rows[row_index]
						.write()
						.unwrap_or_else(PoisonError::into_inner);
					for p in pending {
						let existing = row.iter().enumerate().find_map(|(bi, bundle)| {
							bundle.find_entry(p.bin, &p.item_felts).map(|ei| (bi, ei))
						});
						if let Some((bundle_index, entry_index)) = existing {
							if labeled {
								row[bundle_index].update_label(
									p.bin,
									entry_index,
									p.label_felts.clone(),
								);
								report.updated += 1;
							} else {
								report.duplicates += 1;
							}
							continue;
						}

						let entry = BundleEntry {
							item: p.item_felts.clone(),
							label: p.label_felts.clone(),
						};
						match row.iter_mut().find(|b| b.can_insert(p.bin, &p.item_felts)) {
							Some(bundle) => bundle.insert(p.bin, entry)?,
							None => {
								let mut bundle = BinBundle::new(
									felts_per_item,
									self.bin_count_at(row_index),
									self.params.table_params().max_items_per_bin as usize,
									self.label_parts,
								);
								bundle.insert(p.bin, entry)?;
								row.push(bundle);
							}
						}
						report.inserted += 1;
					}
					for bundle in row.iter_mut() {
						bundle.encode(&self.crypto, modulus)?;
					}
					Ok(report)
				})
				.try_reduce(InsertReport::default, |a, b| {
					Ok(InsertReport {
						inserted: a.inserted + b.inserted,
						updated: a.updated + b.updated,
						duplicates: a.duplicates + b.duplicates,
					})
				})
		})?;

		tracing::info!(
			inserted = report.inserted,
			updated = report.updated,
			duplicates = report.duplicates,
			bundles = self.bundle_count(),
			"insert_or_assign finished"
		);
		Ok(report)
	}

	/// Discards raw items and the OPRF key, leaving only encoded bundles.
	pub fn strip(&mut self) -> Result<(), Error> {
		for row in self.rows.iter() {
			let mut row = row.write().unwrap_or_else(PoisonError::into_inner);
			for bundle in row.iter_mut() {
				bundle.strip()?;
			}
		}
		self.oprf_key = None;
		self.stripped = true;
		tracing::info!("sender database stripped");
		Ok(())
	}

	pub fn save<W: Write>(&self, writer: &mut W) -> Result<(), Error> {
		writer.write_u32::<LittleEndian>(DB_MAGIC)?;
		writer.write_u32::<LittleEndian>(DB_VERSION)?;
		let params = self.params.to_bytes();
		writer.write_u32::<LittleEndian>(params.len() as u32)?;
		writer.write_all(&params)?;
		writer.write_u32::<LittleEndian>(self.label_byte_count as u32)?;
		writer.write_u32::<LittleEndian>(self.nonce_byte_count as u32)?;
		writer.write_u8(self.stripped as u8)?;
		if let Some(key) = &self.oprf_key {
			writer.write_all(&key.to_bytes())?;
		}

		writer.write_u32::<LittleEndian>(self.rows.len() as u32)?;
		for row in self.rows.iter() {
			let row = row.read().unwrap_or_else(PoisonError::into_inner);
			writer.write_u32::<LittleEndian>(row.len() as u32)?;
			for bundle in row.iter() {
				let cache = bundle.cache()?;
				writer.write_u32::<LittleEndian>(bundle.bin_count() as u32)?;
				writer.write_u32::<LittleEndian>(cache.max_degree as u32)?;

				if !self.stripped {
					for bin in bundle.bins() {
						writer.write_u32::<LittleEndian>(bin.len() as u32)?;
						for entry in bin {
							for &felt in &entry.item {
								writer.write_u64::<LittleEndian>(felt)?;
							}
							for &felt in &entry.label {
								writer.write_u64::<LittleEndian>(felt)?;
							}
						}
					}
				}

				for row_coeffs in &cache.matching_coeffs {
					for &coeff in row_coeffs {
						writer.write_u64::<LittleEndian>(coeff)?;
					}
				}
				writer.write_u32::<LittleEndian>(self.label_parts as u32)?;
				for part in &cache.label_coeffs {
					for row_coeffs in part {
						for &coeff in row_coeffs {
							writer.write_u64::<LittleEndian>(coeff)?;
						}
					}
				}
			}
		}
		Ok(())
	}

	pub fn load<R: Read>(reader: &mut R, thread_count: Option<usize>) -> Result<Self, Error> {
		if reader.read_u32::<LittleEndian>()? != DB_MAGIC {
			return Err(Error::Protocol("not a sender database file".to_string()));
		}
		if reader.read_u32::<LittleEndian>()? != DB_VERSION {
			return Err(Error::Protocol("unsupported database version".to_string()));
		}
		let params_len = reader.read_u32::<LittleEndian>()? as usize;
		let mut params_bytes = vec![0u8; params_len];
		reader.read_exact(&mut params_bytes)?;
		let params = PsiParams::from_bytes(&params_bytes)?;
		let label_byte_count = reader.read_u32::<LittleEndian>()? as usize;
		let nonce_byte_count = reader.read_u32::<LittleEndian>()? as usize;
		let stripped = reader.read_u8()? != 0;
		let oprf_key = if stripped {
			None
		} else {
			let mut key_bytes = [0u8; OPRF_KEY_BYTE_COUNT];
			reader.read_exact(&mut key_bytes)?;
			Some(OprfKey::from_bytes(&key_bytes)?)
		};

		let mut db = Self::with_key(
			params,
			label_byte_count,
			nonce_byte_count,
			thread_count,
			oprf_key,
		)?;
		db.stripped = stripped;

		let felts_per_item = db.params.item_params().felts_per_item as usize;
		let max_items_per_bin = db.params.table_params().max_items_per_bin as usize;

		let row_count = reader.read_u32::<LittleEndian>()? as usize;
		if row_count != db.rows.len() {
			return Err(Error::Protocol("bundle row count mismatch".to_string()));
		}
		for row_index in 0..row_count {
			let bundle_count = reader.read_u32::<LittleEndian>()? as usize;
			let mut bundles = Vec::with_capacity(bundle_count);
			for _ in 0..bundle_count {
				let bin_count = reader.read_u32::<LittleEndian>()? as usize;
				if bin_count != db.bin_count_at(row_index) {
					return Err(Error::Protocol("bundle bin count mismatch".to_string()));
				}
				let max_degree = reader.read_u32::<LittleEndian>()? as usize;
				if max_degree > max_items_per_bin {
					return Err(Error::Protocol("bundle degree exceeds bin capacity".to_string()));
				}
				let slot_count = bin_count * felts_per_item;

				let bins = if stripped {
					None
				} else {
					let mut bins = Vec::with_capacity(bin_count);
					let label_felts = db.label_parts * felts_per_item;
					for _ in 0..bin_count {
						let load = reader.read_u32::<LittleEndian>()? as usize;
						if load > max_items_per_bin {
							return Err(Error::Protocol("bin load exceeds capacity".to_string()));
						}
						let mut bin = Vec::with_capacity(load);
						for _ in 0..load {
							let mut item = vec![0u64; felts_per_item];
							for felt in item.iter_mut() {
								*felt = reader.read_u64::<LittleEndian>()?;
							}
							let mut label = vec![0u64; label_felts];
							for felt in label.iter_mut() {
								*felt = reader.read_u64::<LittleEndian>()?;
							}
							bin.push(BundleEntry { item, label });
						}
						bins.push(bin);
					}
					Some(bins)
				};

				let mut matching_coeffs = vec![vec![0u64; slot_count]; max_degree + 1];
				for row_coeffs in matching_coeffs.iter_mut() {
					for coeff in row_coeffs.iter_mut() {
						*coeff = reader.read_u64::<LittleEndian>()?;
					}
				}
				let label_parts = reader.read_u32::<LittleEndian>()? as usize;
				if label_parts != db.label_parts {
					return Err(Error::Protocol("label part count mismatch".to_string()));
				}
				let mut label_coeffs =
					vec![vec![vec![0u64; slot_count]; max_degree]; label_parts];
				for part in label_coeffs.iter_mut() {
					for row_coeffs in part.iter_mut() {
						for coeff in row_coeffs.iter_mut() {
							*coeff = reader.read_u64::<LittleEndian>()?;
						}
					}
				}

				bundles.push(BinBundle::from_parts(
					felts_per_item,
					bin_count,
					max_items_per_bin,
					label_parts,
					bins,
					&db.crypto,
					max_degree,
					matching_coeffs,
					label_coeffs,
				)?);
			}
			db.rows[row_index] = RwLock::new(bundles);
		}
		Ok(db)
	}
}

/// Marks the database as writing for the duration of a mutation, so the
/// query path can fail fast instead of evaluating against a moving store.
/// Concurrent inserts are fine; the row locks serialize them.
struct WritingGuard<'a> {
	writers: &'a AtomicUsize,
}

impl<'a> WritingGuard<'a> {
	fn enter(writers: &'a AtomicUsize) -> Self {
		writers.fetch_add(1, Ordering::AcqRel);
		Self { writers }
	}
}

impl Drop for WritingGuard<'_> {
	fn drop(&mut self) {
		self.writers.fetch_sub(1, Ordering::AcqRel);
	}
}
