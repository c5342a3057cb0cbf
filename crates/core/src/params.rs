// Copyright 2024 Ulvetanna Inc.

use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::BTreeSet;
use std::io::Read;

use apsi_field::Modulus;

use crate::{error::Error, powers::PowersDag};

/// How an item spreads over plaintext slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemParams {
	pub felts_per_item: u32,
}

/// Cuckoo table shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableParams {
	pub hash_func_count: u32,
	pub table_size: u32,
	pub max_items_per_bin: u32,
}

/// Query evaluation strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryParams {
	/// Paterson-Stockmeyer split point; 0 selects the plain dot product.
	pub ps_low_degree: u32,
	/// Powers of the query the receiver encrypts and sends.
	pub query_powers: BTreeSet<u32>,
}

/// BFV encryption parameters, kept as plain numbers here; the conversion to
/// a scheme context lives in [`crate::crypto`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BfvParams {
	pub poly_modulus_degree: u32,
	pub coeff_modulus_bits: Vec<u32>,
	pub plain_modulus: u64,
}

/// Immutable protocol configuration shared by both parties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsiParams {
	item: ItemParams,
	table: TableParams,
	query: QueryParams,
	bfv: BfvParams,
	plain: Modulus,
}

impl PsiParams {
	pub fn new(
		item: ItemParams,
		table: TableParams,
		query: QueryParams,
		bfv: BfvParams,
	) -> Result<Self, Error> {
		let degree = bfv.poly_modulus_degree;
		if degree < 2048 || !degree.is_power_of_two() {
			return Err(Error::Config(format!(
				"poly modulus degree {degree} must be a power of two of at least 2048"
			)));
		}
		if item.felts_per_item == 0 || degree % item.felts_per_item != 0 {
			return Err(Error::Config(format!(
				"felts_per_item {} must divide the poly modulus degree",
				item.felts_per_item
			)));
		}
		if !(1..=8).contains(&table.hash_func_count) {
			return Err(Error::Config(format!(
				"hash_func_count {} is outside [1, 8]",
				table.hash_func_count
			)));
		}
		if !table.table_size.is_power_of_two() {
			return Err(Error::Config(format!(
				"table_size {} must be a power of two",
				table.table_size
			)));
		}
		if table.table_size < item.felts_per_item {
			return Err(Error::Config(format!(
				"table_size {} is below felts_per_item {}",
				table.table_size, item.felts_per_item
			)));
		}
		if table.max_items_per_bin == 0 {
			return Err(Error::Config("max_items_per_bin must be positive".to_string()));
		}

		let plain = Modulus::new(bfv.plain_modulus)
			.map_err(|e| Error::Config(format!("plain modulus: {e}")))?;
		if bfv.plain_modulus % (2 * degree as u64) != 1 {
			return Err(Error::Config(format!(
				"plain modulus {} is not congruent to 1 modulo 2n; batching is impossible",
				bfv.plain_modulus
			)));
		}
		if bfv.coeff_modulus_bits.is_empty()
			|| bfv.coeff_modulus_bits.iter().any(|&b| !(10..=62).contains(&b))
		{
			return Err(Error::Config(
				"coefficient modulus sizes must be within [10, 62] bits".to_string(),
			));
		}

		let items_per_bundle = degree / item.felts_per_item;
		if table.table_size > items_per_bundle && table.table_size % items_per_bundle != 0 {
			return Err(Error::Config(format!(
				"table_size {} must be a multiple of the {items_per_bundle} items one bundle holds",
				table.table_size
			)));
		}

		let item_bit_count = item.felts_per_item * plain.bits_per_felt();
		if item_bit_count > 128 || item_bit_count < 32 {
			return Err(Error::Config(format!(
				"items of {item_bit_count} bits are outside the supported [32, 128] range"
			)));
		}
		if item_bit_count < 80 {
			tracing::warn!(
				item_bit_count,
				"item width below 80 bits; false-positive bound no longer holds"
			);
		}

		if query.ps_low_degree > table.max_items_per_bin {
			return Err(Error::Config(format!(
				"ps_low_degree {} exceeds max_items_per_bin {}",
				query.ps_low_degree, table.max_items_per_bin
			)));
		}
		// Also verifies coverage of [1, max_items_per_bin].
		let dag = PowersDag::new(&query.query_powers, table.max_items_per_bin)?;
		if dag.depth() > 0 && bfv.coeff_modulus_bits.len() < 2 {
			return Err(Error::Config(
				"relinearization needs at least two coefficient moduli".to_string(),
			));
		}

		Ok(Self {
			item,
			table,
			query,
			bfv,
			plain,
		})
	}

	pub fn item_params(&self) -> &ItemParams {
		&self.item
	}

	pub fn table_params(&self) -> &TableParams {
		&self.table
	}

	pub fn query_params(&self) -> &QueryParams {
		&self.query
	}

	pub fn bfv_params(&self) -> &BfvParams {
		&self.bfv
	}

	pub fn plain_modulus(&self) -> Modulus {
		self.plain
	}

	pub fn bits_per_felt(&self) -> u32 {
		self.plain.bits_per_felt()
	}

	pub fn item_bit_count(&self) -> u32 {
		self.item.felts_per_item * self.bits_per_felt()
	}

	/// Number of cuckoo table entries one batched plaintext covers.
	pub fn items_per_bundle(&self) -> u32 {
		self.bfv.poly_modulus_degree / self.item.felts_per_item
	}

	pub fn bundle_index_count(&self) -> u32 {
		let per_bundle = self.items_per_bundle();
		(self.table.table_size + per_bundle - 1) / per_bundle
	}

	/// The derivation plan for query powers; identical on both sides.
	pub fn powers_dag(&self) -> PowersDag {
		PowersDag::new(&self.query.query_powers, self.table.max_items_per_bin)
			.expect("parameters were validated at construction")
	}

	/// Field-by-field little-endian serialization.
	pub fn to_bytes(&self) -> Vec<u8> {
		let mut out = Vec::new();
		out.extend_from_slice(&self.item.felts_per_item.to_le_bytes());
		out.extend_from_slice(&self.table.hash_func_count.to_le_bytes());
		out.extend_from_slice(&self.table.max_items_per_bin.to_le_bytes());
		out.extend_from_slice(&self.table.table_size.to_le_bytes());
		out.extend_from_slice(&self.query.ps_low_degree.to_le_bytes());
		out.extend_from_slice(&(self.query.query_powers.len() as u32).to_le_bytes());
		for &power in &self.query.query_powers {
			out.extend_from_slice(&power.to_le_bytes());
		}

		let mut blob = Vec::new();
		blob.extend_from_slice(&self.bfv.poly_modulus_degree.to_le_bytes());
		blob.extend_from_slice(&(self.bfv.coeff_modulus_bits.len() as u32).to_le_bytes());
		for &bits in &self.bfv.coeff_modulus_bits {
			blob.extend_from_slice(&bits.to_le_bytes());
		}
		blob.extend_from_slice(&self.bfv.plain_modulus.to_le_bytes());
		out.extend_from_slice(&(blob.len() as u32).to_le_bytes());
		out.extend_from_slice(&blob);
		out
	}

	pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
		let mut rdr = std::io::Cursor::new(bytes);
		let params = Self::read_from(&mut rdr)?;
		if rdr.position() != bytes.len() as u64 {
			return Err(Error::Protocol("trailing bytes after parameters".to_string()));
		}
		Ok(params)
	}

	pub(crate) fn read_from<R: Read>(rdr: &mut R) -> Result<Self, Error> {
		let felts_per_item = rdr.read_u32::<LittleEndian>()?;
		let hash_func_count = rdr.read_u32::<LittleEndian>()?;
		let max_items_per_bin = rdr.read_u32::<LittleEndian>()?;
		let table_size = rdr.read_u32::<LittleEndian>()?;
		let ps_low_degree = rdr.read_u32::<LittleEndian>()?;
		let power_count = rdr.read_u32::<LittleEndian>()?;
		if power_count > 1 << 16 {
			return Err(Error::Protocol("unreasonable query power count".to_string()));
		}
		let mut query_powers = BTreeSet::new();
		for _ in 0..power_count {
			query_powers.insert(rdr.read_u32::<LittleEndian>()?);
		}

		let blob_len = rdr.read_u32::<LittleEndian>()? as usize;
		let mut blob = vec![0u8; blob_len];
		rdr.read_exact(&mut blob)?;
		let mut blob = std::io::Cursor::new(blob);
		let poly_modulus_degree = blob.read_u32::<LittleEndian>()?;
		let modulus_count = blob.read_u32::<LittleEndian>()?;
		if modulus_count > 64 {
			return Err(Error::Protocol("unreasonable modulus count".to_string()));
		}
		let mut coeff_modulus_bits = Vec::with_capacity(modulus_count as usize);
		for _ in 0..modulus_count {
			coeff_modulus_bits.push(blob.read_u32::<LittleEndian>()?);
		}
		let plain_modulus = blob.read_u64::<LittleEndian>()?;

		Self::new(
			ItemParams { felts_per_item },
			TableParams {
				hash_func_count,
				table_size,
				max_items_per_bin,
			},
			QueryParams {
				ps_low_degree,
				query_powers,
			},
			BfvParams {
				poly_modulus_degree,
				coeff_modulus_bits,
				plain_modulus,
			},
		)
	}
}
