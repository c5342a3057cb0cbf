// Copyright 2024 Ulvetanna Inc.

//! Receiver side: query construction and result decoding.
//!
//! The receiver cuckoo-hashes its OPRF-hashed items into a table, spreads
//! the table over one plaintext per bundle index, encrypts the configured
//! source powers of that plaintext slot-wise (plus an encryption of one for
//! the constant coefficient row), and later decrypts the returned packages,
//! looking for item slots that decrypt to all zeros.

use rand::{CryptoRng, RngCore};
use std::collections::{BTreeMap, HashMap};

use apsi_field::{bit_copy, from_field, label_part_count, to_field, BitstringView};

use crate::{
	crypto::ReceiverCrypto,
	cuckoo::CuckooTable,
	error::Error,
	item::{decrypt_label, HashedItem, Item, LabelKey},
	network::{Channel, OperationKind, ResponseKind, ResultPackage, SenderOperation},
	oprf::OprfReceiver,
	params::PsiParams,
	sender::QueryRequest,
};

/// Per-item query outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchRecord {
	pub found: bool,
	pub label: Option<Vec<u8>>,
}

/// Bookkeeping the receiver must retain between sending a query and
/// decoding its results.
pub struct QueryState {
	item_count: usize,
	/// Occupied table location -> indices of the query items placed there
	/// (duplicates in the query share a cell).
	locations: HashMap<u32, LocationState>,
	/// Per item, the label key derived from the OPRF.
	label_keys: Vec<Option<LabelKey>>,
}

struct LocationState {
	item_indices: Vec<usize>,
}

pub struct Receiver {
	params: PsiParams,
	crypto: ReceiverCrypto,
}

impl Receiver {
	pub fn new<R: RngCore + CryptoRng>(params: PsiParams, rng: &mut R) -> Result<Self, Error> {
		let crypto = ReceiverCrypto::new(&params, rng)?;
		Ok(Self { params, crypto })
	}

	pub fn params(&self) -> &PsiParams {
		&self.params
	}

	/// Fetches protocol parameters from a sender.
	pub fn request_params(channel: &mut dyn Channel) -> Result<PsiParams, Error> {
		channel.send_operation(&SenderOperation {
			client_id: Vec::new(),
			kind: OperationKind::Parms,
		})?;
		match channel.receive_response()?.kind {
			ResponseKind::Parms(params) => Ok(params),
			ResponseKind::Error(message) => Err(sender_abort(message)),
			_ => Err(Error::Protocol("expected a parameter response".to_string())),
		}
	}

	/// Builds the encrypted query for a batch of OPRF-hashed items.
	///
	/// Items whose OPRF exchange failed arrive as `None` and simply stay
	/// unmatched. Cuckoo placement failure is a hard error: the parameter
	/// set cannot carry this query.
	pub fn create_query<R: RngCore + CryptoRng>(
		&self,
		hashed_items: &[Option<(HashedItem, LabelKey)>],
		rng: &mut R,
	) -> Result<(QueryState, QueryRequest), Error> {
		let table = self.params.table_params();
		let mut cuckoo = CuckooTable::new(table.table_size, table.hash_func_count, rng)?;

		let mut by_item: HashMap<HashedItem, Vec<usize>> = HashMap::new();
		let mut label_keys = vec![None; hashed_items.len()];
		for (index, entry) in hashed_items.iter().enumerate() {
			if let Some((hashed, label_key)) = entry {
				cuckoo.insert(*hashed)?;
				by_item.entry(*hashed).or_default().push(index);
				label_keys[index] = Some(*label_key);
			}
		}

		let modulus = self.params.plain_modulus();
		let item_bit_count = self.params.item_bit_count();
		let item_byte_count = (item_bit_count as usize + 7) / 8;
		let felts_per_item = self.params.item_params().felts_per_item as usize;
		let per_bundle = self.params.items_per_bundle() as usize;
		let columns = self.params.bundle_index_count() as usize;
		let degree = self.params.bfv_params().poly_modulus_degree as usize;

		let mut locations = HashMap::new();
		let mut column_values = vec![vec![0u64; degree]; columns];
		for (loc, cell) in cuckoo.cells().iter().enumerate() {
			let Some(cell) = cell else { continue };
			let bytes = cell.item.0.to_le_bytes();
			let view = BitstringView::new(&bytes[..item_byte_count], item_bit_count)?;
			let felts = to_field(view, modulus, felts_per_item)?;

			let column = loc / per_bundle;
			let base = (loc % per_bundle) * felts_per_item;
			column_values[column][base..base + felts_per_item].copy_from_slice(&felts);
			locations.insert(
				loc as u32,
				LocationState {
					item_indices: by_item[&cell.item].clone(),
				},
			);
		}

		// Encrypt x^s slot-wise for every source power s, plus the
		// encryption of one the constant coefficient row multiplies.
		let mut powers: BTreeMap<u32, Vec<Vec<u8>>> = BTreeMap::new();
		let ones = vec![1u64; degree];
		let mut ones_cts = Vec::with_capacity(columns);
		for _ in 0..columns {
			let ct = self.crypto.encrypt_simd(&ones, rng)?;
			ones_cts.push(self.crypto.context().ciphertext_to_bytes(&ct));
		}
		powers.insert(0, ones_cts);
		for &power in &self.params.query_params().query_powers {
			let mut cts = Vec::with_capacity(columns);
			for values in &column_values {
				let raised: Vec<u64> = values
					.iter()
					.map(|&v| modulus.pow(v, power as u64))
					.collect();
				let ct = self.crypto.encrypt_simd(&raised, rng)?;
				cts.push(self.crypto.context().ciphertext_to_bytes(&ct));
			}
			powers.insert(power, cts);
		}

		tracing::debug!(
			items = hashed_items.len(),
			occupied = locations.len(),
			columns,
			"query created"
		);
		Ok((
			QueryState {
				item_count: hashed_items.len(),
				locations,
				label_keys,
			},
			QueryRequest {
				relin_keys: self.crypto.relin_key_bytes().to_vec(),
				powers,
			},
		))
	}

	/// Decodes result packages into per-item match records, in the order of
	/// the original query items.
	pub fn process_results(
		&self,
		state: &QueryState,
		packages: &[ResultPackage],
	) -> Result<Vec<MatchRecord>, Error> {
		let mut records = vec![
			MatchRecord {
				found: false,
				label: None,
			};
			state.item_count
		];

		let felts_per_item = self.params.item_params().felts_per_item as usize;
		let per_bundle = self.params.items_per_bundle() as usize;
		let columns = self.params.bundle_index_count() as usize;
		let item_bit_count = self.params.item_bit_count() as usize;
		let modulus = self.params.plain_modulus();

		for package in packages {
			let column = package.bundle_index as usize;
			if column >= columns {
				return Err(Error::Protocol(format!(
					"result package for bundle index {column}, only {columns} exist"
				)));
			}
			let match_ct = self
				.crypto
				.context()
				.ciphertext_from_bytes(&package.match_ct)?;
			let slots = self.crypto.decrypt_simd(&match_ct)?;

			// Label ciphertexts are decrypted lazily, once per package.
			let mut label_slots: Option<Vec<Vec<u64>>> = None;

			for (&loc, location) in &state.locations {
				let loc = loc as usize;
				if loc / per_bundle != column {
					continue;
				}
				let base = (loc % per_bundle) * felts_per_item;
				if !slots[base..base + felts_per_item].iter().all(|&v| v == 0) {
					continue;
				}

				let label = if package.label_byte_count > 0 {
					let parts = label_part_count(
						(package.nonce_byte_count + package.label_byte_count) as usize,
						item_bit_count as u32,
					);
					if package.label_cts.len() != parts {
						return Err(Error::Protocol(format!(
							"package carries {} label ciphertexts, expected {parts}",
							package.label_cts.len()
						)));
					}
					if label_slots.is_none() {
						let decrypted = package
							.label_cts
							.iter()
							.map(|bytes| {
								let ct =
									self.crypto.context().ciphertext_from_bytes(bytes)?;
								self.crypto.decrypt_simd(&ct)
							})
							.collect::<Result<Vec<_>, _>>()?;
						label_slots = Some(decrypted);
					}
					let label_slots = label_slots.as_ref().expect("just populated");

					// Reassemble the encrypted label from its parts, then
					// strip the nonce.
					let total_bits = parts * item_bit_count;
					let mut encrypted = vec![0u8; (total_bits + 7) / 8];
					for (part, part_slots) in label_slots.iter().enumerate() {
						let felts = &part_slots[base..base + felts_per_item];
						let bits = from_field(felts, item_bit_count as u32, modulus)?;
						bit_copy(
							bits.data(),
							0,
							&mut encrypted,
							part * item_bit_count,
							item_bit_count,
						);
					}
					encrypted.truncate(
						(package.nonce_byte_count + package.label_byte_count) as usize,
					);

					let first_item = location.item_indices[0];
					let key = state.label_keys[first_item]
						.as_ref()
						.ok_or(Error::State("matched item has no label key"))?;
					Some(decrypt_label(
						&encrypted,
						key,
						package.nonce_byte_count as usize,
					)?)
				} else {
					None
				};

				for &index in &location.item_indices {
					records[index] = MatchRecord {
						found: true,
						label: label.clone(),
					};
				}
			}
		}
		Ok(records)
	}

	/// Runs the whole exchange over a channel: OPRF round trip, query,
	/// result collection, decoding.
	pub fn query_via_channel<R: RngCore + CryptoRng>(
		&self,
		channel: &mut dyn Channel,
		items: &[Item],
		rng: &mut R,
	) -> Result<Vec<MatchRecord>, Error> {
		let oprf_receiver = OprfReceiver::new(items, rng)?;
		channel.send_operation(&SenderOperation {
			client_id: Vec::new(),
			kind: OperationKind::Oprf(oprf_receiver.queries().to_vec()),
		})?;
		let responses = match channel.receive_response()?.kind {
			ResponseKind::Oprf(bytes) => bytes,
			ResponseKind::Error(message) => return Err(sender_abort(message)),
			_ => return Err(Error::Protocol("expected an OPRF response".to_string())),
		};
		let hashed_items = oprf_receiver.process_responses(&responses)?;

		let (state, request) = self.create_query(&hashed_items, rng)?;
		channel.send_operation(&SenderOperation {
			client_id: Vec::new(),
			kind: OperationKind::Query(request),
		})?;
		let package_count = match channel.receive_response()?.kind {
			ResponseKind::Query { package_count } => package_count,
			ResponseKind::Error(message) => return Err(sender_abort(message)),
			_ => return Err(Error::Protocol("expected a query response".to_string())),
		};
		if package_count > 1 << 24 {
			return Err(Error::Protocol(format!(
				"sender announced {package_count} result packages"
			)));
		}
		let mut packages = Vec::with_capacity(package_count as usize);
		for _ in 0..package_count {
			packages.push(channel.receive_result_package()?);
		}
		tracing::debug!(packages = packages.len(), "query results received");
		self.process_results(&state, &packages)
	}
}

/// The sender reported a contained per-request failure; surface it as a
/// request-fatal error without tearing down the channel.
fn sender_abort(message: String) -> Error {
	Error::Crypto(format!("sender aborted the request: {message}"))
}
