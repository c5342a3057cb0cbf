// Copyright 2024 Ulvetanna Inc.

//! Elliptic-curve OPRF `F(k, x) = H(x)^k` over the Ristretto group.
//!
//! The receiver blinds each item with a fresh scalar before it leaves the
//! process, so the sender evaluates the PRF without ever seeing an item;
//! unblinding on the receiver yields exactly the value the sender computes
//! directly on its own set via [`compute_hashes`].

mod key;
mod receiver;
mod sender;

pub use key::OprfKey;
pub use receiver::OprfReceiver;
pub use sender::{compute_hashes, process_queries};

use blake2::{Blake2b512, Digest};
use curve25519_dalek::ristretto::RistrettoPoint;

use crate::item::{HashedItem, Item, LabelKey};

pub const OPRF_KEY_BYTE_COUNT: usize = 32;
pub const OPRF_POINT_BYTE_COUNT: usize = 32;

fn hash_to_curve(item: &Item) -> RistrettoPoint {
	let digest = Blake2b512::new()
		.chain_update(b"APSI hash-to-curve")
		.chain_update(item.to_le_bytes())
		.finalize();
	let mut wide = [0u8; 64];
	wide.copy_from_slice(&digest);
	RistrettoPoint::from_uniform_bytes(&wide)
}

/// Derives the hashed item and its label key from an evaluated OPRF point.
fn extract_hashes(point: &RistrettoPoint) -> (HashedItem, LabelKey) {
	let digest = Blake2b512::new()
		.chain_update(b"APSI extract")
		.chain_update(point.compress().as_bytes())
		.finalize();
	let mut item_bytes = [0u8; 16];
	item_bytes.copy_from_slice(&digest[..16]);
	let mut key_bytes = [0u8; 32];
	key_bytes.copy_from_slice(&digest[16..48]);
	(
		HashedItem(Item::from_le_bytes(item_bytes)),
		LabelKey::new(key_bytes),
	)
}
