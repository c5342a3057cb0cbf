// Copyright 2024 Ulvetanna Inc.

//! Builds a labeled database, strips and persists it, reloads it, and runs
//! a query against the reloaded copy in process (no network).
//!
//! Usage: `stripped [db-path]`

use apsi_core::{
	sender::process_query, BfvParams, Item, ItemParams, PsiParams, QueryParams, Receiver,
	SenderDb, TableParams,
};
use rand::rngs::OsRng;
use std::sync::Mutex;

fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt::init();
	let db_path = std::env::args()
		.nth(1)
		.unwrap_or_else(|| "stripped-demo.apsidb".to_string());

	let params = PsiParams::new(
		ItemParams { felts_per_item: 8 },
		TableParams {
			hash_func_count: 3,
			table_size: 512,
			max_items_per_bin: 16,
		},
		QueryParams {
			ps_low_degree: 0,
			query_powers: [1, 2, 4, 8].into_iter().collect(),
		},
		BfvParams {
			poly_modulus_degree: 8192,
			coeff_modulus_bits: vec![50, 50, 50, 50],
			plain_modulus: 65537,
		},
	)?;

	let mut db = SenderDb::new(params.clone(), 8, 12, None, &mut OsRng)?;
	let users: Vec<(Item, Option<Vec<u8>>)> = [
		("user1", *b"PREMIUM_"),
		("user2", *b"STANDARD"),
		("user3", *b"TRIAL___"),
	]
	.into_iter()
	.map(|(name, label)| (Item::from_bytes(name.as_bytes()), Some(label.to_vec())))
	.collect();
	db.insert_or_assign(&users, &mut OsRng)?;

	// The receiver must finish its OPRF exchange before the strip discards
	// the key.
	let query_items: Vec<Item> = ["user2", "user4", "user1"]
		.into_iter()
		.map(|name| Item::from_bytes(name.as_bytes()))
		.collect();
	let oprf_receiver = apsi_core::oprf::OprfReceiver::new(&query_items, &mut OsRng)?;
	let oprf_responses = db.process_oprf(oprf_receiver.queries())?;
	let hashed_items = oprf_receiver.process_responses(&oprf_responses)?;

	db.strip()?;
	assert!(db.insert_or_assign(&users, &mut OsRng).is_err());

	let mut file = std::fs::File::create(&db_path)?;
	db.save(&mut file)?;
	drop(db);
	tracing::info!(db_path, "stripped database persisted");

	let mut file = std::fs::File::open(&db_path)?;
	let reloaded = SenderDb::load(&mut file, None)?;
	assert!(reloaded.is_stripped());

	let receiver = Receiver::new(reloaded.params().clone(), &mut OsRng)?;
	let (state, request) = receiver.create_query(&hashed_items, &mut OsRng)?;
	let packages = Mutex::new(Vec::new());
	process_query(&reloaded, &request, |package| {
		packages.lock().expect("collector poisoned").push(package);
		Ok(())
	})?;
	let records = receiver.process_results(&state, &packages.into_inner().expect("collector poisoned"))?;

	for (name, record) in ["user2", "user4", "user1"].iter().zip(records.iter()) {
		match (&record.found, &record.label) {
			(true, Some(label)) => {
				println!("{name}: MATCH, label = {}", String::from_utf8_lossy(label))
			}
			(true, None) => println!("{name}: MATCH"),
			_ => println!("{name}: no match"),
		}
	}
	Ok(())
}
