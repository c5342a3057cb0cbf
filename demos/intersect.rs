// Copyright 2024 Ulvetanna Inc.

//! End-to-end labeled intersection over a local TCP connection.
//!
//! Usage: `intersect [sender.csv] [query.csv]`
//!
//! CSV records are `<item>[,<label>]` with items given as hex (`0x` prefix),
//! decimal, or any other token (hashed as raw bytes); labels as hex or
//! UTF-8. Without arguments a small built-in data set runs.

use anyhow::{bail, Context};
use apsi_core::{
	network::StreamChannel, BfvParams, Item, ItemParams, PsiParams, QueryParams, Receiver,
	SenderDb, SenderDispatcher, TableParams,
};
use rand::rngs::OsRng;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const LABEL_BYTE_COUNT: usize = 16;
const NONCE_BYTE_COUNT: usize = 12;

fn demo_params() -> anyhow::Result<PsiParams> {
	Ok(PsiParams::new(
		ItemParams { felts_per_item: 8 },
		TableParams {
			hash_func_count: 3,
			table_size: 512,
			max_items_per_bin: 16,
		},
		QueryParams {
			ps_low_degree: 4,
			query_powers: [1, 2, 4, 8].into_iter().collect(),
		},
		BfvParams {
			poly_modulus_degree: 8192,
			coeff_modulus_bits: vec![50, 50, 50, 50],
			plain_modulus: 65537,
		},
	)?)
}

fn parse_item(token: &str) -> Item {
	let token = token.trim();
	if let Some(hex) = token.strip_prefix("0x") {
		if let Ok(value) = u128::from_str_radix(hex, 16) {
			return Item::from_words(value as u64, (value >> 64) as u64);
		}
	}
	if let Ok(value) = token.parse::<u128>() {
		return Item::from_words(value as u64, (value >> 64) as u64);
	}
	Item::from_bytes(token.as_bytes())
}

fn parse_label(token: &str) -> Vec<u8> {
	let token = token.trim();
	let mut label = if let Some(hex) = token.strip_prefix("0x") {
		(0..hex.len() / 2)
			.map(|i| u8::from_str_radix(&hex[2 * i..2 * i + 2], 16).unwrap_or(0))
			.collect()
	} else {
		token.as_bytes().to_vec()
	};
	if label.len() > LABEL_BYTE_COUNT {
		tracing::warn!(token, "label longer than {LABEL_BYTE_COUNT} bytes, truncating");
	}
	label.resize(LABEL_BYTE_COUNT, b' ');
	label
}

fn read_csv(path: &str, labeled: bool) -> anyhow::Result<Vec<(Item, Option<Vec<u8>>)>> {
	let contents =
		std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
	let mut records = Vec::new();
	for (line_no, line) in contents.lines().enumerate() {
		let line = line.trim();
		if line.is_empty() {
			continue;
		}
		let mut fields = line.splitn(2, ',');
		let Some(item) = fields.next().filter(|t| !t.trim().is_empty()) else {
			tracing::warn!(line_no, "skipping malformed record");
			continue;
		};
		let label = match (labeled, fields.next()) {
			(true, Some(label)) => Some(parse_label(label)),
			(true, None) => {
				tracing::warn!(line_no, "skipping record without a label");
				continue;
			}
			(false, _) => None,
		};
		records.push((parse_item(item), label));
	}
	Ok(records)
}

fn builtin_sender_set() -> Vec<(Item, Option<Vec<u8>>)> {
	[
		("alice", "clearance:blue"),
		("bob", "clearance:red"),
		("carol", "clearance:green"),
		("dave", "clearance:amber"),
	]
	.into_iter()
	.map(|(item, label)| (Item::from_bytes(item.as_bytes()), Some(parse_label(label))))
	.collect()
}

fn builtin_query_set() -> Vec<Item> {
	["alice", "carol", "mallory"]
		.into_iter()
		.map(|item| Item::from_bytes(item.as_bytes()))
		.collect()
}

fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt::init();
	let mut args = std::env::args().skip(1);

	let params = demo_params()?;
	let db = SenderDb::new(params.clone(), LABEL_BYTE_COUNT, NONCE_BYTE_COUNT, None, &mut OsRng)?;

	let sender_set = match args.next() {
		Some(path) => read_csv(&path, true)?,
		None => builtin_sender_set(),
	};
	let query_items = match args.next() {
		Some(path) => read_csv(&path, false)?
			.into_iter()
			.map(|(item, _)| item)
			.collect(),
		None => builtin_query_set(),
	};
	if sender_set.is_empty() || query_items.is_empty() {
		bail!("nothing to intersect");
	}

	let report = db.insert_or_assign(&sender_set, &mut OsRng)?;
	tracing::info!(?report, "sender database ready");

	let listener = TcpListener::bind("127.0.0.1:0")?;
	let addr = listener.local_addr()?;
	let stop = AtomicBool::new(false);

	std::thread::scope(|scope| -> anyhow::Result<()> {
		scope.spawn(|| -> anyhow::Result<()> {
			let (stream, peer) = listener.accept()?;
			tracing::info!(%peer, "client connected");
			stream.set_read_timeout(Some(Duration::from_millis(100)))?;
			let mut channel = StreamChannel::new(stream.try_clone()?, stream);
			SenderDispatcher::new(&db).run(&mut channel, &stop)?;
			Ok(())
		});

		let stream = TcpStream::connect(addr)?;
		let mut channel = StreamChannel::new(stream.try_clone()?, stream);

		let remote_params = Receiver::request_params(&mut channel)?;
		anyhow::ensure!(remote_params == params, "parameter mismatch");

		let receiver = Receiver::new(remote_params, &mut OsRng)?;
		let records = receiver.query_via_channel(&mut channel, &query_items, &mut OsRng)?;

		for (item, record) in query_items.iter().zip(records.iter()) {
			match (&record.found, &record.label) {
				(true, Some(label)) => println!(
					"{item:?}  MATCH  label = {}",
					String::from_utf8_lossy(label).trim_end()
				),
				(true, None) => println!("{item:?}  MATCH"),
				_ => println!("{item:?}  no match"),
			}
		}

		stop.store(true, Ordering::Release);
		Ok(())
	})
}
