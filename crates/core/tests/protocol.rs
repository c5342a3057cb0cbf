// Copyright 2024 Ulvetanna Inc.

//! End-to-end protocol scenarios: unlabeled and labeled intersection,
//! duplicate updates, Paterson-Stockmeyer equivalence, stripped databases,
//! and the framed dispatcher over TCP.

use apsi_core::{
	network::{Channel, OperationKind, ResponseKind, SenderOperation, StreamChannel},
	oprf::OprfReceiver,
	sender::process_query,
	BfvParams, Item, ItemParams, MatchRecord, PsiParams, QueryParams, Receiver, SenderDb,
	SenderDispatcher, TableParams,
};
use rand::{rngs::StdRng, CryptoRng, RngCore, SeedableRng};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

fn tiny_params(ps_low_degree: u32) -> PsiParams {
	PsiParams::new(
		ItemParams { felts_per_item: 4 },
		TableParams {
			hash_func_count: 3,
			table_size: 256,
			max_items_per_bin: 16,
		},
		QueryParams {
			ps_low_degree,
			query_powers: [1, 2, 4, 8].into_iter().collect(),
		},
		BfvParams {
			poly_modulus_degree: 2048,
			coeff_modulus_bits: vec![45, 45],
			plain_modulus: 40961,
		},
	)
	.unwrap()
}

fn large_params(ps_low_degree: u32) -> PsiParams {
	PsiParams::new(
		ItemParams { felts_per_item: 8 },
		TableParams {
			hash_func_count: 3,
			table_size: 512,
			max_items_per_bin: 16,
		},
		QueryParams {
			ps_low_degree,
			query_powers: [1, 2, 4, 8].into_iter().collect(),
		},
		BfvParams {
			poly_modulus_degree: 8192,
			coeff_modulus_bits: vec![50, 50, 50, 50],
			plain_modulus: 65537,
		},
	)
	.unwrap()
}

fn items(names: &[&str]) -> Vec<Item> {
	names.iter().map(|n| Item::from_bytes(n.as_bytes())).collect()
}

/// Full protocol run without a network in between.
fn run_query<R: RngCore + CryptoRng>(
	db: &SenderDb,
	receiver: &Receiver,
	query_items: &[Item],
	rng: &mut R,
) -> Vec<MatchRecord> {
	let oprf_receiver = OprfReceiver::new(query_items, rng).unwrap();
	let responses = db.process_oprf(oprf_receiver.queries()).unwrap();
	let hashed_items = oprf_receiver.process_responses(&responses).unwrap();
	let (state, request) = receiver.create_query(&hashed_items, rng).unwrap();

	let packages = Mutex::new(Vec::new());
	process_query(db, &request, |package| {
		packages.lock().unwrap().push(package);
		Ok(())
	})
	.unwrap();
	receiver
		.process_results(&state, &packages.into_inner().unwrap())
		.unwrap()
}

#[test]
fn tiny_unlabeled_intersection() {
	let mut rng = StdRng::seed_from_u64(100);
	let params = tiny_params(0);
	let db = SenderDb::new(params.clone(), 0, 0, Some(2), &mut rng).unwrap();

	let sender_set: Vec<(Item, Option<Vec<u8>>)> = items(&["alice", "bob", "carol"])
		.into_iter()
		.map(|item| (item, None))
		.collect();
	let report = db.insert_or_assign(&sender_set, &mut rng).unwrap();
	assert!(report.inserted > 0);

	let receiver = Receiver::new(params, &mut rng).unwrap();
	let records = run_query(&db, &receiver, &items(&["alice", "dave", "carol"]), &mut rng);

	assert_eq!(
		records.iter().map(|r| r.found).collect::<Vec<_>>(),
		vec![true, false, true]
	);
	assert!(records.iter().all(|r| r.label.is_none()));
}

#[test]
fn labeled_intersection_recovers_labels() {
	let mut rng = StdRng::seed_from_u64(101);
	let params = tiny_params(0);
	let db = SenderDb::new(params.clone(), 8, 12, Some(2), &mut rng).unwrap();

	let sender_set = vec![
		(Item::from_bytes(b"user1"), Some(b"PREMIUM_".to_vec())),
		(Item::from_bytes(b"user2"), Some(b"STANDARD".to_vec())),
	];
	db.insert_or_assign(&sender_set, &mut rng).unwrap();

	let receiver = Receiver::new(params, &mut rng).unwrap();
	let records = run_query(&db, &receiver, &items(&["user1", "user3", "user2"]), &mut rng);

	assert!(records[0].found);
	assert_eq!(records[0].label.as_deref(), Some(b"PREMIUM_".as_slice()));
	assert!(!records[1].found);
	assert_eq!(records[1].label, None);
	assert!(records[2].found);
	assert_eq!(records[2].label.as_deref(), Some(b"STANDARD".as_slice()));
}

#[test]
fn insert_or_assign_updates_label_in_place() {
	let mut rng = StdRng::seed_from_u64(102);
	let params = tiny_params(0);
	let db = SenderDb::new(params.clone(), 2, 4, Some(2), &mut rng).unwrap();

	db.insert_or_assign(&[(Item::from_bytes(b"k"), Some(b"v1".to_vec()))], &mut rng)
		.unwrap();
	let bundles_before = db.bundle_count();
	let entries_before = db.item_entry_count();

	let report = db
		.insert_or_assign(&[(Item::from_bytes(b"k"), Some(b"v2".to_vec()))], &mut rng)
		.unwrap();
	assert_eq!(report.inserted, 0);
	assert!(report.updated > 0);
	assert_eq!(db.bundle_count(), bundles_before);
	assert_eq!(db.item_entry_count(), entries_before);

	let receiver = Receiver::new(params, &mut rng).unwrap();
	let records = run_query(&db, &receiver, &items(&["k"]), &mut rng);
	assert!(records[0].found);
	assert_eq!(records[0].label.as_deref(), Some(b"v2".as_slice()));
}

#[test]
fn unlabeled_duplicates_are_counted_not_inserted() {
	let mut rng = StdRng::seed_from_u64(103);
	let db = SenderDb::new(tiny_params(0), 0, 0, Some(2), &mut rng).unwrap();

	let set: Vec<(Item, Option<Vec<u8>>)> =
		items(&["x", "y"]).into_iter().map(|i| (i, None)).collect();
	let first = db.insert_or_assign(&set, &mut rng).unwrap();
	let second = db.insert_or_assign(&set, &mut rng).unwrap();
	assert_eq!(second.inserted, 0);
	assert_eq!(second.duplicates, first.inserted);
}

#[test]
fn label_length_mismatch_is_rejected() {
	let mut rng = StdRng::seed_from_u64(104);
	let db = SenderDb::new(tiny_params(0), 8, 12, Some(2), &mut rng).unwrap();
	let err = db
		.insert_or_assign(&[(Item::from_bytes(b"a"), Some(b"short".to_vec()))], &mut rng)
		.unwrap_err();
	assert!(matches!(
		err,
		apsi_core::Error::LabelMismatch { expected: 8, got: 5 }
	));
}

#[test]
fn paterson_stockmeyer_matches_dot_product() {
	let mut rng_a = StdRng::seed_from_u64(105);
	let mut rng_b = StdRng::seed_from_u64(105);

	let sender_names: Vec<String> = (0..120).map(|i| format!("member-{i}")).collect();
	let sender_set: Vec<(Item, Option<Vec<u8>>)> = sender_names
		.iter()
		.map(|n| {
			(
				Item::from_bytes(n.as_bytes()),
				Some(format!("{n:<8.8}").into_bytes()),
			)
		})
		.collect();
	let query_names = ["member-3", "stranger-1", "member-77", "member-119", "stranger-2"];
	let expected = [true, false, true, true, false];

	let mut results = Vec::new();
	for (ps_low_degree, rng) in [(0u32, &mut rng_a), (4u32, &mut rng_b)] {
		let params = large_params(ps_low_degree);
		let db = SenderDb::new(params.clone(), 8, 0, Some(4), rng).unwrap();
		db.insert_or_assign(&sender_set, rng).unwrap();
		let receiver = Receiver::new(params, rng).unwrap();
		results.push(run_query(&db, &receiver, &items(&query_names), rng));
	}

	for (record, &expected_found) in results[0].iter().zip(expected.iter()) {
		assert_eq!(record.found, expected_found);
	}
	// Identical records under both evaluation strategies, labels included.
	assert_eq!(results[0], results[1]);
}

#[test]
fn stripped_database_still_answers_queries() {
	let mut rng = StdRng::seed_from_u64(106);
	let params = tiny_params(0);
	let mut db = SenderDb::new(params.clone(), 8, 12, Some(2), &mut rng).unwrap();
	let sender_set = vec![
		(Item::from_bytes(b"user1"), Some(b"PREMIUM_".to_vec())),
		(Item::from_bytes(b"user2"), Some(b"STANDARD".to_vec())),
	];
	db.insert_or_assign(&sender_set, &mut rng).unwrap();

	let receiver = Receiver::new(params, &mut rng).unwrap();
	let query_items = items(&["user1", "user3", "user2"]);

	// OPRF must happen while the key still exists.
	let oprf_receiver = OprfReceiver::new(&query_items, &mut rng).unwrap();
	let responses = db.process_oprf(oprf_receiver.queries()).unwrap();
	let hashed_items = oprf_receiver.process_responses(&responses).unwrap();

	db.strip().unwrap();
	assert!(db.is_stripped());
	assert!(matches!(
		db.insert_or_assign(&sender_set, &mut rng),
		Err(apsi_core::Error::State(_))
	));
	assert!(matches!(
		db.process_oprf(oprf_receiver.queries()),
		Err(apsi_core::Error::State(_))
	));

	let mut buffer = Vec::new();
	db.save(&mut buffer).unwrap();
	drop(db);
	let reloaded = SenderDb::load(&mut buffer.as_slice(), Some(2)).unwrap();
	assert!(reloaded.is_stripped());

	let (state, request) = receiver.create_query(&hashed_items, &mut rng).unwrap();
	let packages = Mutex::new(Vec::new());
	process_query(&reloaded, &request, |package| {
		packages.lock().unwrap().push(package);
		Ok(())
	})
	.unwrap();
	let records = receiver
		.process_results(&state, &packages.into_inner().unwrap())
		.unwrap();

	assert!(records[0].found);
	assert_eq!(records[0].label.as_deref(), Some(b"PREMIUM_".as_slice()));
	assert!(!records[1].found);
	assert!(records[2].found);
	assert_eq!(records[2].label.as_deref(), Some(b"STANDARD".as_slice()));
}

#[test]
fn unstripped_database_save_load_roundtrip() {
	let mut rng = StdRng::seed_from_u64(107);
	let params = tiny_params(0);
	let db = SenderDb::new(params.clone(), 0, 0, Some(2), &mut rng).unwrap();
	let set: Vec<(Item, Option<Vec<u8>>)> =
		items(&["a", "b", "c"]).into_iter().map(|i| (i, None)).collect();
	db.insert_or_assign(&set, &mut rng).unwrap();

	let mut buffer = Vec::new();
	db.save(&mut buffer).unwrap();
	let reloaded = SenderDb::load(&mut buffer.as_slice(), Some(2)).unwrap();
	assert!(!reloaded.is_stripped());
	assert_eq!(reloaded.bundle_count(), db.bundle_count());
	assert_eq!(reloaded.item_entry_count(), db.item_entry_count());

	// The reloaded database accepts further inserts.
	let more: Vec<(Item, Option<Vec<u8>>)> =
		items(&["d"]).into_iter().map(|i| (i, None)).collect();
	reloaded.insert_or_assign(&more, &mut rng).unwrap();

	let receiver = Receiver::new(params, &mut rng).unwrap();
	let records = run_query(&reloaded, &receiver, &items(&["a", "d", "zz"]), &mut rng);
	assert_eq!(
		records.iter().map(|r| r.found).collect::<Vec<_>>(),
		vec![true, true, false]
	);
}

#[test]
fn query_with_wrong_powers_is_rejected() {
	let mut rng = StdRng::seed_from_u64(108);
	let params = tiny_params(0);
	let db = SenderDb::new(params.clone(), 0, 0, Some(2), &mut rng).unwrap();
	let set: Vec<(Item, Option<Vec<u8>>)> =
		items(&["a"]).into_iter().map(|i| (i, None)).collect();
	db.insert_or_assign(&set, &mut rng).unwrap();

	let receiver = Receiver::new(params, &mut rng).unwrap();
	let query_items = items(&["a"]);
	let oprf_receiver = OprfReceiver::new(&query_items, &mut rng).unwrap();
	let responses = db.process_oprf(oprf_receiver.queries()).unwrap();
	let hashed_items = oprf_receiver.process_responses(&responses).unwrap();
	let (_, mut request) = receiver.create_query(&hashed_items, &mut rng).unwrap();
	request.powers.remove(&8);

	let err = process_query(&db, &request, |_| Ok(())).unwrap_err();
	assert!(matches!(err, apsi_core::Error::InvalidQuery(_)));
}

#[test]
fn dispatcher_serves_queries_over_tcp() {
	let mut rng = StdRng::seed_from_u64(109);
	let params = tiny_params(0);
	let db = SenderDb::new(params.clone(), 0, 0, Some(2), &mut rng).unwrap();
	let set: Vec<(Item, Option<Vec<u8>>)> = items(&["alice", "bob", "carol"])
		.into_iter()
		.map(|i| (i, None))
		.collect();
	db.insert_or_assign(&set, &mut rng).unwrap();

	let listener = TcpListener::bind("127.0.0.1:0").unwrap();
	let addr = listener.local_addr().unwrap();
	let stop = AtomicBool::new(false);

	std::thread::scope(|scope| {
		scope.spawn(|| {
			let (stream, _) = listener.accept().unwrap();
			stream
				.set_read_timeout(Some(Duration::from_millis(50)))
				.unwrap();
			let mut channel = StreamChannel::new(stream.try_clone().unwrap(), stream);
			SenderDispatcher::new(&db).run(&mut channel, &stop).unwrap();
		});

		let stream = TcpStream::connect(addr).unwrap();
		let mut channel = StreamChannel::new(stream.try_clone().unwrap(), stream);

		let remote_params = Receiver::request_params(&mut channel).unwrap();
		assert_eq!(remote_params, params);

		let receiver = Receiver::new(remote_params, &mut rng).unwrap();
		let records = receiver
			.query_via_channel(&mut channel, &items(&["carol", "mallory", "alice"]), &mut rng)
			.unwrap();
		assert_eq!(
			records.iter().map(|r| r.found).collect::<Vec<_>>(),
			vec![true, false, true]
		);

		stop.store(true, Ordering::Release);
	});
}

#[test]
fn dispatcher_contains_request_failures() {
	let mut rng = StdRng::seed_from_u64(110);
	let params = tiny_params(0);
	let db = SenderDb::new(params.clone(), 0, 0, Some(2), &mut rng).unwrap();
	let set: Vec<(Item, Option<Vec<u8>>)> =
		items(&["alice"]).into_iter().map(|i| (i, None)).collect();
	db.insert_or_assign(&set, &mut rng).unwrap();

	let listener = TcpListener::bind("127.0.0.1:0").unwrap();
	let addr = listener.local_addr().unwrap();
	let stop = AtomicBool::new(false);

	std::thread::scope(|scope| {
		scope.spawn(|| {
			let (stream, _) = listener.accept().unwrap();
			stream
				.set_read_timeout(Some(Duration::from_millis(50)))
				.unwrap();
			let mut channel = StreamChannel::new(stream.try_clone().unwrap(), stream);
			SenderDispatcher::new(&db).run(&mut channel, &stop).unwrap();
		});

		let stream = TcpStream::connect(addr).unwrap();
		let mut channel = StreamChannel::new(stream.try_clone().unwrap(), stream);

		// A malformed OPRF point aborts only that request: the sender
		// answers with an error response instead of dropping the channel.
		channel
			.send_operation(&SenderOperation {
				client_id: b"client-9".to_vec(),
				kind: OperationKind::Oprf(vec![0xff; 32]),
			})
			.unwrap();
		let response = channel.receive_response().unwrap();
		assert_eq!(response.client_id, b"client-9");
		match response.kind {
			ResponseKind::Error(message) => assert!(!message.is_empty()),
			kind => panic!("expected an error response, got {kind:?}"),
		}

		// The same connection keeps serving full queries afterwards.
		let receiver = Receiver::new(params.clone(), &mut rng).unwrap();
		let records = receiver
			.query_via_channel(&mut channel, &items(&["alice", "bob"]), &mut rng)
			.unwrap();
		assert_eq!(
			records.iter().map(|r| r.found).collect::<Vec<_>>(),
			vec![true, false]
		);

		stop.store(true, Ordering::Release);
	});
}
