// Copyright 2024 Ulvetanna Inc.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::{
	error::Error,
	network::{Channel, OperationKind, ResponseKind, SenderResponse},
	sender::{process_query, SenderDb},
};

/// Serves one connection: receives operations, dispatches them against the
/// database, and streams responses back.
pub struct SenderDispatcher<'a> {
	db: &'a SenderDb,
}

impl<'a> SenderDispatcher<'a> {
	pub fn new(db: &'a SenderDb) -> Self {
		Self { db }
	}

	/// Runs until the peer disconnects or `stop` is raised. The stop flag is
	/// polled between requests; an in-flight request runs to completion.
	///
	/// Failures are contained per request: crypto and state errors abort
	/// only the request that raised them and go back to the client as an
	/// error response, after which the loop keeps serving the connection.
	/// Only I/O and protocol errors reset the channel (returned as errors);
	/// a clean disconnect returns `Ok`.
	pub fn run(&self, channel: &mut dyn Channel, stop: &AtomicBool) -> Result<(), Error> {
		loop {
			if stop.load(Ordering::Acquire) {
				tracing::info!("dispatcher stopping on request");
				return Ok(());
			}
			let op = match channel.receive_operation() {
				Ok(Some(op)) => op,
				Ok(None) => continue,
				Err(Error::Disconnected) => {
					tracing::debug!("peer disconnected");
					return Ok(());
				}
				Err(e) => return Err(e),
			};

			match op.kind {
				OperationKind::Parms => {
					tracing::debug!("serving parameter request");
					channel.send_response(&SenderResponse {
						client_id: op.client_id,
						kind: ResponseKind::Parms(self.db.params().clone()),
					})?;
				}
				OperationKind::Oprf(queries) => {
					tracing::debug!(bytes = queries.len(), "serving OPRF request");
					let kind = match self.db.process_oprf(&queries) {
						Ok(responses) => ResponseKind::Oprf(responses),
						Err(e) if resets_connection(&e) => return Err(e),
						Err(e) => {
							tracing::warn!(error = %e, "OPRF request aborted");
							ResponseKind::Error(e.to_string())
						}
					};
					channel.send_response(&SenderResponse {
						client_id: op.client_id,
						kind,
					})?;
				}
				OperationKind::Query(request) => {
					let package_count = self.db.bundle_count() as u32;
					tracing::debug!(package_count, "serving query request");
					// The count announcement is deferred until evaluation
					// yields its first package, so a failure caught before
					// anything went out can still be reported in-band.
					let streaming = AtomicBool::new(false);
					let client_id = op.client_id.clone();
					let result = {
						let shared = Mutex::new(&mut *channel);
						process_query(self.db, &request, |package| {
							let mut channel =
								shared.lock().unwrap_or_else(PoisonError::into_inner);
							if !streaming.swap(true, Ordering::AcqRel) {
								channel.send_response(&SenderResponse {
									client_id: client_id.clone(),
									kind: ResponseKind::Query { package_count },
								})?;
							}
							channel.send_result_package(&package)
						})
					};
					match result {
						Ok(()) => {
							// An empty database streams nothing; the count
							// still has to go out.
							if !streaming.load(Ordering::Acquire) {
								channel.send_response(&SenderResponse {
									client_id: op.client_id,
									kind: ResponseKind::Query { package_count },
								})?;
							}
						}
						Err(e) if resets_connection(&e) || streaming.load(Ordering::Acquire) => {
							tracing::error!(error = %e, "query failed mid-stream; resetting connection");
							return Err(e);
						}
						Err(e) => {
							tracing::warn!(error = %e, "query aborted");
							channel.send_response(&SenderResponse {
								client_id: op.client_id,
								kind: ResponseKind::Error(e.to_string()),
							})?;
						}
					}
				}
			}
		}
	}
}

/// Whether an error invalidates the channel itself rather than only the
/// request that raised it.
fn resets_connection(error: &Error) -> bool {
	matches!(error, Error::Io(_) | Error::Protocol(_) | Error::Disconnected)
}
