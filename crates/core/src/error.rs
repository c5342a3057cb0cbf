// Copyright 2024 Ulvetanna Inc.

/// Error taxonomy of the protocol core.
///
/// Configuration and state errors are fatal for the session that raised
/// them; `Crypto` is fatal for the current request; `Protocol` and `Io`
/// surface at the connection boundary and reset the channel.
#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("invalid configuration: {0}")]
	Config(String),
	#[error("cuckoo hashing failed to place an item within the probe budget")]
	InsufficientCapacity,
	#[error("every candidate bin has reached its maximum load")]
	CapacityExceeded,
	#[error("cryptographic operation failed: {0}")]
	Crypto(String),
	#[error("protocol violation: {0}")]
	Protocol(String),
	#[error("peer disconnected")]
	Disconnected,
	#[error("operation not valid in the current state: {0}")]
	State(&'static str),
	#[error("label has {got} bytes, database expects {expected}")]
	LabelMismatch { expected: usize, got: usize },
	#[error("malformed query: {0}")]
	InvalidQuery(String),
	#[error("ciphertext failed to deserialize")]
	InvalidCiphertext,
	#[error(transparent)]
	Field(#[from] apsi_field::Error),
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

impl From<fhe::Error> for Error {
	fn from(err: fhe::Error) -> Self {
		Error::Crypto(err.to_string())
	}
}
