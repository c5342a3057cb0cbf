// Copyright 2024 Ulvetanna Inc.

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
	#[error("modulus must be an odd prime below 2^63, got {0}")]
	InvalidModulus(u64),
	#[error("bit count {bit_count} does not fit the buffer of {len} bytes")]
	BitCountMismatch { bit_count: u32, len: usize },
	#[error("bit count must be positive")]
	EmptyBitstring,
	#[error("{bit_count} bits do not fit in {felt_count} field elements of {bits_per_felt} bits")]
	TooManyBits {
		bit_count: u32,
		felt_count: usize,
		bits_per_felt: u32,
	},
	#[error("field element {0} is out of range for the modulus")]
	FeltOutOfRange(u64),
	#[error("zero has no multiplicative inverse")]
	ZeroInverse,
	#[error("interpolation points must be pairwise distinct")]
	RepeatedInterpolationPoint,
}
