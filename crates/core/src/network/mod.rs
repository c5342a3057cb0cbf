// Copyright 2024 Ulvetanna Inc.

//! Wire protocol: framed request/response messages over a byte channel.
//!
//! Every frame starts with a 4-byte magic and a 4-byte version, followed by
//! an opaque client id the router may use to address responses. The actual
//! transport is abstracted behind [`Channel`]; anything `Read + Write`
//! (a TCP stream, an in-memory duplex) becomes a channel via
//! [`StreamChannel`].

mod channel;
mod result_package;
mod sop;

pub use channel::{Channel, StreamChannel};
pub use result_package::ResultPackage;
pub use sop::{OperationKind, ResponseKind, SenderOperation, SenderResponse};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::error::Error;

pub const PROTOCOL_MAGIC: u32 = u32::from_le_bytes(*b"APSI");
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on any single length-prefixed field; a frame announcing more
/// is treated as a protocol violation rather than an allocation request.
const MAX_BLOB_LEN: usize = 1 << 30;

pub(crate) fn write_blob<W: Write>(writer: &mut W, bytes: &[u8]) -> Result<(), Error> {
	writer.write_u32::<LittleEndian>(bytes.len() as u32)?;
	writer.write_all(bytes)?;
	Ok(())
}

pub(crate) fn read_blob<R: Read>(reader: &mut R) -> Result<Vec<u8>, Error> {
	let len = reader.read_u32::<LittleEndian>()? as usize;
	if len > MAX_BLOB_LEN {
		return Err(Error::Protocol(format!("blob of {len} bytes exceeds frame limit")));
	}
	let mut bytes = vec![0u8; len];
	reader.read_exact(&mut bytes)?;
	Ok(bytes)
}
