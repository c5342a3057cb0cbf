// Copyright 2024 Ulvetanna Inc.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::BTreeMap;
use std::io::{Read, Write};

use crate::error::Error;
use crate::network::{read_blob, write_blob};
use crate::params::PsiParams;
use crate::sender::QueryRequest;

const OP_PARMS: u32 = 1;
const OP_OPRF: u32 = 2;
const OP_QUERY: u32 = 3;
const OP_ERROR: u32 = 4;

/// A request frame sent by the receiver.
#[derive(Debug, Clone)]
pub struct SenderOperation {
	/// Opaque routing id; echoed back on the response.
	pub client_id: Vec<u8>,
	pub kind: OperationKind,
}

#[derive(Debug, Clone)]
pub enum OperationKind {
	/// Ask for the sender's protocol parameters.
	Parms,
	/// Blinded OPRF query points, `n · 32` bytes.
	Oprf(Vec<u8>),
	/// The encrypted query itself.
	Query(QueryRequest),
}

/// A response frame sent by the sender. A `Query` response announces the
/// package count; the packages themselves follow as separate messages.
#[derive(Debug, Clone)]
pub struct SenderResponse {
	pub client_id: Vec<u8>,
	pub kind: ResponseKind,
}

#[derive(Debug, Clone)]
pub enum ResponseKind {
	Parms(PsiParams),
	Oprf(Vec<u8>),
	Query { package_count: u32 },
	/// The request was aborted on the sender; the connection stays up.
	Error(String),
}

impl SenderOperation {
	pub(crate) fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), Error> {
		write_blob(writer, &self.client_id)?;
		match &self.kind {
			OperationKind::Parms => {
				writer.write_u32::<LittleEndian>(OP_PARMS)?;
			}
			OperationKind::Oprf(queries) => {
				writer.write_u32::<LittleEndian>(OP_OPRF)?;
				write_blob(writer, queries)?;
			}
			OperationKind::Query(request) => {
				writer.write_u32::<LittleEndian>(OP_QUERY)?;
				write_blob(writer, &request.relin_keys)?;
				writer.write_u32::<LittleEndian>(request.powers.len() as u32)?;
				for (&power, cts) in &request.powers {
					writer.write_u32::<LittleEndian>(power)?;
					writer.write_u32::<LittleEndian>(cts.len() as u32)?;
					for ct in cts {
						write_blob(writer, ct)?;
					}
				}
			}
		}
		Ok(())
	}

	pub(crate) fn read_from<R: Read>(reader: &mut R) -> Result<Self, Error> {
		let client_id = read_blob(reader)?;
		let kind = match reader.read_u32::<LittleEndian>()? {
			OP_PARMS => OperationKind::Parms,
			OP_OPRF => OperationKind::Oprf(read_blob(reader)?),
			OP_QUERY => {
				let relin_keys = read_blob(reader)?;
				let power_count = reader.read_u32::<LittleEndian>()? as usize;
				if power_count > 1 << 16 {
					return Err(Error::Protocol("unreasonable power count".to_string()));
				}
				let mut powers = BTreeMap::new();
				for _ in 0..power_count {
					let power = reader.read_u32::<LittleEndian>()?;
					let ct_count = reader.read_u32::<LittleEndian>()? as usize;
					if ct_count > 1 << 20 {
						return Err(Error::Protocol(
							"unreasonable ciphertext count".to_string(),
						));
					}
					let mut cts = Vec::with_capacity(ct_count);
					for _ in 0..ct_count {
						cts.push(read_blob(reader)?);
					}
					if powers.insert(power, cts).is_some() {
						return Err(Error::Protocol(format!("power {power} sent twice")));
					}
				}
				OperationKind::Query(QueryRequest { relin_keys, powers })
			}
			tag => return Err(Error::Protocol(format!("unknown operation tag {tag}"))),
		};
		Ok(Self { client_id, kind })
	}
}

impl SenderResponse {
	pub(crate) fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), Error> {
		write_blob(writer, &self.client_id)?;
		match &self.kind {
			ResponseKind::Parms(params) => {
				writer.write_u32::<LittleEndian>(OP_PARMS)?;
				write_blob(writer, &params.to_bytes())?;
			}
			ResponseKind::Oprf(responses) => {
				writer.write_u32::<LittleEndian>(OP_OPRF)?;
				write_blob(writer, responses)?;
			}
			ResponseKind::Query { package_count } => {
				writer.write_u32::<LittleEndian>(OP_QUERY)?;
				writer.write_u32::<LittleEndian>(*package_count)?;
			}
			ResponseKind::Error(message) => {
				writer.write_u32::<LittleEndian>(OP_ERROR)?;
				write_blob(writer, message.as_bytes())?;
			}
		}
		Ok(())
	}

	pub(crate) fn read_from<R: Read>(reader: &mut R) -> Result<Self, Error> {
		let client_id = read_blob(reader)?;
		let kind = match reader.read_u32::<LittleEndian>()? {
			OP_PARMS => ResponseKind::Parms(PsiParams::from_bytes(&read_blob(reader)?)?),
			OP_OPRF => ResponseKind::Oprf(read_blob(reader)?),
			OP_QUERY => ResponseKind::Query {
				package_count: reader.read_u32::<LittleEndian>()?,
			},
			OP_ERROR => {
				let message = String::from_utf8(read_blob(reader)?)
					.map_err(|_| Error::Protocol("error message is not UTF-8".to_string()))?;
				ResponseKind::Error(message)
			}
			tag => return Err(Error::Protocol(format!("unknown response tag {tag}"))),
		};
		Ok(Self { client_id, kind })
	}
}
