// Copyright 2024 Ulvetanna Inc.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::error::Error;
use crate::network::{read_blob, write_blob};

/// One bundle's worth of query results.
///
/// The receiver routes by `bundle_index`; packages may arrive in any order.
/// `label_cts` holds one ciphertext per label part and is empty for
/// unlabeled databases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultPackage {
	pub bundle_index: u32,
	pub label_byte_count: u32,
	pub nonce_byte_count: u32,
	pub match_ct: Vec<u8>,
	pub label_cts: Vec<Vec<u8>>,
}

impl ResultPackage {
	pub(crate) fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), Error> {
		writer.write_u32::<LittleEndian>(self.bundle_index)?;
		writer.write_u32::<LittleEndian>(self.label_byte_count)?;
		writer.write_u32::<LittleEndian>(self.nonce_byte_count)?;
		write_blob(writer, &self.match_ct)?;
		writer.write_u32::<LittleEndian>(self.label_cts.len() as u32)?;
		for ct in &self.label_cts {
			write_blob(writer, ct)?;
		}
		Ok(())
	}

	pub(crate) fn read_from<R: Read>(reader: &mut R) -> Result<Self, Error> {
		let bundle_index = reader.read_u32::<LittleEndian>()?;
		let label_byte_count = reader.read_u32::<LittleEndian>()?;
		let nonce_byte_count = reader.read_u32::<LittleEndian>()?;
		let match_ct = read_blob(reader)?;
		let label_ct_count = reader.read_u32::<LittleEndian>()? as usize;
		if label_ct_count > 1 << 16 {
			return Err(Error::Protocol("unreasonable label ciphertext count".to_string()));
		}
		let mut label_cts = Vec::with_capacity(label_ct_count);
		for _ in 0..label_ct_count {
			label_cts.push(read_blob(reader)?);
		}
		Ok(Self {
			bundle_index,
			label_byte_count,
			nonce_byte_count,
			match_ct,
			label_cts,
		})
	}
}
