// Copyright 2024 Ulvetanna Inc.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{ErrorKind, Read, Write};

use crate::error::Error;
use crate::network::{
	ResultPackage, SenderOperation, SenderResponse, PROTOCOL_MAGIC, PROTOCOL_VERSION,
};

/// A blocking, framed, bidirectional message channel.
///
/// The dispatcher polls [`Channel::receive_operation`] between requests; an
/// implementation with a read timeout should surface the timeout as
/// `Ok(None)` so the caller can check its stop flag.
pub trait Channel: Send {
	fn send_operation(&mut self, op: &SenderOperation) -> Result<(), Error>;
	fn receive_operation(&mut self) -> Result<Option<SenderOperation>, Error>;
	fn send_response(&mut self, response: &SenderResponse) -> Result<(), Error>;
	fn receive_response(&mut self) -> Result<SenderResponse, Error>;
	fn send_result_package(&mut self, package: &ResultPackage) -> Result<(), Error>;
	fn receive_result_package(&mut self) -> Result<ResultPackage, Error>;
}

/// Channel over any reader/writer pair: a TCP stream, a unix socket, or an
/// in-memory duplex in tests.
pub struct StreamChannel<R, W> {
	reader: R,
	writer: W,
}

impl<R: Read + Send, W: Write + Send> StreamChannel<R, W> {
	pub fn new(reader: R, writer: W) -> Self {
		Self { reader, writer }
	}

	pub fn into_inner(self) -> (R, W) {
		(self.reader, self.writer)
	}

	fn write_header(&mut self) -> Result<(), Error> {
		self.writer.write_u32::<LittleEndian>(PROTOCOL_MAGIC)?;
		self.writer.write_u32::<LittleEndian>(PROTOCOL_VERSION)?;
		Ok(())
	}

	/// Reads and checks a frame header. `Ok(None)` signals a read timeout at
	/// a frame boundary.
	fn read_header(&mut self) -> Result<Option<()>, Error> {
		let magic = match self.reader.read_u32::<LittleEndian>() {
			Ok(magic) => magic,
			Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
				return Ok(None)
			}
			Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Err(Error::Disconnected),
			Err(e) => return Err(e.into()),
		};
		if magic != PROTOCOL_MAGIC {
			return Err(Error::Protocol(format!("bad frame magic {magic:#010x}")));
		}
		let version = self.reader.read_u32::<LittleEndian>()?;
		if version != PROTOCOL_VERSION {
			return Err(Error::Protocol(format!(
				"peer speaks protocol version {version}, this build speaks {PROTOCOL_VERSION}"
			)));
		}
		Ok(Some(()))
	}

	fn read_header_blocking(&mut self) -> Result<(), Error> {
		loop {
			if self.read_header()?.is_some() {
				return Ok(());
			}
		}
	}
}

impl<R: Read + Send, W: Write + Send> Channel for StreamChannel<R, W> {
	fn send_operation(&mut self, op: &SenderOperation) -> Result<(), Error> {
		self.write_header()?;
		op.write_to(&mut self.writer)?;
		self.writer.flush()?;
		Ok(())
	}

	fn receive_operation(&mut self) -> Result<Option<SenderOperation>, Error> {
		if self.read_header()?.is_none() {
			return Ok(None);
		}
		Ok(Some(SenderOperation::read_from(&mut self.reader)?))
	}

	fn send_response(&mut self, response: &SenderResponse) -> Result<(), Error> {
		self.write_header()?;
		response.write_to(&mut self.writer)?;
		self.writer.flush()?;
		Ok(())
	}

	fn receive_response(&mut self) -> Result<SenderResponse, Error> {
		self.read_header_blocking()?;
		SenderResponse::read_from(&mut self.reader)
	}

	fn send_result_package(&mut self, package: &ResultPackage) -> Result<(), Error> {
		self.write_header()?;
		package.write_to(&mut self.writer)?;
		self.writer.flush()?;
		Ok(())
	}

	fn receive_result_package(&mut self) -> Result<ResultPackage, Error> {
		self.read_header_blocking()?;
		ResultPackage::read_from(&mut self.reader)
	}
}
