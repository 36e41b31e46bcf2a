// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! A very simple serialization framework which is used to persist enforcement
//! state to disk. All multi-byte integers are written big-endian; collection
//! counts use Bitcoin's CompactSize varint. Every field is mandatory and
//! missing trailing bytes are a decode error.

use std::io::{self, Read};

use bitcoin::blockdata::script::Script;
use bitcoin::blockdata::transaction::{OutPoint, Transaction, TxOut};
use bitcoin::consensus::encode::{self, Decodable, Encodable, VarInt};
use bitcoin::hash_types::{BlockHash, Txid};
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{PublicKey, SecretKey};
use bitcoin::EcdsaSighashType;

use crate::util::byte_utils;

pub(crate) const MAX_ALLOC_SIZE: usize = 64 * 1024;

/// An error in decoding a message or struct.
#[derive(Debug)]
pub enum DecodeError {
	/// A length descriptor in the packet didn't describe the later data correctly
	BadLengthDescriptor,
	/// A value was invalid (eg an unknown enum discriminant)
	InvalidValue,
	/// Buffer ended mid-object
	ShortRead,
	/// An underlying I/O error while reading
	Io(io::Error),
}

impl From<io::Error> for DecodeError {
	fn from(e: io::Error) -> Self {
		if e.kind() == io::ErrorKind::UnexpectedEof {
			DecodeError::ShortRead
		} else {
			DecodeError::Io(e)
		}
	}
}

/// A sink into which objects serialize themselves.
pub trait Writer {
	/// Writes the given buf out. See std::io::Write::write_all for more
	fn write_all(&mut self, buf: &[u8]) -> Result<(), io::Error>;
}

/// A Writer which collects the serialized bytes into a Vec.
pub struct VecWriter(pub Vec<u8>);
impl Writer for VecWriter {
	fn write_all(&mut self, buf: &[u8]) -> Result<(), io::Error> {
		self.0.extend_from_slice(buf);
		Ok(())
	}
}

pub(crate) struct WriterWriteAdaptor<'a, W: Writer + 'a>(pub &'a mut W);
impl<'a, W: Writer + 'a> io::Write for WriterWriteAdaptor<'a, W> {
	fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
		self.0.write_all(buf)?;
		Ok(buf.len())
	}
	fn write_all(&mut self, buf: &[u8]) -> Result<(), io::Error> {
		self.0.write_all(buf)
	}
	fn flush(&mut self) -> Result<(), io::Error> {
		Ok(())
	}
}

/// A trait that various enforcement types implement allowing them to be written
/// out to a Writer.
pub trait Writeable {
	/// Writes self out to the given Writer
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error>;

	/// Writes self out to a Vec<u8>
	fn encode(&self) -> Vec<u8> {
		let mut msg = VecWriter(Vec::new());
		self.write(&mut msg).unwrap();
		msg.0
	}
}

/// A trait that various enforcement types implement allowing them to be read in
/// from a Read.
pub trait Readable
where
	Self: Sized,
{
	/// Reads a Self in from the given Read
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError>;
}

impl Writeable for u8 {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		writer.write_all(&[*self])
	}
}
impl Readable for u8 {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		let mut buf = [0; 1];
		reader.read_exact(&mut buf)?;
		Ok(buf[0])
	}
}

impl Writeable for u16 {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		writer.write_all(&byte_utils::be16_to_array(*self))
	}
}
impl Readable for u16 {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		let mut buf = [0; 2];
		reader.read_exact(&mut buf)?;
		Ok(byte_utils::slice_to_be16(&buf))
	}
}

impl Writeable for u32 {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		writer.write_all(&byte_utils::be32_to_array(*self))
	}
}
impl Readable for u32 {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		let mut buf = [0; 4];
		reader.read_exact(&mut buf)?;
		Ok(byte_utils::slice_to_be32(&buf))
	}
}

impl Writeable for u64 {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		writer.write_all(&byte_utils::be64_to_array(*self))
	}
}
impl Readable for u64 {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		let mut buf = [0; 8];
		reader.read_exact(&mut buf)?;
		Ok(byte_utils::slice_to_be64(&buf))
	}
}

impl Writeable for bool {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		writer.write_all(&[if *self { 1 } else { 0 }])
	}
}
impl Readable for bool {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		match <u8 as Readable>::read(reader)? {
			0 => Ok(false),
			1 => Ok(true),
			_ => Err(DecodeError::InvalidValue),
		}
	}
}

impl Writeable for [u8; 32] {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		writer.write_all(self)
	}
}
impl Readable for [u8; 32] {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		let mut buf = [0; 32];
		reader.read_exact(&mut buf)?;
		Ok(buf)
	}
}

impl<T: Writeable> Writeable for Option<T> {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		match self {
			&Some(ref data) => {
				1u8.write(writer)?;
				data.write(writer)?;
			},
			&None => 0u8.write(writer)?,
		}
		Ok(())
	}
}
impl<T: Readable> Readable for Option<T> {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		match <u8 as Readable>::read(reader)? {
			0 => Ok(None),
			1 => Ok(Some(Readable::read(reader)?)),
			_ => Err(DecodeError::InvalidValue),
		}
	}
}

impl Writeable for Txid {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		writer.write_all(&self[..])
	}
}
impl Readable for Txid {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		let buf: [u8; 32] = Readable::read(reader)?;
		Ok(Txid::from_slice(&buf[..]).unwrap())
	}
}

impl Writeable for BlockHash {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		writer.write_all(&self[..])
	}
}
impl Readable for BlockHash {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		let buf: [u8; 32] = Readable::read(reader)?;
		Ok(BlockHash::from_slice(&buf[..]).unwrap())
	}
}

impl Writeable for PublicKey {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		writer.write_all(&self.serialize())
	}
}
impl Readable for PublicKey {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		let mut buf = [0; 33];
		reader.read_exact(&mut buf)?;
		PublicKey::from_slice(&buf).map_err(|_| DecodeError::InvalidValue)
	}
}

impl Writeable for SecretKey {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		writer.write_all(&self.secret_bytes())
	}
}
impl Readable for SecretKey {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		let buf: [u8; 32] = Readable::read(reader)?;
		SecretKey::from_slice(&buf).map_err(|_| DecodeError::InvalidValue)
	}
}

impl Writeable for Script {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		(self.len() as u16).write(writer)?;
		writer.write_all(self.as_bytes())
	}
}
impl Readable for Script {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		let len = <u16 as Readable>::read(reader)? as usize;
		let mut buf = vec![0; len];
		reader.read_exact(&mut buf)?;
		Ok(Script::from(buf))
	}
}

impl Writeable for TxOut {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		self.value.write(writer)?;
		self.script_pubkey.write(writer)
	}
}
impl Readable for TxOut {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		Ok(TxOut {
			value: Readable::read(reader)?,
			script_pubkey: Readable::read(reader)?,
		})
	}
}

impl Writeable for OutPoint {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		self.txid.write(writer)?;
		self.vout.write(writer)
	}
}
impl Readable for OutPoint {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		Ok(OutPoint {
			txid: Readable::read(reader)?,
			vout: Readable::read(reader)?,
		})
	}
}

impl Writeable for Transaction {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		self.consensus_encode(&mut WriterWriteAdaptor(writer))?;
		Ok(())
	}
}
impl Readable for Transaction {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		match Transaction::consensus_decode(reader) {
			Ok(tx) => Ok(tx),
			Err(encode::Error::Io(e)) => Err(e.into()),
			Err(_) => Err(DecodeError::InvalidValue),
		}
	}
}

impl Writeable for VarInt {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		self.consensus_encode(&mut WriterWriteAdaptor(writer))?;
		Ok(())
	}
}
impl Readable for VarInt {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		match VarInt::consensus_decode(reader) {
			Ok(v) => Ok(v),
			Err(encode::Error::Io(e)) => Err(e.into()),
			Err(_) => Err(DecodeError::InvalidValue),
		}
	}
}

impl Writeable for EcdsaSighashType {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		(self.to_u32() as u8).write(writer)
	}
}
impl Readable for EcdsaSighashType {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		let flag = <u8 as Readable>::read(reader)?;
		EcdsaSighashType::from_standard(flag as u32).map_err(|_| DecodeError::InvalidValue)
	}
}
