// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Types describing on-chain transactions.

use std::io::Read;

use bitcoin::blockdata::transaction::OutPoint as BitcoinOutPoint;
use bitcoin::hash_types::Txid;

use crate::util::ser::{DecodeError, Readable, Writeable, Writer};

/// A reference to a channel's funding output, used as the primary key for all
/// of the channel's enforcement state. Serialized as the 32-byte funding txid
/// followed by the big-endian 32-bit output index.
#[derive(Hash, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct OutPoint {
	/// The referenced transaction's txid.
	pub txid: Txid,
	/// The index of the referenced output in its transaction's outputs.
	pub index: u32,
}

impl OutPoint {
	/// Converts this OutPoint into the OutPoint field as used by rust-bitcoin
	pub fn into_bitcoin_outpoint(self) -> BitcoinOutPoint {
		BitcoinOutPoint {
			txid: self.txid,
			vout: self.index,
		}
	}
}

impl core::fmt::Display for OutPoint {
	fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
		write!(f, "{}:{}", self.txid, self.index)
	}
}

impl Writeable for OutPoint {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), std::io::Error> {
		self.txid.write(writer)?;
		self.index.write(writer)
	}
}

impl Readable for OutPoint {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		Ok(OutPoint {
			txid: Readable::read(reader)?,
			index: Readable::read(reader)?,
		})
	}
}
