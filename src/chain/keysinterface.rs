// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! keysinterface provides the wallet-facing contract the sweep planner needs:
//! a fresh delivery script for swept funds, and a signer which can produce a
//! signature for any single sweep input given its serialized sign descriptor.

use std::io::Read;
use std::ops::Deref;

use bitcoin::blockdata::script::Script;
use bitcoin::blockdata::transaction::{Transaction, TxOut};
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::SecretKey;
use bitcoin::util::sighash::SighashCache;
use bitcoin::EcdsaSighashType;

use crate::util::ser::{DecodeError, Readable, Writeable, Writer};

/// The information required to produce exactly one sweep input's signature,
/// persisted alongside the output it spends so that the witness can be
/// re-derived from disk after any restart.
///
/// The key material is referenced, never embedded: `pubkey` identifies the
/// base key to the signer, and the optional tweaks tell it how to transform
/// that key before signing. The descriptor round-trips losslessly through its
/// serialized form.
#[derive(Clone, Debug, PartialEq)]
pub struct SignDescriptor {
	/// The public key the produced signature must verify against (and which
	/// witness assembly pushes on the stack where the script calls for a
	/// key). The signer locates the corresponding secret, applying the
	/// tweaks below if present.
	pub pubkey: bitcoin::secp256k1::PublicKey,
	/// If present, an additive tweak applied to the signing key: commitment
	/// outputs tie their keys to the commitment's per-commitment point this
	/// way.
	pub single_tweak: Option<[u8; 32]>,
	/// If present, the per-commitment secret used to derive the revocation
	/// signing key. Only set for outputs swept via the revocation clause.
	pub double_tweak: Option<SecretKey>,
	/// The script whose hash the output commits to, fed into the BIP143
	/// sighash and placed last on the witness stack.
	pub witness_script: Script,
	/// The output being spent, carrying the value committed to by the
	/// signature.
	pub output: TxOut,
	/// The sighash flag to sign with (and append to the signature).
	pub sighash: EcdsaSighashType,
}

impl Writeable for SignDescriptor {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), std::io::Error> {
		self.pubkey.write(writer)?;
		self.single_tweak.write(writer)?;
		self.double_tweak.write(writer)?;
		self.witness_script.write(writer)?;
		self.output.write(writer)?;
		self.sighash.write(writer)
	}
}

impl Readable for SignDescriptor {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		Ok(SignDescriptor {
			pubkey: Readable::read(reader)?,
			single_tweak: Readable::read(reader)?,
			double_tweak: Readable::read(reader)?,
			witness_script: Readable::read(reader)?,
			output: Readable::read(reader)?,
			sighash: Readable::read(reader)?,
		})
	}
}

/// A trait to describe a wallet which can sign sweep inputs and hand out
/// delivery scripts for swept funds.
///
/// Signing services could be implemented on a hardware wallet: the descriptor
/// carries everything needed to recompute the sighash and locate the key, so
/// no channel state beyond the descriptor needs to live near the keys.
pub trait KeysInterface: Sync + Send {
	/// Gets a fresh script to which swept funds should be sent. Drawn anew for
	/// every sweep transaction built; this is the single nondeterministic
	/// input to sweep construction, which is why finalized transactions are
	/// persisted before broadcast rather than rebuilt.
	fn get_sweep_script(&self) -> Script;

	/// Signs the given input of the passed transaction as described by
	/// `sign_desc`, using the sighash cache shared across all of the
	/// transaction's inputs. Returns the raw signature; witness assembly is
	/// the caller's job as it depends on the output's witness type.
	fn sign_sweep_input<T: Deref<Target = Transaction>>(
		&self, sighash_cache: &mut SighashCache<T>, input_index: usize, sign_desc: &SignDescriptor,
	) -> Result<Signature, ()>;
}
