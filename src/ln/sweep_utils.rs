// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Utilities for describing sweepable outputs: which script template guards
//! each one, what its witness will weigh, and how to assemble that witness
//! once a signature is in hand.

use std::io::Read;
use std::ops::Deref;

use bitcoin::blockdata::transaction::{OutPoint as BitcoinOutPoint, Transaction};
use bitcoin::util::sighash::SighashCache;

use crate::chain::keysinterface::{KeysInterface, SignDescriptor};
use crate::util::ser::{DecodeError, Readable, Writeable, Writer};

/// Outputs below this value cannot be swept economically nor relayed by
/// default mempool policy.
pub const DUST_LIMIT_SATOSHIS: u64 = 546;

/// A closed enumeration of every output template the engines know how to
/// sweep. The type determines the spend script shape, the witness weight
/// contribution, and the witness assembly recipe; every dispatch over it is
/// an exhaustive match so that adding a variant breaks each site at compile
/// time.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum WitnessType {
	/// Our unencumbered output on the remote party's commitment transaction.
	CommitmentNoDelay,
	/// Our CSV-delayed output on our own commitment transaction.
	CommitmentTimeLock,
	/// The remote party's output on their revoked commitment, swept via the
	/// revocation clause.
	CommitmentRevoke,
	/// An HTLC we had offered, on a revoked commitment, swept via the
	/// revocation clause.
	HtlcOfferedRevoke,
	/// An HTLC offered to us, on a revoked commitment, swept via the
	/// revocation clause.
	HtlcAcceptedRevoke,
	/// The output of a second-level HTLC transaction the cheater managed to
	/// confirm, still sweepable via the revocation clause.
	HtlcSecondLevelRevoke,
	/// The CSV-locked output of our own second-level HTLC-timeout
	/// transaction.
	HtlcOfferedTimeoutSecondLevel,
	/// The CSV-locked output of our own second-level HTLC-success
	/// transaction.
	HtlcAcceptedSuccessSecondLevel,
	/// An HTLC we offered, on the remote party's commitment, sweepable
	/// directly once its absolute timeout passes.
	HtlcOfferedRemoteTimeout,
}

impl WitnessType {
	/// Whether this output settles an HTLC (as opposed to a party's
	/// commitment balance).
	pub fn is_htlc(&self) -> bool {
		match self {
			&WitnessType::CommitmentNoDelay |
			&WitnessType::CommitmentTimeLock |
			&WitnessType::CommitmentRevoke => false,
			&WitnessType::HtlcOfferedRevoke |
			&WitnessType::HtlcAcceptedRevoke |
			&WitnessType::HtlcSecondLevelRevoke |
			&WitnessType::HtlcOfferedTimeoutSecondLevel |
			&WitnessType::HtlcAcceptedSuccessSecondLevel |
			&WitnessType::HtlcOfferedRemoteTimeout => true,
		}
	}
}

impl Writeable for WitnessType {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), std::io::Error> {
		let tag: u16 = match self {
			&WitnessType::CommitmentNoDelay => 0,
			&WitnessType::CommitmentTimeLock => 1,
			&WitnessType::CommitmentRevoke => 2,
			&WitnessType::HtlcOfferedRevoke => 3,
			&WitnessType::HtlcAcceptedRevoke => 4,
			&WitnessType::HtlcSecondLevelRevoke => 5,
			&WitnessType::HtlcOfferedTimeoutSecondLevel => 6,
			&WitnessType::HtlcAcceptedSuccessSecondLevel => 7,
			&WitnessType::HtlcOfferedRemoteTimeout => 8,
		};
		tag.write(writer)
	}
}

impl Readable for WitnessType {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		let witness_type = match <u16 as Readable>::read(reader)? {
			0 => WitnessType::CommitmentNoDelay,
			1 => WitnessType::CommitmentTimeLock,
			2 => WitnessType::CommitmentRevoke,
			3 => WitnessType::HtlcOfferedRevoke,
			4 => WitnessType::HtlcAcceptedRevoke,
			5 => WitnessType::HtlcSecondLevelRevoke,
			6 => WitnessType::HtlcOfferedTimeoutSecondLevel,
			7 => WitnessType::HtlcAcceptedSuccessSecondLevel,
			8 => WitnessType::HtlcOfferedRemoteTimeout,
			_ => return Err(DecodeError::InvalidValue),
		};
		Ok(witness_type)
	}
}

/// Expected witness weight for a set of inputs, summed from per-type maxima.
/// We use expected weight (and not actual) as signatures and time lock delays
/// may vary.
pub fn expected_witness_weight(inputs: &[WitnessType]) -> usize {
	let mut tx_weight = 2; // count segwit flags
	for inp in inputs {
		tx_weight += match inp {
			// number_of_witness_elements + sig_length + sig + pubkey_length + pubkey
			&WitnessType::CommitmentNoDelay => {
				1 + 1 + 73 + 1 + 33
			},
			// number_of_witness_elements + sig_length + sig + empty_vector + witness_script_length + witness_script
			&WitnessType::CommitmentTimeLock => {
				1 + 1 + 73 + 1 + 1 + 77
			},
			// number_of_witness_elements + sig_length + revocation_sig + true_length + op_true + witness_script_length + witness_script
			&WitnessType::CommitmentRevoke => {
				1 + 1 + 73 + 1 + 1 + 1 + 77
			},
			// number_of_witness_elements + sig_length + revocation_sig + pubkey_length + revocationpubkey + witness_script_length + witness_script
			&WitnessType::HtlcOfferedRevoke => {
				1 + 1 + 73 + 1 + 33 + 1 + 133
			},
			// number_of_witness_elements + sig_length + revocation_sig + pubkey_length + revocationpubkey + witness_script_length + witness_script
			&WitnessType::HtlcAcceptedRevoke => {
				1 + 1 + 73 + 1 + 33 + 1 + 139
			},
			// number_of_witness_elements + sig_length + revocation_sig + true_length + op_true + witness_script_length + witness_script
			&WitnessType::HtlcSecondLevelRevoke => {
				1 + 1 + 73 + 1 + 1 + 1 + 77
			},
			// number_of_witness_elements + sig_length + sig + empty_vector + witness_script_length + witness_script
			&WitnessType::HtlcOfferedTimeoutSecondLevel |
			&WitnessType::HtlcAcceptedSuccessSecondLevel => {
				1 + 1 + 73 + 1 + 1 + 77
			},
			// number_of_witness_elements + sig_length + sig + empty_vector + witness_script_length + witness_script
			&WitnessType::HtlcOfferedRemoteTimeout => {
				1 + 1 + 73 + 1 + 1 + 133
			},
		};
	}
	tx_weight
}

/// A single sweepable output of a revoked commitment transaction, carrying
/// everything required to re-derive its witness from disk.
#[derive(Clone, Debug, PartialEq)]
pub struct BreachedOutput {
	/// The output's value in satoshis.
	pub amount: u64,
	/// The output being swept.
	pub outpoint: BitcoinOutPoint,
	/// The script template guarding the output.
	pub witness_type: WitnessType,
	/// The signing material for the output's witness.
	pub sign_desc: SignDescriptor,
	/// For HTLC outputs, the witness script of the second-level transaction
	/// the cheater could escalate to, pre-derived at breach time so the
	/// justice transaction can chase the escalation.
	pub second_level_witness_script: Option<bitcoin::Script>,
}

impl BreachedOutput {
	/// Retargets this output at the cheater's confirmed second-level
	/// transaction: the revocation clause of the second-level output is
	/// still ours to use. Returns false if the spending transaction has no
	/// output or no second-level script was stored, in which case the output
	/// is left untouched.
	pub fn switch_to_second_level(&mut self, spending_tx: &Transaction) -> bool {
		let spender_output = match spending_tx.output.get(0) {
			Some(output) => output.clone(),
			None => return false,
		};
		let second_level_script = match self.second_level_witness_script {
			Some(ref script) => script.clone(),
			None => return false,
		};
		self.outpoint = BitcoinOutPoint {
			txid: spending_tx.txid(),
			vout: 0,
		};
		self.amount = spender_output.value;
		self.witness_type = WitnessType::HtlcSecondLevelRevoke;
		self.sign_desc.witness_script = second_level_script;
		self.sign_desc.output = spender_output;
		true
	}
}

impl Writeable for BreachedOutput {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), std::io::Error> {
		self.amount.write(writer)?;
		self.outpoint.write(writer)?;
		self.sign_desc.write(writer)?;
		match self.second_level_witness_script {
			Some(ref script) => script.write(writer)?,
			None => 0u16.write(writer)?,
		}
		self.witness_type.write(writer)
	}
}

impl Readable for BreachedOutput {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		let amount = Readable::read(reader)?;
		let outpoint = Readable::read(reader)?;
		let sign_desc = Readable::read(reader)?;
		let second_level_script: bitcoin::Script = Readable::read(reader)?;
		if second_level_script.len() > 1000 {
			return Err(DecodeError::BadLengthDescriptor);
		}
		let second_level_witness_script =
			if second_level_script.is_empty() { None } else { Some(second_level_script) };
		let witness_type = Readable::read(reader)?;
		Ok(BreachedOutput {
			amount,
			outpoint,
			witness_type,
			sign_desc,
			second_level_witness_script,
		})
	}
}

/// Produces the full witness stack for one sweep input: a signature from the
/// signer, then the per-template control elements, then the witness script.
pub(crate) fn sweep_witness<T: Deref<Target = Transaction>, KS: Deref>(
	sighash_cache: &mut SighashCache<T>, input_index: usize, sign_desc: &SignDescriptor,
	witness_type: WitnessType, keys: &KS,
) -> Result<Vec<Vec<u8>>, ()>
where
	KS::Target: KeysInterface,
{
	let sig = keys.sign_sweep_input(sighash_cache, input_index, sign_desc)?;
	let mut sig_ser = sig.serialize_der().to_vec();
	sig_ser.push(sign_desc.sighash.to_u32() as u8);

	let mut witness = Vec::with_capacity(3);
	witness.push(sig_ser);
	match witness_type {
		WitnessType::CommitmentNoDelay => {
			witness.push(sign_desc.pubkey.serialize().to_vec());
		},
		WitnessType::CommitmentTimeLock |
		WitnessType::HtlcOfferedTimeoutSecondLevel |
		WitnessType::HtlcAcceptedSuccessSecondLevel => {
			// Empty push selects the delayed (non-revocation) script branch.
			witness.push(vec![]);
			witness.push(sign_desc.witness_script.clone().into_bytes());
		},
		WitnessType::CommitmentRevoke | WitnessType::HtlcSecondLevelRevoke => {
			witness.push(vec![1]);
			witness.push(sign_desc.witness_script.clone().into_bytes());
		},
		WitnessType::HtlcOfferedRevoke | WitnessType::HtlcAcceptedRevoke => {
			witness.push(sign_desc.pubkey.serialize().to_vec());
			witness.push(sign_desc.witness_script.clone().into_bytes());
		},
		WitnessType::HtlcOfferedRemoteTimeout => {
			// Due to BIP146 (MINIMALIF) this must be a zero-length element to relay.
			witness.push(vec![]);
			witness.push(sign_desc.witness_script.clone().into_bytes());
		},
	}
	Ok(witness)
}
