// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The sweep planner: turns a set of spendable outputs into one signed
//! transaction paying the wallet.
//!
//! Construction is deterministic given the same inputs, feerate and delivery
//! script; the delivery script is the only nondeterministic element, which is
//! why both engines persist a finalized sweep before its first broadcast and
//! replay those exact bytes on every retry.

use std::cmp;
use std::collections::HashSet;
use std::ops::Deref;

use bitcoin::blockdata::script::Script;
use bitcoin::blockdata::transaction::{OutPoint as BitcoinOutPoint, Transaction, TxIn, TxOut};
use bitcoin::util::sighash::SighashCache;
use bitcoin::{PackedLockTime, Sequence, Witness};

use crate::chain::chaininterface::{ConfirmationTarget, FeeEstimator, MIN_RELAY_FEE_SAT_PER_1000_WEIGHT};
use crate::chain::keysinterface::{KeysInterface, SignDescriptor};
use crate::ln::sweep_utils::{self, expected_witness_weight, BreachedOutput, WitnessType, DUST_LIMIT_SATOSHIS};
use crate::util::logger::Logger;

pub(crate) const MAX_MONEY: u64 = 21_000_000 * 100_000_000;

/// Inputs whose only remaining wait is the transaction itself carry this
/// sequence: high enough to not signal a relative lock, low enough to keep
/// nLockTime enforceable.
pub const SEQUENCE_LOCKTIME_ONLY: Sequence = Sequence(0xFFFF_FFFE);

/// Ways sweep construction can fail. All of them leave persistent state
/// untouched; the sweep is retried at the next block epoch or restart.
#[derive(Clone, Debug, PartialEq)]
pub enum SweepError {
	/// Even the cheapest feerate estimate exceeds the swept value.
	InsufficientFunds,
	/// The net output would be below the dust limit and unrelayable.
	DustOutput,
	/// The transaction skeleton failed its pre-signing sanity check.
	InvalidSkeleton(&'static str),
	/// The signer declined to sign one of the inputs.
	SigningFailed,
}

/// One input of a planned sweep transaction.
#[derive(Clone, Debug, PartialEq)]
pub struct SweepInput {
	/// The output being spent.
	pub outpoint: BitcoinOutPoint,
	/// The output's value in satoshis.
	pub amount: u64,
	/// The script template guarding the output.
	pub witness_type: WitnessType,
	/// The signing material for the output's witness.
	pub sign_desc: SignDescriptor,
	/// Relative time-lock in blocks, placed in the input's sequence when
	/// non-zero.
	pub csv_delay: u32,
	/// Absolute time-lock height, raised into the transaction's nLockTime
	/// when non-zero.
	pub cltv_expiry: u32,
}

impl<'a> From<&'a BreachedOutput> for SweepInput {
	fn from(outp: &'a BreachedOutput) -> SweepInput {
		// Revocation-clause spends carry no time-locks of our own.
		SweepInput {
			outpoint: outp.outpoint,
			amount: outp.amount,
			witness_type: outp.witness_type,
			sign_desc: outp.sign_desc.clone(),
			csv_delay: 0,
			cltv_expiry: 0,
		}
	}
}

fn fallback_targets(conf_target: ConfirmationTarget) -> &'static [ConfirmationTarget] {
	match conf_target {
		ConfirmationTarget::HighPriority => {
			&[ConfirmationTarget::HighPriority, ConfirmationTarget::Normal, ConfirmationTarget::Background]
		},
		ConfirmationTarget::Normal => &[ConfirmationTarget::Normal, ConfirmationTarget::Background],
		ConfirmationTarget::Background => &[ConfirmationTarget::Background],
	}
}

/// Computes the net sweep value after fees at the requested confirmation
/// target, falling back to cheaper targets when the claim balance cannot
/// cover the fee.
fn subtract_sweep_fee<F: Deref, L: Deref>(
	input_amounts: u64, predicted_weight: usize, conf_target: ConfirmationTarget, fee_estimator: &F,
	logger: &L,
) -> Result<u64, SweepError>
where
	F::Target: FeeEstimator,
	L::Target: Logger,
{
	for (attempt, target) in fallback_targets(conf_target).iter().enumerate() {
		let feerate = cmp::max(
			fee_estimator.get_est_sat_per_1000_weight(*target),
			MIN_RELAY_FEE_SAT_PER_1000_WEIGHT,
		);
		let fee = feerate * (predicted_weight as u64) / 1000;
		if input_amounts > fee {
			if attempt > 0 {
				log_warn!(logger, "Used {:?} priority fee for sweep as {:?} priority fee was more than the entire claim balance ({} sat)",
					target, conf_target, input_amounts);
			}
			return Ok(input_amounts - fee);
		}
	}
	log_error!(logger, "Failed to generate sweep as even background fee was more than the entire claim balance ({} sat)",
		input_amounts);
	Err(SweepError::InsufficientFunds)
}

/// Builds the unsigned sweep transaction skeleton: version 2, one delivery
/// output carrying the net value, nLockTime raised to the highest absolute
/// lock among the inputs, and per-input sequences expressing relative locks.
pub fn build_sweep_tx<F: Deref, L: Deref>(
	inputs: &[SweepInput], sweep_script: Script, conf_target: ConfirmationTarget,
	fee_estimator: &F, logger: &L,
) -> Result<Transaction, SweepError>
where
	F::Target: FeeEstimator,
	L::Target: Logger,
{
	if inputs.is_empty() {
		return Err(SweepError::InvalidSkeleton("no inputs to sweep"));
	}

	let mut txins = Vec::with_capacity(inputs.len());
	let mut input_amounts: u64 = 0;
	let mut lock_time: u32 = 0;
	let mut witness_types = Vec::with_capacity(inputs.len());
	for input in inputs.iter() {
		let sequence =
			if input.csv_delay > 0 { Sequence(input.csv_delay) } else { SEQUENCE_LOCKTIME_ONLY };
		if input.cltv_expiry > lock_time {
			lock_time = input.cltv_expiry;
		}
		input_amounts = input_amounts.saturating_add(input.amount);
		witness_types.push(input.witness_type);
		txins.push(TxIn {
			previous_output: input.outpoint,
			script_sig: Script::new(),
			sequence,
			witness: Witness::default(),
		});
	}

	let mut spend_tx = Transaction {
		version: 2,
		lock_time: PackedLockTime(lock_time),
		input: txins,
		output: vec![TxOut {
			script_pubkey: sweep_script,
			value: 0,
		}],
	};

	let predicted_weight = spend_tx.weight() + expected_witness_weight(&witness_types);
	let value = subtract_sweep_fee(input_amounts, predicted_weight, conf_target, fee_estimator, logger)?;
	if value < DUST_LIMIT_SATOSHIS {
		log_error!(logger, "Abandoning sweep of {} sat: net value {} sat after fees is dust",
			input_amounts, value);
		return Err(SweepError::DustOutput);
	}
	spend_tx.output[0].value = value;
	Ok(spend_tx)
}

/// Checks the unsigned skeleton before any witness work: inputs and outputs
/// present, no duplicated prevout, and values in range.
pub(crate) fn check_sweep_sanity(spend_tx: &Transaction) -> Result<(), SweepError> {
	if spend_tx.input.is_empty() {
		return Err(SweepError::InvalidSkeleton("no inputs"));
	}
	if spend_tx.output.is_empty() {
		return Err(SweepError::InvalidSkeleton("no outputs"));
	}
	let mut seen_prevouts = HashSet::with_capacity(spend_tx.input.len());
	for txin in spend_tx.input.iter() {
		if !seen_prevouts.insert(txin.previous_output) {
			return Err(SweepError::InvalidSkeleton("duplicate prevout"));
		}
	}
	let mut total: u64 = 0;
	for txout in spend_tx.output.iter() {
		total = total.saturating_add(txout.value);
		if txout.value > MAX_MONEY || total > MAX_MONEY {
			return Err(SweepError::InvalidSkeleton("output value out of range"));
		}
	}
	Ok(())
}

/// Signs every input of the skeleton, sharing one sighash cache across the
/// transaction. Any single signing failure aborts the whole attempt.
pub fn sign_sweep_tx<KS: Deref>(
	spend_tx: &mut Transaction, inputs: &[SweepInput], keys: &KS,
) -> Result<(), SweepError>
where
	KS::Target: KeysInterface,
{
	if spend_tx.input.len() != inputs.len() {
		return Err(SweepError::InvalidSkeleton("input count mismatch"));
	}
	let witnesses = {
		let mut sighash_cache = SighashCache::new(&*spend_tx);
		let mut stacks = Vec::with_capacity(inputs.len());
		for (idx, input) in inputs.iter().enumerate() {
			match sweep_utils::sweep_witness(&mut sighash_cache, idx, &input.sign_desc, input.witness_type, keys) {
				Ok(stack) => stacks.push(stack),
				Err(()) => return Err(SweepError::SigningFailed),
			}
		}
		stacks
	};
	for (idx, stack) in witnesses.into_iter().enumerate() {
		spend_tx.input[idx].witness = Witness::from_vec(stack);
	}
	Ok(())
}

/// Builds, sanity-checks and signs a sweep over `inputs`, delivering the net
/// value to a fresh wallet script.
pub fn create_sweep_tx<F: Deref, KS: Deref, L: Deref>(
	inputs: &[SweepInput], conf_target: ConfirmationTarget, fee_estimator: &F, keys: &KS, logger: &L,
) -> Result<Transaction, SweepError>
where
	F::Target: FeeEstimator,
	KS::Target: KeysInterface,
	L::Target: Logger,
{
	let sweep_script = keys.get_sweep_script();
	let mut spend_tx = build_sweep_tx(inputs, sweep_script, conf_target, fee_estimator, logger)?;
	check_sweep_sanity(&spend_tx)?;
	sign_sweep_tx(&mut spend_tx, inputs, keys)?;
	log_trace!(logger, "Built sweep transaction {} claiming {} outputs", spend_tx.txid(), inputs.len());
	Ok(spend_tx)
}
