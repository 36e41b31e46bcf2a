// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Traits which describe the chain-access duties the client must fulfil:
//! getting a current fee estimate and pushing finished transactions out to
//! the network.

use bitcoin::blockdata::transaction::Transaction;

/// An enum that represents the speed at which we want a transaction to
/// confirm used for feerate estimation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ConfirmationTarget {
	/// We are happy with this transaction confirming slowly when feerate drops some.
	Background,
	/// We'd like this transaction to confirm without major delay, i.e., within the next half
	/// dozen blocks. Time-locked nursery sweeps use this target.
	Normal,
	/// We'd like this transaction to confirm in the next couple blocks. Justice transactions
	/// use this target, as every block of delay is a block in which the cheater may escalate.
	HighPriority,
}

/// A trait which should be implemented to provide feerate information on a
/// number of time horizons.
///
/// Note that all of the functions implemented here *must* be reentrant-safe
/// (obviously - they're called from a background thread).
pub trait FeeEstimator: Sync + Send {
	/// Gets estimated satoshis of fee required per 1000 Weight-Units.
	///
	/// Must be no smaller than 253 (ie 1 satoshi-per-byte rounded up to ensure
	/// later round-downs don't put us below 1 satoshi-per-byte).
	fn get_est_sat_per_1000_weight(&self, confirmation_target: ConfirmationTarget) -> u64;
}

/// Minimum relay fee as required by bitcoin network mempool policy: 1
/// satoshi-per-vbyte, rounded up to an integer number of satoshis per 1000
/// weight-units. Sweep feerates are floored here so a low estimate can never
/// produce an unrelayable transaction.
pub const MIN_RELAY_FEE_SAT_PER_1000_WEIGHT: u64 = 253;

/// An error returned when handing a transaction to the chain backend for
/// broadcast.
#[derive(Clone, Debug, PartialEq)]
pub enum BroadcastError {
	/// The transaction spends an output which is already spent by a
	/// conflicting, confirmed or mempool-accepted transaction. For justice
	/// transactions this is the signal that the cheater escalated an HTLC to
	/// the second level; for nursery sweeps it means an earlier attempt won.
	DoubleSpend,
	/// The backend rejected or failed to relay the transaction for any other
	/// reason. The finalized transaction stays on disk and is retried later.
	Rejected(String),
}

/// An interface to send a transaction to the Bitcoin network.
pub trait BroadcasterInterface: Sync + Send {
	/// Sends a transaction out to (hopefully) be mined. The double-spend case
	/// must be reported distinctly: both engines key retry decisions on it.
	fn broadcast_transaction(&self, tx: &Transaction) -> Result<(), BroadcastError>;
}
