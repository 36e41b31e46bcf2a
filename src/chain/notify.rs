// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Subscription contracts through which the engines learn about chain
//! activity: transaction confirmations, outpoint spends, and new blocks.
//!
//! Each registration returns a watch owning the receiving half of a channel.
//! The notifier delivers at most one value per confirmation/spend watch and
//! may close the channel instead on shutdown; a closed channel always means
//! "the caller is exiting" and the waiting task must return without advancing
//! state. Dropping a watch cancels the underlying subscription.
//!
//! Height hints let the notifier prune its rescan range. A hint must never
//! exceed the watched event's actual inclusion height, or the notifier may
//! skip right past it.

use std::sync::mpsc::{Receiver, TryRecvError};

use bitcoin::blockdata::transaction::{OutPoint as BitcoinOutPoint, Transaction};
use bitcoin::hash_types::Txid;

/// Delivered once a watched transaction has accumulated the requested number
/// of confirmations.
#[derive(Clone, Debug)]
pub struct TxConfirmation {
	/// The height of the block which included the transaction.
	pub height: u32,
	/// The confirmed transaction.
	pub tx: Transaction,
}

/// Delivered when a watched outpoint is spent by some transaction.
#[derive(Clone, Debug)]
pub struct SpendDetail {
	/// The outpoint which was spent.
	pub spent_outpoint: BitcoinOutPoint,
	/// The transaction spending the watched outpoint.
	pub spending_tx: Transaction,
	/// The height at which the spending transaction was included, or the
	/// current best height if it was only seen in the mempool.
	pub spending_height: u32,
}

/// An active confirmation subscription. Dropping it cancels the subscription.
pub struct ConfirmationWatch {
	/// Delivers at most one confirmation, or closes on shutdown/cancel.
	pub events: Receiver<TxConfirmation>,
}

/// An active spend subscription. Dropping it cancels the subscription.
pub struct SpendWatch {
	/// Delivers at most one spend, or closes on shutdown/cancel.
	pub events: Receiver<SpendDetail>,
}

impl SpendWatch {
	/// Non-blocking poll, used from the retribution engine's second-level
	/// check loop where waiting is not an option. Returns None both when no
	/// spend has been seen yet and when the notifier has shut down.
	pub fn poll(&self) -> Option<SpendDetail> {
		match self.events.try_recv() {
			Ok(detail) => Some(detail),
			Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
		}
	}
}

/// An active block-epoch subscription. Dropping it cancels the subscription.
pub struct BlockEpochWatch {
	/// Delivers the height of each newly connected block, in order, until
	/// closed on shutdown.
	pub heights: Receiver<u32>,
}

/// The chain-event source both engines subscribe to. Implemented by the
/// client against its chain backend; must tolerate subscriptions for events
/// which already happened (the hint tells it where to begin rescanning).
pub trait ChainNotifier: Sync + Send {
	/// Registers interest in `txid` reaching `num_confs` confirmations.
	/// `height_hint` is a lower bound on the inclusion height.
	fn register_confirmation(&self, txid: Txid, num_confs: u32, height_hint: u32) -> ConfirmationWatch;

	/// Registers interest in any transaction spending `outpoint`.
	/// `height_hint` is a lower bound on the spend height.
	fn register_spend(&self, outpoint: BitcoinOutPoint, height_hint: u32) -> SpendWatch;

	/// Registers interest in every newly connected block.
	fn register_block_epochs(&self) -> BlockEpochWatch;

	/// The current best chain height.
	fn best_block_height(&self) -> u32;
}
