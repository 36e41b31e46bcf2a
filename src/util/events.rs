// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Events are surfaced by the enforcement engines only for terminal states:
//! everything retriable stays internal and is simply logged. Clients poll
//! [`EventsProvider::get_and_clear_pending_events`] from their main loop to
//! learn that a channel's on-chain story is over.

use bitcoin::hash_types::Txid;

use crate::chain::transaction::OutPoint;

/// An event generated by an enforcement engine which should be surfaced to the
/// node operator.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
	/// The justice transaction punishing a revoked commitment broadcast has
	/// confirmed. All breached funds now pay to the wallet.
	JusticeTransactionConfirmed {
		/// The channel whose revoked commitment was punished.
		channel_point: OutPoint,
		/// The confirmed justice transaction id.
		justice_txid: Txid,
	},
	/// Every time-locked output derived from the channel's close has been
	/// swept and confirmed; no enforcement state remains on disk.
	ChannelFullyResolved {
		/// The channel which has been fully resolved.
		channel_point: OutPoint,
	},
}

/// A trait indicating an object may generate events
pub trait EventsProvider {
	/// Gets the list of pending events which were generated by previous
	/// actions, clearing the list in the process.
	fn get_and_clear_pending_events(&self) -> Vec<Event>;
}
