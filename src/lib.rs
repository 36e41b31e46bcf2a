// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! On-chain contract enforcement for Lightning channels.
//!
//! Once a channel has been force-closed, every output we are owed sits on the
//! chain behind some combination of time-locks and revocation clauses. This
//! crate takes custody of those outputs and drives each one through whatever
//! chain interactions are required to move its value back into the wallet:
//!
//! * [`ln::retribution::RetributionEngine`] reacts to a counterparty
//!   broadcasting a revoked commitment by sweeping every output of that
//!   commitment with a single justice transaction.
//! * [`ln::nursery::UtxoNursery`] incubates CSV- and CLTV-encumbered outputs
//!   of a regular force-close, advancing them through a persistent state
//!   machine clocked by block arrivals until they are swept.
//!
//! Chain access, disk storage, fee estimation and key custody are all
//! consumed through traits in [`chain`] and [`ln::store`]; clients are
//! expected to implement them against their own node backend.

#![deny(missing_docs)]
#![deny(unsafe_code)]

extern crate bitcoin;
#[cfg(test)]
extern crate hex;

#[macro_use]
pub mod util;
pub mod chain;
pub mod ln;
