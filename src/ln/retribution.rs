// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The retribution engine: punishes a counterparty which broadcast a revoked
//! commitment transaction by sweeping every output of that commitment with a
//! single justice transaction.
//!
//! A breach event is persisted before it is acknowledged, so the producer can
//! safely forget its own state once the ack arrives. From there the workflow
//! is: wait for the breach transaction to confirm, watch each HTLC output for
//! a second-level escalation by the cheater, build and persist the justice
//! transaction, broadcast it, and on a double-spend re-poll the escalation
//! watches and rebuild. Every broadcast retry after a finalize uses the exact
//! bytes written to disk, so the confirmation subscription stays valid across
//! restarts.
//!
//! There is no unwind if a justice transaction is reorged out after its
//! confirmation was acted upon; re-registration by the notifier is the only
//! reorg defense.

use std::collections::HashSet;
use std::io::Read;
use std::ops::Deref;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bitcoin::blockdata::transaction::Transaction;
use bitcoin::consensus::encode::VarInt;
use bitcoin::hash_types::{BlockHash, Txid};

use crate::chain::chaininterface::{BroadcastError, BroadcasterInterface, ConfirmationTarget, FeeEstimator};
use crate::chain::keysinterface::KeysInterface;
use crate::chain::notify::{ChainNotifier, SpendWatch};
use crate::chain::transaction::OutPoint;
use crate::ln::channels::{ChannelRegistry, LinkCloseReason, LinkController};
use crate::ln::store::{KVStore, RetributionStore, StoreError};
use crate::ln::sweep_utils::BreachedOutput;
use crate::ln::sweeper::{self, SweepInput};
use crate::util::events::{Event, EventsProvider};
use crate::util::logger::Logger;
use crate::util::ser::{DecodeError, Readable, Writeable, Writer, MAX_ALLOC_SIZE};
use crate::util::shutdown::ShutdownSignal;

/// How long to back off before re-polling the escalation watches after a
/// double-spent broadcast for which no escalation has surfaced yet.
const ESCALATION_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Everything needed to punish one revoked commitment, persisted before the
/// originating breach event is acknowledged.
#[derive(Clone, Debug, PartialEq)]
pub struct RetributionRecord {
	/// The txid of the revoked commitment transaction the cheater broadcast.
	pub commitment_txid: Txid,
	/// The breached channel.
	pub channel_point: OutPoint,
	/// The chain the breach happened on.
	pub chain_hash: BlockHash,
	/// The height at which the breach was observed; used as the notifier's
	/// rescan hint.
	pub breach_height: u32,
	/// Every sweepable output of the revoked commitment, ordered local
	/// commitment output (if non-dust), remote commitment output (if
	/// non-dust), then HTLC outputs.
	pub outputs: Vec<BreachedOutput>,
}

impl Writeable for RetributionRecord {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), std::io::Error> {
		self.commitment_txid.write(writer)?;
		self.channel_point.write(writer)?;
		self.chain_hash.write(writer)?;
		self.breach_height.write(writer)?;
		VarInt(self.outputs.len() as u64).write(writer)?;
		for outp in self.outputs.iter() {
			outp.write(writer)?;
		}
		Ok(())
	}
}

impl Readable for RetributionRecord {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		let commitment_txid = Readable::read(reader)?;
		let channel_point = Readable::read(reader)?;
		let chain_hash = Readable::read(reader)?;
		let breach_height = Readable::read(reader)?;
		let outputs_count = <VarInt as Readable>::read(reader)?.0;
		let mut outputs = Vec::with_capacity(std::cmp::min(outputs_count as usize, MAX_ALLOC_SIZE / 128));
		for _ in 0..outputs_count {
			outputs.push(Readable::read(reader)?);
		}
		Ok(RetributionRecord {
			commitment_txid,
			channel_point,
			chain_hash,
			breach_height,
			outputs,
		})
	}
}

/// A breach handoff from the contract observer. The producer must block on
/// `ack` and only release its own state once the engine reports durability.
pub struct BreachEvent {
	/// The breached channel.
	pub channel_point: OutPoint,
	/// The txid of the revoked commitment the cheater broadcast.
	pub commitment_txid: Txid,
	/// The chain the breach happened on.
	pub chain_hash: BlockHash,
	/// The height at which the breach was observed.
	pub breach_height: u32,
	/// The reconstructed sweepable outputs of the revoked commitment.
	pub breached_outputs: Vec<BreachedOutput>,
	/// Acknowledged with Ok once the retribution record is durable, or the
	/// store error which prevented that.
	pub ack: Sender<Result<(), StoreError>>,
}

/// The breach arbiter. One instance watches all channels; each breach runs
/// its retribution workflow on its own task, sharing only the engine lock
/// and the store.
pub struct RetributionEngine<K: Deref, N: Deref, T: Deref, F: Deref, KS: Deref, C: Deref, X: Deref, L: Deref>
where
	K::Target: KVStore,
	N::Target: ChainNotifier,
	T::Target: BroadcasterInterface,
	F::Target: FeeEstimator,
	KS::Target: KeysInterface,
	C::Target: ChannelRegistry,
	X::Target: LinkController,
	L::Target: Logger,
{
	store: RetributionStore<K>,
	notifier: N,
	broadcaster: T,
	fee_estimator: F,
	keys: KS,
	channels: C,
	switch: X,
	shutdown: ShutdownSignal,
	breached_channels: Mutex<HashSet<OutPoint>>,
	pending_events: Mutex<Vec<Event>>,
	logger: L,
}

impl<K, N, T, F, KS, C, X, L> RetributionEngine<K, N, T, F, KS, C, X, L>
where
	K: Deref + Send + Sync + 'static,
	N: Deref + Send + Sync + 'static,
	T: Deref + Send + Sync + 'static,
	F: Deref + Send + Sync + 'static,
	KS: Deref + Send + Sync + 'static,
	C: Deref + Send + Sync + 'static,
	X: Deref + Send + Sync + 'static,
	L: Deref + Send + Sync + 'static,
	K::Target: KVStore,
	N::Target: ChainNotifier,
	T::Target: BroadcasterInterface,
	F::Target: FeeEstimator,
	KS::Target: KeysInterface,
	C::Target: ChannelRegistry,
	X::Target: LinkController,
	L::Target: Logger,
{
	/// Creates a new engine over the given collaborators. Call
	/// [`RetributionEngine::start`] afterwards to resume any persisted
	/// retribution.
	pub fn new(
		db: K, notifier: N, broadcaster: T, fee_estimator: F, keys: KS, channels: C, switch: X,
		shutdown: ShutdownSignal, logger: L,
	) -> Self {
		RetributionEngine {
			store: RetributionStore::new(db),
			notifier,
			broadcaster,
			fee_estimator,
			keys,
			channels,
			switch,
			shutdown,
			breached_channels: Mutex::new(HashSet::new()),
			pending_events: Mutex::new(Vec::new()),
			logger,
		}
	}

	/// Loads every persisted retribution record and resumes its workflow.
	/// Records for channels the registry already knows to be fully closed
	/// (justice confirmed on a prior run) are removed without action.
	pub fn start(this: &Arc<Self>) -> Result<(), StoreError> {
		let fully_closed: HashSet<OutPoint> = this
			.channels
			.fetch_closed_channels(false)?
			.into_iter()
			.filter(|summary| !summary.is_pending)
			.map(|summary| summary.channel_point)
			.collect();

		let mut records = Vec::new();
		this.store.for_all_retributions(|loaded| {
			match loaded {
				Ok(record) => records.push(record),
				Err(e) => {
					log_error!(this.logger, "Skipping undecodable retribution record ({:?}); manual intervention required", e);
				},
			}
			Ok(())
		})?;

		for record in records {
			if fully_closed.contains(&record.channel_point) {
				log_info!(this.logger, "Justice for channel {} already served on a previous run, cleaning up", record.channel_point);
				this.store.remove_retribution(&record.channel_point)?;
				continue;
			}
			this.breached_channels.lock().unwrap().insert(record.channel_point);
			let engine = Arc::clone(this);
			thread::spawn(move || engine.exact_retribution(record));
		}
		Ok(())
	}

	/// Consumes breach events from the contract observer until the channel
	/// closes or shutdown is signalled.
	pub fn watch_breaches(this: &Arc<Self>, events: Receiver<BreachEvent>) {
		let engine = Arc::clone(this);
		thread::spawn(move || loop {
			if engine.shutdown.is_triggered() {
				return;
			}
			match events.recv() {
				Ok(event) => Self::handle_breach(&engine, event),
				Err(_) => return,
			}
		});
	}

	/// The breach handoff: closes the channel's forwarding link, persists the
	/// retribution record, and acknowledges the event. Idempotent per
	/// channel; a replayed event is acknowledged successfully without a
	/// second record. The follow-up workflow runs on its own task.
	pub fn handle_breach(this: &Arc<Self>, event: BreachEvent) {
		let BreachEvent { channel_point, commitment_txid, chain_hash, breach_height, breached_outputs, ack } = event;

		let mut breached = this.breached_channels.lock().unwrap();
		this.switch.close_link(&channel_point, LinkCloseReason::Breach);

		let already_breached = breached.contains(&channel_point) ||
			match this.store.contains(&channel_point) {
				Ok(contains) => contains,
				Err(e) => {
					drop(breached);
					let _ = ack.send(Err(e));
					return;
				},
			};
		if already_breached {
			drop(breached);
			log_debug!(this.logger, "Channel {} already under retribution, acking replayed breach", channel_point);
			let _ = ack.send(Ok(()));
			return;
		}

		let record = RetributionRecord {
			commitment_txid,
			channel_point,
			chain_hash,
			breach_height,
			outputs: breached_outputs,
		};
		if let Err(e) = this.store.add_retribution(&record) {
			drop(breached);
			let _ = ack.send(Err(e));
			return;
		}
		breached.insert(channel_point);
		drop(breached);

		log_info!(this.logger, "Channel {} breached by commitment {}, retribution record persisted", channel_point, commitment_txid);
		let _ = ack.send(Ok(()));

		let engine = Arc::clone(this);
		thread::spawn(move || engine.exact_retribution(record));
	}

	/// The per-breach workflow: runs from breach-transaction confirmation to
	/// justice confirmation. Blocking; runs on its own task.
	fn exact_retribution(&self, mut record: RetributionRecord) {
		let breach_watch =
			self.notifier.register_confirmation(record.commitment_txid, 1, record.breach_height);
		let breach_conf = match breach_watch.events.recv() {
			Ok(conf) => conf,
			Err(_) => return,
		};
		if self.shutdown.is_triggered() {
			return;
		}
		log_info!(self.logger, "Breach transaction {} confirmed at height {}, exacting retribution for channel {}",
			record.commitment_txid, breach_conf.height, record.channel_point);

		let mut spend_watches: Vec<(bitcoin::OutPoint, SpendWatch)> = record
			.outputs
			.iter()
			.filter(|outp| outp.witness_type.is_htlc())
			.map(|outp| (outp.outpoint, self.notifier.register_spend(outp.outpoint, record.breach_height)))
			.collect();

		let mut finalized: Option<Transaction> = None;
		let mut allow_stored = true;
		let mut awaiting_escalation = false;
		let justice_tx = loop {
			if self.shutdown.is_triggered() {
				return;
			}

			let escalated = self.poll_escalations(&mut record, &mut spend_watches);
			if escalated {
				finalized = None;
				allow_stored = false;
				awaiting_escalation = false;
			} else if awaiting_escalation {
				// A conflicting spend beat our broadcast but its notification
				// has not surfaced yet; hold off rebuilding the same bytes.
				thread::sleep(ESCALATION_POLL_INTERVAL);
				continue;
			}

			if finalized.is_none() {
				finalized = match self.prepare_justice_tx(&record, allow_stored) {
					Some(tx) => Some(tx),
					None => return,
				};
			}
			let justice = match finalized {
				Some(ref tx) => tx.clone(),
				None => return,
			};

			match self.broadcaster.broadcast_transaction(&justice) {
				Ok(()) => break justice,
				Err(BroadcastError::DoubleSpend) => {
					log_warn!(self.logger, "Justice transaction {} for channel {} was double spent, re-checking for second-level escalation",
						justice.txid(), record.channel_point);
					finalized = None;
					allow_stored = false;
					awaiting_escalation = true;
				},
				Err(BroadcastError::Rejected(reason)) => {
					log_error!(self.logger, "Failed to broadcast justice transaction {} for channel {}: {}; will retry from disk on restart",
						justice.txid(), record.channel_point, reason);
					return;
				},
			}
		};

		let justice_watch = self.notifier.register_confirmation(justice_tx.txid(), 1, breach_conf.height);
		let justice_conf = match justice_watch.events.recv() {
			Ok(conf) => conf,
			Err(_) => return,
		};
		if self.shutdown.is_triggered() {
			return;
		}
		if let Err(e) = self.channels.mark_channel_fully_closed(&record.channel_point) {
			log_error!(self.logger, "Failed to mark breached channel {} fully closed: {:?}", record.channel_point, e);
			return;
		}
		if let Err(e) = self.store.remove_retribution(&record.channel_point) {
			log_error!(self.logger, "Failed to remove served retribution for channel {}: {:?}", record.channel_point, e);
			return;
		}
		self.breached_channels.lock().unwrap().remove(&record.channel_point);
		self.pending_events.lock().unwrap().push(Event::JusticeTransactionConfirmed {
			channel_point: record.channel_point,
			justice_txid: justice_tx.txid(),
		});
		log_info!(self.logger, "Justice transaction {} for channel {} confirmed at height {}",
			justice_tx.txid(), record.channel_point, justice_conf.height);
	}

	/// Non-blocking sweep over the escalation watches: any HTLC output the
	/// cheater took to the second level is rewritten in place to target the
	/// escalating transaction's output. Returns whether anything changed.
	fn poll_escalations(
		&self, record: &mut RetributionRecord, spend_watches: &mut Vec<(bitcoin::OutPoint, SpendWatch)>,
	) -> bool {
		let mut escalated = false;
		let mut idx = 0;
		while idx < spend_watches.len() {
			let detail = match spend_watches[idx].1.poll() {
				Some(detail) => detail,
				None => {
					idx += 1;
					continue;
				},
			};
			let spent_outpoint = spend_watches[idx].0;
			spend_watches.swap_remove(idx);
			match record.outputs.iter_mut().find(|outp| outp.outpoint == spent_outpoint) {
				Some(outp) => {
					if outp.switch_to_second_level(&detail.spending_tx) {
						log_warn!(self.logger, "HTLC output {} escalated to second level by {}, retargeting justice at the escalation",
							spent_outpoint, detail.spending_tx.txid());
						escalated = true;
					} else {
						log_error!(self.logger, "HTLC output {} was spent by {} but no second-level script is stored; output abandoned",
							spent_outpoint, detail.spending_tx.txid());
					}
				},
				None => {
					log_debug!(self.logger, "Watched outpoint {} no longer part of the retribution", spent_outpoint);
				},
			}
		}
		escalated
	}

	/// Loads the finalized justice transaction, or builds, signs and
	/// finalizes a fresh one over the record's (possibly rewritten) outputs.
	/// Returns None if the attempt must be abandoned; persistent state is
	/// left intact for a later retry.
	fn prepare_justice_tx(&self, record: &RetributionRecord, allow_stored: bool) -> Option<Transaction> {
		if allow_stored {
			match self.store.justice_tx(&record.channel_point) {
				Ok(Some(tx)) => return Some(tx),
				Ok(None) => {},
				Err(StoreError::Corrupt(e)) => {
					log_error!(self.logger, "Stored justice transaction for channel {} is undecodable ({:?}), rebuilding", record.channel_point, e);
				},
				Err(e) => {
					log_error!(self.logger, "Failed to load justice transaction for channel {}: {:?}", record.channel_point, e);
					return None;
				},
			}
		}

		let inputs: Vec<SweepInput> = record.outputs.iter().map(SweepInput::from).collect();
		let tx = match sweeper::create_sweep_tx(&inputs, ConfirmationTarget::HighPriority,
			&self.fee_estimator, &self.keys, &self.logger)
		{
			Ok(tx) => tx,
			Err(e) => {
				log_error!(self.logger, "Failed to construct justice transaction for channel {}: {:?}", record.channel_point, e);
				return None;
			},
		};
		if let Err(e) = self.store.finalize_justice_tx(&record.channel_point, &tx) {
			log_error!(self.logger, "Failed to finalize justice transaction for channel {}: {:?}", record.channel_point, e);
			return None;
		}
		log_info!(self.logger, "Finalized justice transaction {} sweeping {} outputs of channel {}",
			tx.txid(), record.outputs.len(), record.channel_point);
		Some(tx)
	}
}

impl<K, N, T, F, KS, C, X, L> EventsProvider for RetributionEngine<K, N, T, F, KS, C, X, L>
where
	K: Deref,
	N: Deref,
	T: Deref,
	F: Deref,
	KS: Deref,
	C: Deref,
	X: Deref,
	L: Deref,
	K::Target: KVStore,
	N::Target: ChainNotifier,
	T::Target: BroadcasterInterface,
	F::Target: FeeEstimator,
	KS::Target: KeysInterface,
	C::Target: ChannelRegistry,
	X::Target: LinkController,
	L::Target: Logger,
{
	fn get_and_clear_pending_events(&self) -> Vec<Event> {
		let mut pending_events = self.pending_events.lock().unwrap();
		let mut events = Vec::new();
		std::mem::swap(&mut events, &mut *pending_events);
		events
	}
}
