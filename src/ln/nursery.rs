// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The output nursery: incubates the time-locked outputs of a force-closed
//! channel until each can be swept into the wallet.
//!
//! Every output moves through a persistent four-stage machine, clocked by
//! confirmation notifications and block arrivals:
//!
//! * crib — an outgoing HTLC on our own commitment, waiting for its absolute
//!   expiry so its pre-signed first-stage timeout transaction can go out;
//! * preschool — an output whose prerequisite transaction has not confirmed
//!   yet (our delayed commitment output, or an incoming HTLC's second-level
//!   success output);
//! * kindergarten — an output waiting out a relative or absolute maturity
//!   height;
//! * graduated — swept and confirmed.
//!
//! Kindergarten sweeps are batched per height: the first time a height's
//! class comes due, one sweep transaction over the whole class is built,
//! persisted, and only then broadcast — every retry and every restart reuses
//! those exact bytes, so the class cannot split into competing txids.
//!
//! Once a confirmation has been acted on there is no unwind; a reorg deeper
//! than the notifier's own re-registration is unrecoverable here.

use std::collections::{BTreeSet, HashSet};
use std::io::Read;
use std::ops::Deref;
use std::sync::{Arc, Mutex};
use std::thread;

use bitcoin::blockdata::transaction::{OutPoint as BitcoinOutPoint, Transaction};

use crate::chain::chaininterface::{BroadcastError, BroadcasterInterface, ConfirmationTarget, FeeEstimator};
use crate::chain::keysinterface::{KeysInterface, SignDescriptor};
use crate::chain::notify::{ChainNotifier, ConfirmationWatch};
use crate::chain::transaction::OutPoint;
use crate::ln::channels::ChannelRegistry;
use crate::ln::store::{KVStore, NurseryStage, NurseryStore, StoreError};
use crate::ln::sweep_utils::WitnessType;
use crate::ln::sweeper::{self, SweepError, SweepInput};
use crate::util::events::{Event, EventsProvider};
use crate::util::logger::Logger;
use crate::util::ser::{DecodeError, Readable, Writeable, Writer};
use crate::util::shutdown::ShutdownSignal;

/// Nursery tuning supplied by the embedder.
#[derive(Clone, Copy, Debug)]
pub struct NurseryConfig {
	/// Confirmations required before a prerequisite or sweep transaction is
	/// considered settled.
	pub conf_depth: u32,
}

impl Default for NurseryConfig {
	fn default() -> Self {
		NurseryConfig { conf_depth: 1 }
	}
}

/// An error surfaced by a nursery operation.
#[derive(Debug)]
pub enum NurseryError {
	/// The store failed; nothing advanced.
	Store(StoreError),
	/// Sweep construction failed; the class stays put and is retried.
	Sweep(SweepError),
}

impl From<StoreError> for NurseryError {
	fn from(e: StoreError) -> Self {
		NurseryError::Store(e)
	}
}

impl From<SweepError> for NurseryError {
	fn from(e: SweepError) -> Self {
		NurseryError::Sweep(e)
	}
}

/// A single-stage output under incubation: waiting on a confirmation and/or
/// a maturity height before it can be swept.
#[derive(Clone, Debug, PartialEq)]
pub struct KidOutput {
	/// The output's value in satoshis.
	pub amount: u64,
	/// The output to sweep.
	pub outpoint: BitcoinOutPoint,
	/// The channel whose close produced this output.
	pub origin_channel_point: OutPoint,
	/// Whether the output settles an HTLC.
	pub is_htlc: bool,
	/// Relative maturity: blocks after confirmation of the prerequisite
	/// transaction before the output can be swept. Zero for absolute-only
	/// outputs.
	pub blocks_to_maturity: u32,
	/// Absolute maturity height; used only when `blocks_to_maturity` is
	/// zero (a CLTV-locked HTLC on the remote commitment).
	pub absolute_maturity: u32,
	/// The height the prerequisite transaction confirmed at; zero until
	/// observed.
	pub conf_height: u32,
	/// The script template guarding the output.
	pub witness_type: WitnessType,
	/// The signing material for the output's witness.
	pub sign_desc: SignDescriptor,
}

impl KidOutput {
	/// The height at which the output becomes spendable: confirmation plus
	/// the relative delay, or the absolute maturity for CLTV-only outputs.
	pub fn maturity_height(&self) -> u32 {
		if self.blocks_to_maturity > 0 {
			self.conf_height + self.blocks_to_maturity
		} else {
			self.absolute_maturity
		}
	}

	/// This output as one input of a batched sweep.
	pub fn as_sweep_input(&self) -> SweepInput {
		SweepInput {
			outpoint: self.outpoint,
			amount: self.amount,
			witness_type: self.witness_type,
			sign_desc: self.sign_desc.clone(),
			csv_delay: self.blocks_to_maturity,
			cltv_expiry: self.absolute_maturity,
		}
	}
}

impl Writeable for KidOutput {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), std::io::Error> {
		self.amount.write(writer)?;
		self.outpoint.write(writer)?;
		self.origin_channel_point.write(writer)?;
		self.is_htlc.write(writer)?;
		self.blocks_to_maturity.write(writer)?;
		self.absolute_maturity.write(writer)?;
		self.conf_height.write(writer)?;
		self.witness_type.write(writer)?;
		self.sign_desc.write(writer)
	}
}

impl Readable for KidOutput {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		Ok(KidOutput {
			amount: Readable::read(reader)?,
			outpoint: Readable::read(reader)?,
			origin_channel_point: Readable::read(reader)?,
			is_htlc: Readable::read(reader)?,
			blocks_to_maturity: Readable::read(reader)?,
			absolute_maturity: Readable::read(reader)?,
			conf_height: Readable::read(reader)?,
			witness_type: Readable::read(reader)?,
			sign_desc: Readable::read(reader)?,
		})
	}
}

/// A two-stage output: an outgoing HTLC on our own commitment whose
/// pre-signed timeout transaction must confirm before the embedded kid's CSV
/// clock starts.
#[derive(Clone, Debug, PartialEq)]
pub struct BabyOutput {
	/// The HTLC's absolute expiry; the timeout transaction is broadcast at
	/// this height.
	pub expiry: u32,
	/// The fully-signed first-stage timeout transaction.
	pub timeout_tx: Transaction,
	/// The second-stage output the timeout transaction creates.
	pub kid: KidOutput,
}

impl Writeable for BabyOutput {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), std::io::Error> {
		self.expiry.write(writer)?;
		self.timeout_tx.write(writer)?;
		self.kid.write(writer)
	}
}

impl Readable for BabyOutput {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		Ok(BabyOutput {
			expiry: Readable::read(reader)?,
			timeout_tx: Readable::read(reader)?,
			kid: Readable::read(reader)?,
		})
	}
}

/// The resolution of our delayed commitment output on a force-close.
#[derive(Clone, Debug)]
pub struct CommitmentResolution {
	/// Our to-self output on the commitment transaction.
	pub outpoint: BitcoinOutPoint,
	/// Signing material for the delayed spend; its embedded prevout carries
	/// the output value.
	pub sign_desc: SignDescriptor,
	/// The CSV delay the counterparty imposed on us.
	pub maturity_delay: u32,
}

/// The resolution of an HTLC we offered, on either commitment.
#[derive(Clone, Debug)]
pub struct OutgoingHtlcResolution {
	/// The HTLC's absolute expiry height.
	pub expiry: u32,
	/// The pre-signed first-stage timeout transaction when the HTLC sits on
	/// our own commitment; None when it sits on the remote commitment and
	/// can be claimed directly after expiry.
	pub signed_timeout_tx: Option<Transaction>,
	/// The CSV delay on the second-stage output. Unused for direct claims.
	pub csv_delay: u32,
	/// The output we will ultimately sweep: the timeout transaction's output
	/// for the two-stage case, the commitment HTLC output itself otherwise.
	pub claim_outpoint: BitcoinOutPoint,
	/// Signing material for the sweep.
	pub sweep_sign_desc: SignDescriptor,
}

/// The resolution of an HTLC offered to us which we claimed with a
/// second-level success transaction.
#[derive(Clone, Debug)]
pub struct IncomingHtlcResolution {
	/// The CSV delay on the success transaction's output.
	pub csv_delay: u32,
	/// The success transaction's output, which we sweep once mature.
	pub claim_outpoint: BitcoinOutPoint,
	/// Signing material for the sweep.
	pub sweep_sign_desc: SignDescriptor,
}

/// Where one incubating output stands, for operator reporting.
#[derive(Clone, Debug, PartialEq)]
pub struct NurseryReportEntry {
	/// The output's current stage.
	pub stage: NurseryStage,
	/// The output's value in satoshis.
	pub amount: u64,
	/// The height at which the output matures (best known).
	pub maturity_height: u32,
	/// A human-readable classification of the output.
	pub description: &'static str,
}

/// A per-channel summary of incubation progress.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelMaturityReport {
	/// The channel being reported on.
	pub channel_point: OutPoint,
	/// Value still locked up in unswept outputs.
	pub limbo_balance: u64,
	/// Value already swept and confirmed.
	pub recovered_balance: u64,
	/// Every output the nursery tracks for the channel.
	pub outputs: Vec<NurseryReportEntry>,
}

fn describe_output(witness_type: WitnessType) -> &'static str {
	match witness_type {
		WitnessType::CommitmentNoDelay => "commitment output (remote commitment)",
		WitnessType::CommitmentTimeLock => "delayed commitment output",
		WitnessType::CommitmentRevoke |
		WitnessType::HtlcOfferedRevoke |
		WitnessType::HtlcAcceptedRevoke |
		WitnessType::HtlcSecondLevelRevoke => "revoked output",
		WitnessType::HtlcOfferedTimeoutSecondLevel => "outgoing HTLC (second level)",
		WitnessType::HtlcAcceptedSuccessSecondLevel => "incoming HTLC (second level)",
		WitnessType::HtlcOfferedRemoteTimeout => "outgoing HTLC (remote commitment)",
	}
}

struct NurseryState {
	best_height: u32,
}

/// The output nursery engine. One instance incubates every force-closed
/// channel's outputs; per-batch follow-ups run on their own tasks, sharing
/// only the engine lock and the store.
pub struct UtxoNursery<K: Deref, N: Deref, T: Deref, F: Deref, KS: Deref, C: Deref, L: Deref>
where
	K::Target: KVStore,
	N::Target: ChainNotifier,
	T::Target: BroadcasterInterface,
	F::Target: FeeEstimator,
	KS::Target: KeysInterface,
	C::Target: ChannelRegistry,
	L::Target: Logger,
{
	store: NurseryStore<K>,
	notifier: N,
	broadcaster: T,
	fee_estimator: F,
	keys: KS,
	channels: C,
	config: NurseryConfig,
	state: Mutex<NurseryState>,
	retry_heights: Mutex<BTreeSet<u32>>,
	pending_events: Mutex<Vec<Event>>,
	shutdown: ShutdownSignal,
	logger: L,
}

impl<K, N, T, F, KS, C, L> UtxoNursery<K, N, T, F, KS, C, L>
where
	K: Deref + Send + Sync + 'static,
	N: Deref + Send + Sync + 'static,
	T: Deref + Send + Sync + 'static,
	F: Deref + Send + Sync + 'static,
	KS: Deref + Send + Sync + 'static,
	C: Deref + Send + Sync + 'static,
	L: Deref + Send + Sync + 'static,
	K::Target: KVStore,
	N::Target: ChainNotifier,
	T::Target: BroadcasterInterface,
	F::Target: FeeEstimator,
	KS::Target: KeysInterface,
	C::Target: ChannelRegistry,
	L::Target: Logger,
{
	/// Creates a new nursery over the given collaborators. Call
	/// [`UtxoNursery::start`] afterwards to resume persisted incubation and
	/// begin tracking block arrivals.
	pub fn new(
		db: K, notifier: N, broadcaster: T, fee_estimator: F, keys: KS, channels: C,
		config: NurseryConfig, shutdown: ShutdownSignal, logger: L,
	) -> Self {
		UtxoNursery {
			store: NurseryStore::new(db),
			notifier,
			broadcaster,
			fee_estimator,
			keys,
			channels,
			config,
			state: Mutex::new(NurseryState { best_height: 0 }),
			retry_heights: Mutex::new(BTreeSet::new()),
			pending_events: Mutex::new(Vec::new()),
			shutdown,
			logger,
		}
	}

	/// The nursery's view of the best chain height.
	pub fn best_height(&self) -> u32 {
		self.state.lock().unwrap().best_height
	}

	/// Accepts a freshly force-closed channel's outputs for incubation.
	/// Everything is persisted in one transaction before any chain
	/// interaction; babies already past their expiry are broadcast
	/// immediately.
	pub fn incubate(
		this: &Arc<Self>, channel_point: OutPoint, commitment: Option<CommitmentResolution>,
		outgoing_htlcs: Vec<OutgoingHtlcResolution>, incoming_htlcs: Vec<IncomingHtlcResolution>,
	) -> Result<(), NurseryError> {
		let mut babies = Vec::new();
		let mut pscl_kids = Vec::new();
		let mut kndr_kids = Vec::new();

		if let Some(res) = commitment {
			pscl_kids.push(KidOutput {
				amount: res.sign_desc.output.value,
				outpoint: res.outpoint,
				origin_channel_point: channel_point,
				is_htlc: false,
				blocks_to_maturity: res.maturity_delay,
				absolute_maturity: 0,
				conf_height: 0,
				witness_type: WitnessType::CommitmentTimeLock,
				sign_desc: res.sign_desc,
			});
		}
		for res in incoming_htlcs {
			pscl_kids.push(KidOutput {
				amount: res.sweep_sign_desc.output.value,
				outpoint: res.claim_outpoint,
				origin_channel_point: channel_point,
				is_htlc: true,
				blocks_to_maturity: res.csv_delay,
				absolute_maturity: 0,
				conf_height: 0,
				witness_type: WitnessType::HtlcAcceptedSuccessSecondLevel,
				sign_desc: res.sweep_sign_desc,
			});
		}
		for res in outgoing_htlcs {
			match res.signed_timeout_tx {
				Some(timeout_tx) => babies.push(BabyOutput {
					expiry: res.expiry,
					timeout_tx,
					kid: KidOutput {
						amount: res.sweep_sign_desc.output.value,
						outpoint: res.claim_outpoint,
						origin_channel_point: channel_point,
						is_htlc: true,
						blocks_to_maturity: res.csv_delay,
						absolute_maturity: 0,
						conf_height: 0,
						witness_type: WitnessType::HtlcOfferedTimeoutSecondLevel,
						sign_desc: res.sweep_sign_desc,
					},
				}),
				None => kndr_kids.push(KidOutput {
					amount: res.sweep_sign_desc.output.value,
					outpoint: res.claim_outpoint,
					origin_channel_point: channel_point,
					is_htlc: true,
					blocks_to_maturity: 0,
					absolute_maturity: res.expiry,
					conf_height: 0,
					witness_type: WitnessType::HtlcOfferedRemoteTimeout,
					sign_desc: res.sweep_sign_desc,
				}),
			}
		}

		{
			let _state = this.state.lock().unwrap();
			this.store.incubate(&babies, &pscl_kids, &kndr_kids)?;
		}
		log_info!(this.logger, "Incubating {} outputs for closed channel {} ({} two-stage, {} awaiting confirmation, {} time-locked only)",
			babies.len() + pscl_kids.len() + kndr_kids.len(), channel_point, babies.len(), pscl_kids.len(), kndr_kids.len());

		// A baby whose expiry already passed must not wait for the next
		// block arrival.
		let best_height = this.notifier.best_block_height();
		for baby in babies.iter().filter(|baby| baby.expiry <= best_height) {
			Self::broadcast_baby(this, baby, best_height);
		}

		let close_height_hint = this
			.channels
			.fetch_close_summary(&channel_point)
			.map(|summary| summary.close_height)
			.unwrap_or(0)
			.saturating_sub(this.config.conf_depth);
		for kid in pscl_kids {
			let watch = this.notifier.register_confirmation(kid.outpoint.txid, this.config.conf_depth, close_height_hint);
			Self::spawn_preschool_wait(this, kid, watch);
		}
		Ok(())
	}

	/// The block-epoch handler: sweeps the kindergarten class due at
	/// `height`, broadcasts expiring first-stage transactions, and retries
	/// any earlier class whose broadcast previously failed. Must be invoked
	/// with monotonically increasing heights.
	pub fn graduate_class(this: &Arc<Self>, height: u32) -> Result<(), NurseryError> {
		{
			let mut state = this.state.lock().unwrap();
			if height > state.best_height {
				state.best_height = height;
			}
		}

		let retries: Vec<u32> = {
			let mut retry_heights = this.retry_heights.lock().unwrap();
			let heights = retry_heights.iter().cloned().filter(|h| *h != height).collect();
			retry_heights.clear();
			heights
		};
		for retry_height in retries {
			if let Err(e) = Self::process_class(this, retry_height) {
				log_error!(this.logger, "Retried class at height {} failed again: {:?}", retry_height, e);
				this.retry_heights.lock().unwrap().insert(retry_height);
			}
		}

		match Self::process_class(this, height) {
			Ok(()) => {},
			Err(e) => {
				this.retry_heights.lock().unwrap().insert(height);
				return Err(e);
			},
		}

		if height > this.store.last_graduated_height()? {
			this.store.set_last_graduated_height(height)?;
		}
		Ok(())
	}

	/// Processes one height's class: finalize-then-broadcast the batched
	/// kindergarten sweep and send out expiring first-stage transactions.
	/// Idempotent; replays reuse the stored sweep bytes.
	fn process_class(this: &Arc<Self>, height: u32) -> Result<(), NurseryError> {
		let class = this.store.fetch_class(height)?;
		for key in class.corrupt.iter() {
			log_error!(this.logger, "Skipping undecodable nursery record at height {} (index key {:02x?}); manual intervention required",
				height, key);
		}
		if class.finalized && class.sweep_tx.is_none() && class.kinder.is_empty() && class.babies.is_empty() {
			// A fully drained empty class; stop replaying it.
			this.store.prune_finalized_marker(height)?;
			return Ok(());
		}

		let sweep_tx = if height > this.store.last_finalized_height()? {
			if class.kinder.is_empty() {
				// Persist the empty marker so replay knows this height was
				// processed.
				this.store.finalize_kinder(height, None)?;
				None
			} else {
				let inputs: Vec<SweepInput> =
					class.kinder.iter().map(|kid| kid.as_sweep_input()).collect();
				let tx = sweeper::create_sweep_tx(&inputs, ConfirmationTarget::Normal,
					&this.fee_estimator, &this.keys, &this.logger)?;
				this.store.finalize_kinder(height, Some(&tx))?;
				log_info!(this.logger, "Finalized sweep {} for {} kindergarten outputs at height {}",
					tx.txid(), class.kinder.len(), height);
				Some(tx)
			}
		} else {
			class.sweep_tx
		};

		if let Some(tx) = sweep_tx {
			if !class.kinder.is_empty() {
				let broadcast_ok = match this.broadcaster.broadcast_transaction(&tx) {
					Ok(()) => true,
					Err(BroadcastError::DoubleSpend) => {
						log_debug!(this.logger, "Sweep {} for height {} was already swept by an earlier attempt", tx.txid(), height);
						true
					},
					Err(BroadcastError::Rejected(reason)) => {
						log_error!(this.logger, "Failed to broadcast sweep {} for height {}: {}; retrying next epoch",
							tx.txid(), height, reason);
						this.retry_heights.lock().unwrap().insert(height);
						false
					},
				};
				if broadcast_ok {
					let watch = this.notifier.register_confirmation(tx.txid(), this.config.conf_depth, height);
					Self::spawn_sweep_graduation(this, height, class.kinder, watch);
				}
			}
		}

		for baby in class.babies.iter() {
			Self::broadcast_baby(this, baby, height);
		}
		Ok(())
	}

	/// Broadcasts a baby's first-stage timeout transaction and arranges for
	/// its crib-to-kindergarten move on confirmation.
	fn broadcast_baby(this: &Arc<Self>, baby: &BabyOutput, height: u32) {
		match this.broadcaster.broadcast_transaction(&baby.timeout_tx) {
			Ok(()) => {},
			Err(BroadcastError::DoubleSpend) => {
				log_debug!(this.logger, "First-stage transaction {} already known to the chain", baby.timeout_tx.txid());
			},
			Err(BroadcastError::Rejected(reason)) => {
				log_error!(this.logger, "Failed to broadcast first-stage transaction {}: {}; retrying next epoch",
					baby.timeout_tx.txid(), reason);
				this.retry_heights.lock().unwrap().insert(baby.expiry);
				return;
			},
		}
		let watch = this.notifier.register_confirmation(baby.timeout_tx.txid(), this.config.conf_depth, height);
		let engine = Arc::clone(this);
		let mut baby = baby.clone();
		thread::spawn(move || {
			let conf = match watch.events.recv() {
				Ok(conf) => conf,
				Err(_) => return,
			};
			if engine.shutdown.is_triggered() {
				return;
			}
			baby.kid.conf_height = conf.height;
			match engine.store.crib_to_kinder(&baby) {
				Ok(()) => {
					log_info!(engine.logger, "First-stage transaction {} confirmed at height {}; output matures at height {}",
						baby.timeout_tx.txid(), conf.height, baby.kid.maturity_height());
				},
				Err(StoreError::NotFound) => {
					log_debug!(engine.logger, "First-stage output {} already promoted", baby.kid.outpoint);
				},
				Err(e) => {
					log_error!(engine.logger, "Failed to promote first-stage output {}: {:?}", baby.kid.outpoint, e);
				},
			}
		});
	}

	/// Waits out a preschool kid's prerequisite confirmation, then moves it
	/// to kindergarten keyed at its maturity height.
	fn spawn_preschool_wait(this: &Arc<Self>, kid: KidOutput, watch: ConfirmationWatch) {
		let engine = Arc::clone(this);
		let mut kid = kid;
		thread::spawn(move || {
			let conf = match watch.events.recv() {
				Ok(conf) => conf,
				Err(_) => return,
			};
			if engine.shutdown.is_triggered() {
				return;
			}
			kid.conf_height = conf.height;
			match engine.store.preschool_to_kinder(&kid) {
				Ok(()) => {
					log_info!(engine.logger, "Prerequisite for output {} confirmed at height {}; output matures at height {}",
						kid.outpoint, conf.height, kid.maturity_height());
				},
				Err(StoreError::NotFound) => {
					log_debug!(engine.logger, "Preschool output {} already promoted", kid.outpoint);
				},
				Err(e) => {
					log_error!(engine.logger, "Failed to promote preschool output {}: {:?}", kid.outpoint, e);
				},
			}
		});
	}

	/// Waits out a batched sweep's confirmation, graduates the class, and
	/// closes out any channel left fully mature.
	fn spawn_sweep_graduation(
		this: &Arc<Self>, height: u32, kids: Vec<KidOutput>, watch: ConfirmationWatch,
	) {
		let engine = Arc::clone(this);
		thread::spawn(move || {
			let conf = match watch.events.recv() {
				Ok(conf) => conf,
				Err(_) => return,
			};
			if engine.shutdown.is_triggered() {
				return;
			}
			if let Err(e) = engine.store.graduate_kinder(height, &kids) {
				log_error!(engine.logger, "Failed to graduate {} outputs at height {}: {:?}", kids.len(), height, e);
				return;
			}
			log_info!(engine.logger, "Sweep for height {} confirmed at height {}; graduated {} outputs",
				height, conf.height, kids.len());
			let mut channels_seen = HashSet::new();
			for kid in kids.iter() {
				if channels_seen.insert(kid.origin_channel_point) {
					if let Err(e) = engine.close_and_remove_if_mature(&kid.origin_channel_point) {
						log_error!(engine.logger, "Failed to close out matured channel {}: {:?}", kid.origin_channel_point, e);
					}
				}
			}
		});
	}

	/// If every output of the channel has graduated, marks the channel fully
	/// closed with the registry and removes its nursery state. The store's
	/// own maturity query is always the deciding vote.
	fn close_and_remove_if_mature(&self, channel_point: &OutPoint) -> Result<(), StoreError> {
		if !self.store.is_mature(channel_point)? {
			return Ok(());
		}
		self.channels.mark_channel_fully_closed(channel_point)?;
		self.store.remove_channel(channel_point)?;
		self.pending_events.lock().unwrap().push(Event::ChannelFullyResolved {
			channel_point: *channel_point,
		});
		log_info!(self.logger, "Channel {} fully resolved; every output swept", channel_point);
		Ok(())
	}

	/// Restart recovery: re-subscribes preschool confirmations, re-broadcasts
	/// finalized-but-unconfirmed sweeps and pending first-stage transactions,
	/// replays any heights the previous run never processed, removes channels
	/// the registry already knows to be fully closed, and begins consuming
	/// block epochs.
	pub fn start(this: &Arc<Self>) -> Result<(), NurseryError> {
		let best_height = this.notifier.best_block_height();
		{
			let mut state = this.state.lock().unwrap();
			state.best_height = best_height;
		}

		let (preschool, corrupt) = this.store.preschool_outputs()?;
		for key in corrupt.iter() {
			log_error!(this.logger, "Skipping undecodable preschool record (key {:02x?}); manual intervention required", key);
		}
		for kid in preschool {
			let close_height_hint = this
				.channels
				.fetch_close_summary(&kid.origin_channel_point)
				.map(|summary| summary.close_height)
				.unwrap_or(0)
				.saturating_sub(this.config.conf_depth);
			let watch = this.notifier.register_confirmation(kid.outpoint.txid, this.config.conf_depth, close_height_hint);
			Self::spawn_preschool_wait(this, kid, watch);
		}

		// A nursery which has never processed a block replays only from its
		// earliest persisted entry, not from genesis.
		let last_graduated = this.store.last_graduated_height()?;
		let replay_from = if last_graduated == 0 {
			match this.store.active_heights(best_height)?.first() {
				Some(first_active) => first_active.saturating_sub(1),
				None => {
					if best_height > 0 {
						this.store.set_last_graduated_height(best_height)?;
					}
					best_height
				},
			}
		} else {
			last_graduated
		};

		for height in this.store.active_heights(replay_from)? {
			log_info!(this.logger, "Replaying unfinished class at height {}", height);
			if let Err(e) = Self::process_class(this, height) {
				log_error!(this.logger, "Replay of class at height {} failed: {:?}", height, e);
				this.retry_heights.lock().unwrap().insert(height);
			}
		}

		for height in (replay_from + 1)..=best_height {
			Self::graduate_class(this, height)?;
		}

		for summary in this.channels.fetch_closed_channels(false)? {
			if summary.is_pending {
				continue;
			}
			match this.store.is_mature(&summary.channel_point)? {
				true => this.store.remove_channel(&summary.channel_point)?,
				false => {
					log_warn!(this.logger, "Registry reports channel {} fully closed but outputs are still incubating; keeping them",
						summary.channel_point);
				},
			}
		}

		let epochs = this.notifier.register_block_epochs();
		let engine = Arc::clone(this);
		thread::spawn(move || loop {
			if engine.shutdown.is_triggered() {
				return;
			}
			match epochs.heights.recv() {
				Ok(height) => {
					if let Err(e) = Self::graduate_class(&engine, height) {
						log_error!(engine.logger, "Failed to process block {}: {:?}; will retry", height, e);
					}
				},
				Err(_) => return,
			}
		});
		Ok(())
	}

	/// Summarizes the channel's incubation progress, or None if the nursery
	/// holds nothing for it.
	pub fn channel_report(&self, channel_point: &OutPoint) -> Result<Option<ChannelMaturityReport>, StoreError> {
		let mut outputs = Vec::new();
		let mut limbo_balance: u64 = 0;
		let mut recovered_balance: u64 = 0;
		let mut corrupt = 0usize;
		self.store.for_channel_outputs(channel_point, |loaded| {
			match loaded {
				Ok((stage, kid)) => {
					match stage {
						NurseryStage::Graduated => recovered_balance += kid.amount,
						_ => limbo_balance += kid.amount,
					}
					outputs.push(NurseryReportEntry {
						stage,
						amount: kid.amount,
						maturity_height: kid.maturity_height(),
						description: describe_output(kid.witness_type),
					});
				},
				Err(_) => corrupt += 1,
			}
			Ok(())
		})?;
		if corrupt > 0 {
			log_error!(self.logger, "Channel {} has {} undecodable nursery records", channel_point, corrupt);
		}
		if outputs.is_empty() {
			return Ok(None);
		}
		Ok(Some(ChannelMaturityReport {
			channel_point: *channel_point,
			limbo_balance,
			recovered_balance,
			outputs,
		}))
	}
}

impl<K, N, T, F, KS, C, L> EventsProvider for UtxoNursery<K, N, T, F, KS, C, L>
where
	K: Deref,
	N: Deref,
	T: Deref,
	F: Deref,
	KS: Deref,
	C: Deref,
	L: Deref,
	K::Target: KVStore,
	N::Target: ChainNotifier,
	T::Target: BroadcasterInterface,
	F::Target: FeeEstimator,
	KS::Target: KeysInterface,
	C::Target: ChannelRegistry,
	L::Target: Logger,
{
	fn get_and_clear_pending_events(&self) -> Vec<Event> {
		let mut pending_events = self.pending_events.lock().unwrap();
		let mut events = Vec::new();
		std::mem::swap(&mut events, &mut *pending_events);
		events
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ln::channels::ChannelCloseSummary;
	use crate::ln::store::MemoryStore;
	use crate::util::test_utils::{self, TestBroadcaster, TestChainNotifier, TestChannelRegistry, TestFeeEstimator, TestKeysInterface, TestLogger};

	use bitcoin::blockdata::script::Script;
	use bitcoin::blockdata::transaction::{TxIn, TxOut};
	use bitcoin::{PackedLockTime, Sequence, Witness};

	use std::io::Cursor;

	type TestNursery = UtxoNursery<
		Arc<MemoryStore>,
		Arc<TestChainNotifier>,
		Arc<TestBroadcaster>,
		Arc<TestFeeEstimator>,
		Arc<TestKeysInterface>,
		Arc<TestChannelRegistry>,
		Arc<TestLogger>,
	>;

	struct Harness {
		kv: Arc<MemoryStore>,
		notifier: Arc<TestChainNotifier>,
		broadcaster: Arc<TestBroadcaster>,
		keys: Arc<TestKeysInterface>,
		channels: Arc<TestChannelRegistry>,
		shutdown: ShutdownSignal,
		nursery: Arc<TestNursery>,
	}

	fn harness_over(kv: Arc<MemoryStore>, best_height: u32) -> Harness {
		let notifier = Arc::new(TestChainNotifier::new(best_height));
		let broadcaster = Arc::new(TestBroadcaster::new());
		let fee_estimator = Arc::new(TestFeeEstimator::new(2000));
		let keys = Arc::new(TestKeysInterface::new());
		let channels = Arc::new(TestChannelRegistry::new());
		let logger = Arc::new(TestLogger::new());
		let shutdown = ShutdownSignal::new();
		let nursery = Arc::new(UtxoNursery::new(
			Arc::clone(&kv),
			Arc::clone(&notifier),
			Arc::clone(&broadcaster),
			fee_estimator,
			Arc::clone(&keys),
			Arc::clone(&channels),
			NurseryConfig::default(),
			shutdown.clone(),
			logger,
		));
		Harness { kv, notifier, broadcaster, keys, channels, shutdown, nursery }
	}

	fn new_harness(best_height: u32) -> Harness {
		harness_over(Arc::new(MemoryStore::new()), best_height)
	}

	impl Harness {
		fn store(&self) -> NurseryStore<Arc<MemoryStore>> {
			NurseryStore::new(Arc::clone(&self.kv))
		}

		fn add_pending_close(&self, channel_point: OutPoint, close_height: u32) {
			self.channels.add_closed_channel(ChannelCloseSummary {
				channel_point,
				close_height,
				is_pending: true,
			});
		}
	}

	fn commit_resolution(close_txid: bitcoin::Txid, amount: u64, csv_delay: u32) -> CommitmentResolution {
		CommitmentResolution {
			outpoint: BitcoinOutPoint { txid: close_txid, vout: 0 },
			sign_desc: test_utils::sign_descriptor(amount, 9),
			maturity_delay: csv_delay,
		}
	}

	fn timeout_tx_for(seed: u8, value: u64) -> Transaction {
		Transaction {
			version: 2,
			lock_time: PackedLockTime(0),
			input: vec![TxIn {
				previous_output: test_utils::dummy_outpoint(seed),
				script_sig: Script::new(),
				sequence: Sequence(0xFFFF_FFFE),
				witness: Witness::default(),
			}],
			output: vec![TxOut {
				value,
				script_pubkey: Script::from(vec![0x00, 0x20, seed]),
			}],
		}
	}

	#[test]
	fn kid_and_baby_roundtrip() {
		let kid = test_utils::kid_output(3, 500_000, 144, 0);
		let read: KidOutput = Readable::read(&mut Cursor::new(kid.encode())).unwrap();
		assert_eq!(read, kid);

		let baby = test_utils::baby_output(4, 400_000, 520, 144);
		let encoded = baby.encode();
		let read: BabyOutput = Readable::read(&mut Cursor::new(&encoded)).unwrap();
		assert_eq!(read, baby);
		match <BabyOutput as Readable>::read(&mut Cursor::new(&encoded[..encoded.len() - 2])) {
			Err(DecodeError::ShortRead) => {},
			res => panic!("expected short read, got {:?}", res),
		}
	}

	#[test]
	fn commit_output_incubates_to_graduation() {
		let harness = new_harness(100);
		let channel_point = test_utils::channel_point(1);
		harness.add_pending_close(channel_point, 100);
		let close_txid = test_utils::dummy_txid(0x66);
		harness.notifier.script_confirmation(close_txid, 100, test_utils::dummy_tx(1));

		UtxoNursery::incubate(
			&harness.nursery,
			channel_point,
			Some(commit_resolution(close_txid, 500_000, 144)),
			vec![],
			vec![],
		)
		.unwrap();

		// Confirmation at height 100 moves the kid to kindergarten keyed at
		// 100 + 144.
		assert!(test_utils::wait_for(|| {
			harness.store().fetch_class(244).unwrap().kinder.len() == 1
		}));

		UtxoNursery::graduate_class(&harness.nursery, 244).unwrap();
		assert_eq!(harness.broadcaster.broadcast_count(), 1);
		let sweep = harness.broadcaster.txn_broadcasted.lock().unwrap()[0].clone();
		assert_eq!(sweep.input.len(), 1);
		assert_eq!(sweep.input[0].sequence, Sequence(144));
		assert_eq!(sweep.output.len(), 1);
		assert!(sweep.output[0].script_pubkey.is_v0_p2wpkh());

		assert!(test_utils::wait_for(|| harness.notifier.pending_conf_count(&sweep.txid()) > 0));
		harness.notifier.confirm_transaction(sweep.txid(), 245, sweep.clone());

		assert!(test_utils::wait_for(|| harness.channels.is_fully_closed(&channel_point)));
		assert!(test_utils::wait_for(|| {
			harness.nursery.get_and_clear_pending_events()
				== vec![Event::ChannelFullyResolved { channel_point }]
		}));
		let mut remaining = 0;
		harness
			.store()
			.for_channel_outputs(&channel_point, |_| {
				remaining += 1;
				Ok(())
			})
			.unwrap();
		assert_eq!(remaining, 0);
	}

	#[test]
	fn two_stage_htlc_walks_crib_then_kindergarten() {
		let harness = new_harness(500);
		let channel_point = test_utils::channel_point(2);
		harness.add_pending_close(channel_point, 498);

		let timeout_tx = timeout_tx_for(0x51, 399_000);
		let claim_outpoint = BitcoinOutPoint { txid: timeout_tx.txid(), vout: 0 };
		UtxoNursery::incubate(
			&harness.nursery,
			channel_point,
			None,
			vec![OutgoingHtlcResolution {
				expiry: 520,
				signed_timeout_tx: Some(timeout_tx.clone()),
				csv_delay: 144,
				claim_outpoint,
				sweep_sign_desc: test_utils::sign_descriptor(399_000, 5),
			}],
			vec![],
		)
		.unwrap();
		// Expiry is in the future: nothing goes out yet.
		assert_eq!(harness.broadcaster.broadcast_count(), 0);

		UtxoNursery::graduate_class(&harness.nursery, 520).unwrap();
		assert_eq!(harness.broadcaster.broadcast_count(), 1);
		assert_eq!(
			harness.broadcaster.txn_broadcasted.lock().unwrap()[0].encode(),
			timeout_tx.encode()
		);

		assert!(test_utils::wait_for(|| harness.notifier.pending_conf_count(&timeout_tx.txid()) > 0));
		harness.notifier.confirm_transaction(timeout_tx.txid(), 521, timeout_tx.clone());
		assert!(test_utils::wait_for(|| {
			harness.store().fetch_class(521 + 144).unwrap().kinder.len() == 1
		}));

		UtxoNursery::graduate_class(&harness.nursery, 665).unwrap();
		assert_eq!(harness.broadcaster.broadcast_count(), 2);
		let sweep = harness.broadcaster.txn_broadcasted.lock().unwrap()[1].clone();
		assert_eq!(sweep.input.len(), 1);
		assert_eq!(sweep.input[0].previous_output, claim_outpoint);
		assert_eq!(sweep.input[0].sequence, Sequence(144));

		assert!(test_utils::wait_for(|| harness.notifier.pending_conf_count(&sweep.txid()) > 0));
		harness.notifier.confirm_transaction(sweep.txid(), 666, sweep.clone());
		assert!(test_utils::wait_for(|| harness.channels.is_fully_closed(&channel_point)));
	}

	#[test]
	fn expired_baby_broadcasts_during_incubation() {
		let harness = new_harness(530);
		let channel_point = test_utils::channel_point(3);
		harness.add_pending_close(channel_point, 498);
		let timeout_tx = timeout_tx_for(0x52, 250_000);
		UtxoNursery::incubate(
			&harness.nursery,
			channel_point,
			None,
			vec![OutgoingHtlcResolution {
				expiry: 520,
				signed_timeout_tx: Some(timeout_tx.clone()),
				csv_delay: 144,
				claim_outpoint: BitcoinOutPoint { txid: timeout_tx.txid(), vout: 0 },
				sweep_sign_desc: test_utils::sign_descriptor(250_000, 5),
			}],
			vec![],
		)
		.unwrap();
		assert_eq!(harness.broadcaster.broadcast_count(), 1);
		assert_eq!(
			harness.broadcaster.txn_broadcasted.lock().unwrap()[0].encode(),
			timeout_tx.encode()
		);
	}

	#[test]
	fn cltv_locked_htlc_sweeps_with_locktime() {
		let harness = new_harness(800_000);
		let channel_point = test_utils::channel_point(4);
		harness.add_pending_close(channel_point, 799_990);
		let claim_outpoint = test_utils::dummy_outpoint(0x53);
		UtxoNursery::incubate(
			&harness.nursery,
			channel_point,
			None,
			vec![OutgoingHtlcResolution {
				expiry: 800_040,
				signed_timeout_tx: None,
				csv_delay: 0,
				claim_outpoint,
				sweep_sign_desc: test_utils::sign_descriptor(100_000, 6),
			}],
			vec![],
		)
		.unwrap();

		// Direct CLTV claims skip preschool entirely.
		let class = harness.store().fetch_class(800_040).unwrap();
		assert_eq!(class.kinder.len(), 1);
		assert_eq!(class.kinder[0].witness_type, WitnessType::HtlcOfferedRemoteTimeout);

		UtxoNursery::graduate_class(&harness.nursery, 800_040).unwrap();
		let sweep = harness.broadcaster.txn_broadcasted.lock().unwrap()[0].clone();
		assert_eq!(sweep.lock_time, PackedLockTime(800_040));
		assert_eq!(sweep.input[0].sequence, Sequence(0xFFFF_FFFE));
	}

	#[test]
	fn restart_resubscribes_and_reuses_finalized_sweep() {
		let kv = Arc::new(MemoryStore::new());
		let sweep = {
			let harness = harness_over(Arc::clone(&kv), 100);
			let cp_a = test_utils::channel_point(5);
			let cp_b = test_utils::channel_point(6);
			harness.add_pending_close(cp_a, 100);
			harness.add_pending_close(cp_b, 100);
			let close_a = test_utils::dummy_txid(0x61);
			let close_b = test_utils::dummy_txid(0x62);
			harness.notifier.script_confirmation(close_a, 100, test_utils::dummy_tx(1));
			harness.notifier.script_confirmation(close_b, 100, test_utils::dummy_tx(2));
			UtxoNursery::incubate(&harness.nursery, cp_a,
				Some(commit_resolution(close_a, 500_000, 100)), vec![], vec![]).unwrap();
			UtxoNursery::incubate(&harness.nursery, cp_b,
				Some(commit_resolution(close_b, 400_000, 100)), vec![], vec![]).unwrap();
			assert!(test_utils::wait_for(|| {
				harness.store().fetch_class(200).unwrap().kinder.len() == 2
			}));
			// Sweep is finalized and broadcast, then the process dies before
			// the confirmation fires.
			UtxoNursery::graduate_class(&harness.nursery, 200).unwrap();
			let sweep_tx = harness.broadcaster.txn_broadcasted.lock().unwrap()[0].clone();
			sweep_tx
		};

		let harness = harness_over(kv, 200);
		let cp_a = test_utils::channel_point(5);
		let cp_b = test_utils::channel_point(6);
		harness.add_pending_close(cp_a, 100);
		harness.add_pending_close(cp_b, 100);
		UtxoNursery::start(&harness.nursery).unwrap();

		// The same bytes go out again and the same txid is re-watched with
		// the class height as hint; no new wallet script is drawn.
		assert!(test_utils::wait_for(|| harness.broadcaster.broadcast_count() == 1));
		assert_eq!(
			harness.broadcaster.txn_broadcasted.lock().unwrap()[0].encode(),
			sweep.encode()
		);
		assert_eq!(harness.keys.sweep_scripts_issued(), 0);
		assert!(harness
			.notifier
			.conf_requests
			.lock()
			.unwrap()
			.iter()
			.any(|(txid, confs, hint)| *txid == sweep.txid() && *confs == 1 && *hint == 200));

		harness.notifier.confirm_transaction(sweep.txid(), 201, sweep.clone());
		assert!(test_utils::wait_for(|| {
			harness.channels.is_fully_closed(&cp_a) && harness.channels.is_fully_closed(&cp_b)
		}));
	}

	#[test]
	fn block_epochs_drive_graduation() {
		let harness = new_harness(100);
		let channel_point = test_utils::channel_point(9);
		harness.add_pending_close(channel_point, 100);
		let close_txid = test_utils::dummy_txid(0x65);
		harness.notifier.script_confirmation(close_txid, 100, test_utils::dummy_tx(1));

		UtxoNursery::start(&harness.nursery).unwrap();
		UtxoNursery::incubate(
			&harness.nursery,
			channel_point,
			Some(commit_resolution(close_txid, 500_000, 50)),
			vec![],
			vec![],
		)
		.unwrap();
		assert!(test_utils::wait_for(|| {
			harness.store().fetch_class(150).unwrap().kinder.len() == 1
		}));

		harness.notifier.connect_block(150);
		assert!(test_utils::wait_for(|| harness.broadcaster.broadcast_count() == 1));
		assert_eq!(harness.nursery.best_height(), 150);
		let sweep = harness.broadcaster.txn_broadcasted.lock().unwrap()[0].clone();
		assert!(test_utils::wait_for(|| harness.notifier.pending_conf_count(&sweep.txid()) > 0));
		harness.notifier.confirm_transaction(sweep.txid(), 151, sweep.clone());
		assert!(test_utils::wait_for(|| harness.channels.is_fully_closed(&channel_point)));
	}

	#[test]
	fn shutdown_leaves_preschool_untouched() {
		let harness = new_harness(100);
		let channel_point = test_utils::channel_point(7);
		harness.add_pending_close(channel_point, 100);
		let close_txid = test_utils::dummy_txid(0x63);
		UtxoNursery::incubate(
			&harness.nursery,
			channel_point,
			Some(commit_resolution(close_txid, 500_000, 144)),
			vec![],
			vec![],
		)
		.unwrap();

		harness.shutdown.trigger();
		harness.notifier.close_all();
		// The confirmation task exits without promoting anything.
		std::thread::sleep(std::time::Duration::from_millis(50));
		let (preschool, _) = harness.store().preschool_outputs().unwrap();
		assert_eq!(preschool.len(), 1);
		assert_eq!(harness.broadcaster.broadcast_count(), 0);
	}

	#[test]
	fn channel_report_buckets_by_stage() {
		let harness = new_harness(100);
		let channel_point = test_utils::channel_point(8);
		harness.add_pending_close(channel_point, 100);
		let close_txid = test_utils::dummy_txid(0x64);
		UtxoNursery::incubate(
			&harness.nursery,
			channel_point,
			Some(commit_resolution(close_txid, 500_000, 144)),
			vec![],
			vec![IncomingHtlcResolution {
				csv_delay: 144,
				claim_outpoint: test_utils::dummy_outpoint(0x54),
				sweep_sign_desc: test_utils::sign_descriptor(120_000, 7),
			}],
		)
		.unwrap();

		let report = harness.nursery.channel_report(&channel_point).unwrap().unwrap();
		assert_eq!(report.limbo_balance, 620_000);
		assert_eq!(report.recovered_balance, 0);
		assert_eq!(report.outputs.len(), 2);
		assert!(report.outputs.iter().all(|entry| entry.stage == NurseryStage::Preschool));
		assert!(report
			.outputs
			.iter()
			.any(|entry| entry.description == "incoming HTLC (second level)"));

		assert!(harness.nursery.channel_report(&test_utils::channel_point(99)).unwrap().is_none());
	}
}
