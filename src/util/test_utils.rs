// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::Deref;
use std::sync::mpsc::{self, Sender};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use bitcoin::blockdata::script::Script;
use bitcoin::blockdata::transaction::{OutPoint as BitcoinOutPoint, Transaction, TxIn, TxOut};
use bitcoin::hash_types::{BlockHash, Txid, WPubkeyHash};
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::util::sighash::SighashCache;
use bitcoin::{EcdsaSighashType, PackedLockTime, Sequence, Witness};

use crate::chain::chaininterface::{BroadcastError, BroadcasterInterface, ConfirmationTarget, FeeEstimator};
use crate::chain::keysinterface::{KeysInterface, SignDescriptor};
use crate::chain::notify::{BlockEpochWatch, ChainNotifier, ConfirmationWatch, SpendDetail, SpendWatch, TxConfirmation};
use crate::chain::transaction::OutPoint;
use crate::ln::channels::{ChannelCloseSummary, ChannelRegistry, LinkCloseReason, LinkController};
use crate::ln::nursery::{BabyOutput, KidOutput};
use crate::ln::retribution::RetributionRecord;
use crate::ln::store::StoreError;
use crate::ln::sweep_utils::{BreachedOutput, WitnessType};
use crate::util::byte_utils;
use crate::util::logger::{Level, Logger, Record};

pub struct TestLogger {
	pub lines: Mutex<Vec<(Level, String)>>,
}

impl TestLogger {
	pub fn new() -> Self {
		TestLogger { lines: Mutex::new(Vec::new()) }
	}

	pub fn assert_log_contains(&self, fragment: &str) {
		let lines = self.lines.lock().unwrap();
		assert!(
			lines.iter().any(|(_, line)| line.contains(fragment)),
			"no log line contains {:?}; got {:?}", fragment, *lines
		);
	}
}

impl Logger for TestLogger {
	fn log(&self, record: &Record) {
		let line = format!("{}", record.args);
		println!("{:<5} [{} : {}] {}", record.level, record.module_path, record.line, line);
		self.lines.lock().unwrap().push((record.level, line));
	}
}

pub struct TestFeeEstimator {
	pub background: Mutex<u64>,
	pub normal: Mutex<u64>,
	pub high_priority: Mutex<u64>,
}

impl TestFeeEstimator {
	pub fn new(sat_per_1000_weight: u64) -> Self {
		Self::with_targets(sat_per_1000_weight, sat_per_1000_weight, sat_per_1000_weight)
	}

	pub fn with_targets(background: u64, normal: u64, high_priority: u64) -> Self {
		TestFeeEstimator {
			background: Mutex::new(background),
			normal: Mutex::new(normal),
			high_priority: Mutex::new(high_priority),
		}
	}
}

impl FeeEstimator for TestFeeEstimator {
	fn get_est_sat_per_1000_weight(&self, confirmation_target: ConfirmationTarget) -> u64 {
		match confirmation_target {
			ConfirmationTarget::Background => *self.background.lock().unwrap(),
			ConfirmationTarget::Normal => *self.normal.lock().unwrap(),
			ConfirmationTarget::HighPriority => *self.high_priority.lock().unwrap(),
		}
	}
}

pub struct TestBroadcaster {
	pub txn_broadcasted: Mutex<Vec<Transaction>>,
	pub scripted_results: Mutex<VecDeque<Result<(), BroadcastError>>>,
}

impl TestBroadcaster {
	pub fn new() -> Self {
		TestBroadcaster {
			txn_broadcasted: Mutex::new(Vec::new()),
			scripted_results: Mutex::new(VecDeque::new()),
		}
	}

	pub fn script_result(&self, result: Result<(), BroadcastError>) {
		self.scripted_results.lock().unwrap().push_back(result);
	}

	pub fn broadcast_count(&self) -> usize {
		self.txn_broadcasted.lock().unwrap().len()
	}
}

impl BroadcasterInterface for TestBroadcaster {
	fn broadcast_transaction(&self, tx: &Transaction) -> Result<(), BroadcastError> {
		self.txn_broadcasted.lock().unwrap().push(tx.clone());
		self.scripted_results.lock().unwrap().pop_front().unwrap_or(Ok(()))
	}
}

fn placeholder_tx() -> Transaction {
	Transaction { version: 2, lock_time: PackedLockTime(0), input: vec![], output: vec![] }
}

pub struct TestChainNotifier {
	pub best_height: Mutex<u32>,
	scripted_confs: Mutex<HashMap<Txid, TxConfirmation>>,
	auto_confirm_at: Mutex<Option<u32>>,
	scripted_spends: Mutex<HashMap<BitcoinOutPoint, SpendDetail>>,
	pending_confs: Mutex<HashMap<Txid, Vec<Sender<TxConfirmation>>>>,
	pending_spends: Mutex<HashMap<BitcoinOutPoint, Vec<Sender<SpendDetail>>>>,
	epoch_senders: Mutex<Vec<Sender<u32>>>,
	pub conf_requests: Mutex<Vec<(Txid, u32, u32)>>,
	pub spend_requests: Mutex<Vec<(BitcoinOutPoint, u32)>>,
}

impl TestChainNotifier {
	pub fn new(best_height: u32) -> Self {
		TestChainNotifier {
			best_height: Mutex::new(best_height),
			scripted_confs: Mutex::new(HashMap::new()),
			auto_confirm_at: Mutex::new(None),
			scripted_spends: Mutex::new(HashMap::new()),
			pending_confs: Mutex::new(HashMap::new()),
			pending_spends: Mutex::new(HashMap::new()),
			epoch_senders: Mutex::new(Vec::new()),
			conf_requests: Mutex::new(Vec::new()),
			spend_requests: Mutex::new(Vec::new()),
		}
	}

	/// Arranges for a confirmation to be delivered as soon as the txid is
	/// registered.
	pub fn script_confirmation(&self, txid: Txid, height: u32, tx: Transaction) {
		self.scripted_confs.lock().unwrap().insert(txid, TxConfirmation { height, tx });
	}

	/// Confirms every registration instantly at the given height.
	pub fn set_auto_confirm(&self, height: u32) {
		*self.auto_confirm_at.lock().unwrap() = Some(height);
	}

	/// Arranges for a spend to be delivered as soon as the outpoint is
	/// registered.
	pub fn script_spend(&self, outpoint: BitcoinOutPoint, detail: SpendDetail) {
		self.scripted_spends.lock().unwrap().insert(outpoint, detail);
	}

	/// Delivers a confirmation to every pending watch on the txid.
	pub fn confirm_transaction(&self, txid: Txid, height: u32, tx: Transaction) {
		if let Some(senders) = self.pending_confs.lock().unwrap().remove(&txid) {
			for sender in senders {
				let _ = sender.send(TxConfirmation { height, tx: tx.clone() });
			}
		}
	}

	/// Delivers a spend to every pending watch on the outpoint.
	pub fn send_spend(&self, outpoint: BitcoinOutPoint, detail: SpendDetail) {
		if let Some(senders) = self.pending_spends.lock().unwrap().remove(&outpoint) {
			for sender in senders {
				let _ = sender.send(detail.clone());
			}
		}
	}

	/// Connects a block: bumps the best height and wakes epoch subscribers.
	pub fn connect_block(&self, height: u32) {
		*self.best_height.lock().unwrap() = height;
		self.epoch_senders.lock().unwrap().retain(|sender| sender.send(height).is_ok());
	}

	/// Closes every outstanding subscription channel, as a notifier does on
	/// shutdown.
	pub fn close_all(&self) {
		self.pending_confs.lock().unwrap().clear();
		self.pending_spends.lock().unwrap().clear();
		self.epoch_senders.lock().unwrap().clear();
	}

	pub fn pending_conf_count(&self, txid: &Txid) -> usize {
		self.pending_confs.lock().unwrap().get(txid).map(|senders| senders.len()).unwrap_or(0)
	}
}

impl ChainNotifier for TestChainNotifier {
	fn register_confirmation(&self, txid: Txid, num_confs: u32, height_hint: u32) -> ConfirmationWatch {
		self.conf_requests.lock().unwrap().push((txid, num_confs, height_hint));
		let (sender, receiver) = mpsc::channel();
		if let Some(conf) = self.scripted_confs.lock().unwrap().remove(&txid) {
			let _ = sender.send(conf);
		} else if let Some(height) = *self.auto_confirm_at.lock().unwrap() {
			let _ = sender.send(TxConfirmation { height, tx: placeholder_tx() });
		} else {
			self.pending_confs.lock().unwrap().entry(txid).or_insert_with(Vec::new).push(sender);
		}
		ConfirmationWatch { events: receiver }
	}

	fn register_spend(&self, outpoint: BitcoinOutPoint, height_hint: u32) -> SpendWatch {
		self.spend_requests.lock().unwrap().push((outpoint, height_hint));
		let (sender, receiver) = mpsc::channel();
		if let Some(detail) = self.scripted_spends.lock().unwrap().remove(&outpoint) {
			let _ = sender.send(detail);
		} else {
			self.pending_spends.lock().unwrap().entry(outpoint).or_insert_with(Vec::new).push(sender);
		}
		SpendWatch { events: receiver }
	}

	fn register_block_epochs(&self) -> BlockEpochWatch {
		let (sender, receiver) = mpsc::channel();
		self.epoch_senders.lock().unwrap().push(sender);
		BlockEpochWatch { heights: receiver }
	}

	fn best_block_height(&self) -> u32 {
		*self.best_height.lock().unwrap()
	}
}

pub struct TestKeysInterface {
	secp_ctx: Secp256k1<All>,
	default_key: SecretKey,
	registered_keys: Mutex<HashMap<PublicKey, SecretKey>>,
	sweep_counter: Mutex<u64>,
}

impl TestKeysInterface {
	pub fn new() -> Self {
		TestKeysInterface {
			secp_ctx: Secp256k1::new(),
			default_key: SecretKey::from_slice(&[0x42; 32]).unwrap(),
			registered_keys: Mutex::new(HashMap::new()),
			sweep_counter: Mutex::new(0),
		}
	}

	pub fn register_key(&self, secret: SecretKey) {
		let pubkey = PublicKey::from_secret_key(&self.secp_ctx, &secret);
		self.registered_keys.lock().unwrap().insert(pubkey, secret);
	}

	pub fn sweep_scripts_issued(&self) -> u64 {
		*self.sweep_counter.lock().unwrap()
	}
}

impl KeysInterface for TestKeysInterface {
	fn get_sweep_script(&self) -> Script {
		let mut counter = self.sweep_counter.lock().unwrap();
		*counter += 1;
		sweep_script(*counter)
	}

	fn sign_sweep_input<T: Deref<Target = Transaction>>(
		&self, sighash_cache: &mut SighashCache<T>, input_index: usize, sign_desc: &SignDescriptor,
	) -> Result<Signature, ()> {
		let sighash = sighash_cache
			.segwit_signature_hash(input_index, &sign_desc.witness_script, sign_desc.output.value, sign_desc.sighash)
			.map_err(|_| ())?;
		let msg = Message::from_slice(&sighash[..]).map_err(|_| ())?;
		let registered_keys = self.registered_keys.lock().unwrap();
		let key = registered_keys.get(&sign_desc.pubkey).unwrap_or(&self.default_key);
		Ok(self.secp_ctx.sign_ecdsa(&msg, key))
	}
}

pub struct TestChannelRegistry {
	pub closed_channels: Mutex<HashMap<OutPoint, ChannelCloseSummary>>,
	pub fully_closed: Mutex<HashSet<OutPoint>>,
}

impl TestChannelRegistry {
	pub fn new() -> Self {
		TestChannelRegistry {
			closed_channels: Mutex::new(HashMap::new()),
			fully_closed: Mutex::new(HashSet::new()),
		}
	}

	pub fn add_closed_channel(&self, summary: ChannelCloseSummary) {
		if !summary.is_pending {
			self.fully_closed.lock().unwrap().insert(summary.channel_point);
		}
		self.closed_channels.lock().unwrap().insert(summary.channel_point, summary);
	}

	pub fn is_fully_closed(&self, channel_point: &OutPoint) -> bool {
		self.fully_closed.lock().unwrap().contains(channel_point)
	}
}

impl ChannelRegistry for TestChannelRegistry {
	fn fetch_closed_channels(&self, include_pending: bool) -> Result<Vec<ChannelCloseSummary>, StoreError> {
		Ok(self
			.closed_channels
			.lock()
			.unwrap()
			.values()
			.filter(|summary| include_pending || !summary.is_pending)
			.cloned()
			.collect())
	}

	fn fetch_close_summary(&self, channel_point: &OutPoint) -> Option<ChannelCloseSummary> {
		self.closed_channels.lock().unwrap().get(channel_point).cloned()
	}

	fn mark_channel_fully_closed(&self, channel_point: &OutPoint) -> Result<(), StoreError> {
		if let Some(summary) = self.closed_channels.lock().unwrap().get_mut(channel_point) {
			summary.is_pending = false;
		}
		self.fully_closed.lock().unwrap().insert(*channel_point);
		Ok(())
	}
}

pub struct TestLinkController {
	pub closed_links: Mutex<Vec<(OutPoint, LinkCloseReason)>>,
}

impl TestLinkController {
	pub fn new() -> Self {
		TestLinkController { closed_links: Mutex::new(Vec::new()) }
	}
}

impl LinkController for TestLinkController {
	fn close_link(&self, channel_point: &OutPoint, reason: LinkCloseReason) {
		self.closed_links.lock().unwrap().push((*channel_point, reason));
	}
}

/// Polls `cond` for up to two seconds, giving spawned follow-up tasks time
/// to run.
pub fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
	for _ in 0..2000 {
		if cond() {
			return true;
		}
		thread::sleep(Duration::from_millis(1));
	}
	false
}

pub fn secret(seed: u8) -> SecretKey {
	SecretKey::from_slice(&hex::decode(format!("{:02x}", seed.wrapping_add(1)).repeat(32)).unwrap()[..]).unwrap()
}

pub fn pubkey(seed: u8) -> PublicKey {
	let secp_ctx = Secp256k1::new();
	PublicKey::from_secret_key(&secp_ctx, &secret(seed))
}

pub fn dummy_txid(seed: u8) -> Txid {
	Txid::from_slice(&[seed; 32]).unwrap()
}

pub fn dummy_outpoint(seed: u8) -> BitcoinOutPoint {
	BitcoinOutPoint { txid: dummy_txid(seed.wrapping_add(0x10)), vout: 0 }
}

pub fn channel_point(seed: u8) -> OutPoint {
	OutPoint { txid: dummy_txid(seed.wrapping_add(0x80)), index: seed as u32 }
}

pub fn sweep_script(counter: u64) -> Script {
	let mut hash = [0u8; 20];
	hash[..8].copy_from_slice(&byte_utils::be64_to_array(counter));
	Script::new_v0_p2wpkh(&WPubkeyHash::from_slice(&hash).unwrap())
}

pub fn sign_descriptor(amount: u64, seed: u8) -> SignDescriptor {
	SignDescriptor {
		pubkey: pubkey(seed),
		single_tweak: None,
		double_tweak: None,
		witness_script: Script::from(vec![0x63, 0x52, 0x67, 0x51, 0x68, 0xac]),
		output: TxOut {
			value: amount,
			script_pubkey: Script::from(vec![0x00, 0x20, seed]),
		},
		sighash: EcdsaSighashType::All,
	}
}

pub fn breached_output(amount: u64, witness_type: WitnessType, seed: u8) -> BreachedOutput {
	BreachedOutput {
		amount,
		outpoint: dummy_outpoint(seed),
		witness_type,
		sign_desc: sign_descriptor(amount, seed),
		second_level_witness_script: Some(Script::from(vec![0x63, 0x51, 0x67, 0x52, 0x68, seed])),
	}
}

pub fn dummy_tx(seed: u8) -> Transaction {
	Transaction {
		version: 2,
		lock_time: PackedLockTime(0),
		input: vec![TxIn {
			previous_output: dummy_outpoint(seed.wrapping_add(0x30)),
			script_sig: Script::new(),
			sequence: Sequence(0xFFFF_FFFE),
			witness: Witness::default(),
		}],
		output: vec![TxOut {
			value: 9_000 + seed as u64,
			script_pubkey: sweep_script(seed as u64 + 1000),
		}],
	}
}

pub fn kid_output(seed: u8, amount: u64, csv_delay: u32, cltv_expiry: u32) -> KidOutput {
	KidOutput {
		amount,
		outpoint: dummy_outpoint(seed),
		origin_channel_point: channel_point(0x40 + seed),
		is_htlc: csv_delay == 0,
		blocks_to_maturity: csv_delay,
		absolute_maturity: cltv_expiry,
		conf_height: 0,
		witness_type: if csv_delay > 0 {
			WitnessType::CommitmentTimeLock
		} else {
			WitnessType::HtlcOfferedRemoteTimeout
		},
		sign_desc: sign_descriptor(amount, seed),
	}
}

pub fn baby_output(seed: u8, amount: u64, expiry: u32, csv_delay: u32) -> BabyOutput {
	let timeout_tx = dummy_tx(seed);
	let mut kid = kid_output(seed, amount, csv_delay, 0);
	kid.is_htlc = true;
	kid.witness_type = WitnessType::HtlcOfferedTimeoutSecondLevel;
	kid.outpoint = BitcoinOutPoint { txid: timeout_tx.txid(), vout: 0 };
	BabyOutput { expiry, timeout_tx, kid }
}

pub fn retribution_record(n_outputs: usize) -> RetributionRecord {
	let witness_types =
		[WitnessType::CommitmentRevoke, WitnessType::HtlcAcceptedRevoke, WitnessType::HtlcOfferedRevoke];
	RetributionRecord {
		commitment_txid: dummy_txid(0x77),
		channel_point: channel_point(0x55),
		chain_hash: BlockHash::from_slice(&[0x43; 32]).unwrap(),
		breach_height: 100,
		outputs: (0..n_outputs)
			.map(|i| breached_output(350_000 + i as u64, witness_types[i % witness_types.len()], i as u8))
			.collect(),
	}
}
