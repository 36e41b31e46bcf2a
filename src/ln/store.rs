// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Durable state for the enforcement engines.
//!
//! All state lives in a single key-value store partitioned into logical
//! buckets, addressed by serialized channel points and outpoints. The
//! backend contract is deliberately tiny — point reads, prefix scans, and
//! atomic batches — so clients can put it on whatever database they already
//! run. Everything bucket-shaped lives in the typed facades here: a nursery
//! output's state IS the bucket its serialized form sits in, so every state
//! transition is one atomic batch moving bytes between buckets and updating
//! the height index alongside.
//!
//! Isolation between concurrent writers is provided by the owning engine's
//! lock, never by the store: each record has exactly one owning engine.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::ops::Deref;
use std::sync::Mutex;

use bitcoin::blockdata::transaction::Transaction;

use crate::chain::transaction::OutPoint;
use crate::ln::nursery::{BabyOutput, KidOutput};
use crate::ln::retribution::RetributionRecord;
use crate::util::byte_utils;
use crate::util::ser::{DecodeError, Readable, Writeable};

/// The logical namespaces of the enforcement store.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Bucket {
	/// Pending retribution records, keyed by channel point.
	Retribution,
	/// Finalized justice transactions, keyed by channel point.
	JusticeTxn,
	/// First-stage outputs awaiting their absolute expiry, keyed by channel
	/// point then claim outpoint.
	Crib,
	/// Outputs awaiting confirmation of their prerequisite transaction.
	Preschool,
	/// Outputs waiting out a relative or absolute maturity height.
	Kindergarten,
	/// Outputs fully swept and confirmed.
	Graduated,
	/// Height-keyed secondary index: which outputs come due at each height,
	/// plus the finalized sweep transaction for each processed height.
	HeightIndex,
	/// Highest height for which a kindergarten sweep has been finalized.
	LastFinalizedHeight,
	/// Highest height fully processed by the block-epoch handler.
	LastGraduatedHeight,
}

impl Bucket {
	fn prefix(&self) -> u8 {
		match self {
			&Bucket::Retribution => 0,
			&Bucket::JusticeTxn => 1,
			&Bucket::Crib => 2,
			&Bucket::Preschool => 3,
			&Bucket::Kindergarten => 4,
			&Bucket::Graduated => 5,
			&Bucket::HeightIndex => 6,
			&Bucket::LastFinalizedHeight => 7,
			&Bucket::LastGraduatedHeight => 8,
		}
	}
}

/// An error surfaced by the store.
#[derive(Debug)]
pub enum StoreError {
	/// The backing database failed; the current operation is aborted and no
	/// engine state advances.
	Backend(String),
	/// A record existed but its bytes failed to decode. The record is left
	/// in place for manual intervention.
	Corrupt(DecodeError),
	/// The record a transition expected to move was not present. Benign on
	/// replayed transitions.
	NotFound,
}

impl From<DecodeError> for StoreError {
	fn from(e: DecodeError) -> Self {
		StoreError::Corrupt(e)
	}
}

/// One write in an atomic batch.
pub enum StoreOp {
	/// Inserts or overwrites `key` in `bucket`.
	Put {
		/// Target bucket.
		bucket: Bucket,
		/// Key within the bucket.
		key: Vec<u8>,
		/// Serialized value.
		value: Vec<u8>,
	},
	/// Removes `key` from `bucket` if present.
	Delete {
		/// Target bucket.
		bucket: Bucket,
		/// Key within the bucket.
		key: Vec<u8>,
	},
}

/// A batch of writes which must be applied atomically: either every operation
/// becomes durable or none does. Partial application is a backend bug the
/// engines cannot recover from.
#[derive(Default)]
pub struct StoreUpdate {
	ops: Vec<StoreOp>,
}

impl StoreUpdate {
	/// Creates an empty batch.
	pub fn new() -> Self {
		StoreUpdate { ops: Vec::new() }
	}
	/// Queues an insert-or-overwrite.
	pub fn put(&mut self, bucket: Bucket, key: Vec<u8>, value: Vec<u8>) {
		self.ops.push(StoreOp::Put { bucket, key, value });
	}
	/// Queues a delete.
	pub fn delete(&mut self, bucket: Bucket, key: Vec<u8>) {
		self.ops.push(StoreOp::Delete { bucket, key });
	}
	/// The queued operations, in order.
	pub fn ops(&self) -> &[StoreOp] {
		&self.ops
	}
}

/// The backend contract the enforcement store runs on.
pub trait KVStore: Sync + Send {
	/// Reads a single value.
	fn read(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
	/// Lists all key/value pairs in `bucket` whose key starts with
	/// `key_prefix`, in ascending key order.
	fn list(&self, bucket: Bucket, key_prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;
	/// Applies a batch atomically.
	fn apply(&self, update: StoreUpdate) -> Result<(), StoreError>;
}

/// An in-memory backend, suitable for tests and for nodes which rebuild
/// enforcement state from their own database on startup.
pub struct MemoryStore {
	map: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
	/// Creates an empty store.
	pub fn new() -> Self {
		MemoryStore { map: Mutex::new(BTreeMap::new()) }
	}

	fn full_key(bucket: Bucket, key: &[u8]) -> Vec<u8> {
		let mut full = Vec::with_capacity(key.len() + 1);
		full.push(bucket.prefix());
		full.extend_from_slice(key);
		full
	}
}

impl Default for MemoryStore {
	fn default() -> Self {
		MemoryStore::new()
	}
}

impl KVStore for MemoryStore {
	fn read(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
		let map = self.map.lock().unwrap();
		Ok(map.get(&Self::full_key(bucket, key)).cloned())
	}

	fn list(&self, bucket: Bucket, key_prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
		let full_prefix = Self::full_key(bucket, key_prefix);
		let map = self.map.lock().unwrap();
		Ok(map
			.range(full_prefix.clone()..)
			.take_while(|(key, _)| key.starts_with(&full_prefix))
			.map(|(key, value)| (key[1..].to_vec(), value.clone()))
			.collect())
	}

	fn apply(&self, update: StoreUpdate) -> Result<(), StoreError> {
		let mut map = self.map.lock().unwrap();
		for op in update.ops {
			match op {
				StoreOp::Put { bucket, key, value } => {
					map.insert(Self::full_key(bucket, &key), value);
				},
				StoreOp::Delete { bucket, key } => {
					map.remove(&Self::full_key(bucket, &key));
				},
			}
		}
		Ok(())
	}
}

fn decode<T: Readable>(bytes: &[u8]) -> Result<T, DecodeError> {
	let mut cursor = Cursor::new(bytes);
	let value = T::read(&mut cursor)?;
	if (cursor.position() as usize) != bytes.len() {
		return Err(DecodeError::InvalidValue);
	}
	Ok(value)
}

/// Durable retribution state: pending records and finalized justice
/// transactions, keyed by channel point.
pub struct RetributionStore<K: Deref>
where
	K::Target: KVStore,
{
	db: K,
}

impl<K: Deref> RetributionStore<K>
where
	K::Target: KVStore,
{
	/// Wraps the given backend.
	pub fn new(db: K) -> Self {
		RetributionStore { db }
	}

	/// Persists a retribution record. Overwrites any prior record for the
	/// channel.
	pub fn add_retribution(&self, record: &RetributionRecord) -> Result<(), StoreError> {
		let mut update = StoreUpdate::new();
		update.put(Bucket::Retribution, record.channel_point.encode(), record.encode());
		self.db.apply(update)
	}

	/// Whether the channel is already marked breached.
	pub fn contains(&self, channel_point: &OutPoint) -> Result<bool, StoreError> {
		Ok(self.db.read(Bucket::Retribution, &channel_point.encode())?.is_some())
	}

	/// Persists the signed justice transaction for the channel, overwriting
	/// any prior entry: retries must rebroadcast the exact same bytes.
	pub fn finalize_justice_tx(&self, channel_point: &OutPoint, tx: &Transaction) -> Result<(), StoreError> {
		let mut update = StoreUpdate::new();
		update.put(Bucket::JusticeTxn, channel_point.encode(), tx.encode());
		self.db.apply(update)
	}

	/// Loads the finalized justice transaction for the channel, if any.
	pub fn justice_tx(&self, channel_point: &OutPoint) -> Result<Option<Transaction>, StoreError> {
		match self.db.read(Bucket::JusticeTxn, &channel_point.encode())? {
			Some(bytes) => Ok(Some(decode(&bytes)?)),
			None => Ok(None),
		}
	}

	/// Streams every stored retribution record to `f`. Backend errors and
	/// callback errors abort iteration; per-record decode failures are handed
	/// to the callback so it can skip them loudly.
	pub fn for_all_retributions<F>(&self, mut f: F) -> Result<(), StoreError>
	where
		F: FnMut(Result<RetributionRecord, DecodeError>) -> Result<(), StoreError>,
	{
		for (_, value) in self.db.list(Bucket::Retribution, &[])? {
			f(decode(&value))?;
		}
		Ok(())
	}

	/// Removes the channel's retribution record and justice transaction in
	/// one atomic batch. Called only once justice has confirmed.
	pub fn remove_retribution(&self, channel_point: &OutPoint) -> Result<(), StoreError> {
		let key = channel_point.encode();
		let mut update = StoreUpdate::new();
		update.delete(Bucket::Retribution, key.clone());
		update.delete(Bucket::JusticeTxn, key);
		self.db.apply(update)
	}
}

/// Which nursery bucket an output currently sits in.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NurseryStage {
	/// Waiting on its absolute expiry and first-stage broadcast.
	Crib,
	/// Waiting on confirmation of its prerequisite transaction.
	Preschool,
	/// Waiting out its maturity height.
	Kindergarten,
	/// Swept and confirmed.
	Graduated,
}

const HEIGHT_TAG_CRIB: u8 = 2;
const HEIGHT_TAG_KINDERGARTEN: u8 = 4;

/// Everything the block-epoch handler needs to know about one height: the
/// finalized sweep (if the height was already processed), the kindergarten
/// outputs due, and the first-stage outputs expiring.
pub struct HeightClass {
	/// Whether a sweep for this height has already been finalized (possibly
	/// as the empty marker).
	pub finalized: bool,
	/// The finalized sweep transaction, if one was needed.
	pub sweep_tx: Option<Transaction>,
	/// Kindergarten outputs maturing at this height.
	pub kinder: Vec<KidOutput>,
	/// First-stage outputs whose expiry is this height.
	pub babies: Vec<BabyOutput>,
	/// Index keys whose referenced records were missing or undecodable,
	/// skipped so one bad record cannot wedge the whole class.
	pub corrupt: Vec<Vec<u8>>,
}

fn height_prefix(height: u32) -> Vec<u8> {
	byte_utils::be32_to_array(height).to_vec()
}

fn nursery_key(kid: &KidOutput) -> Vec<u8> {
	let mut key = kid.origin_channel_point.encode();
	key.extend_from_slice(&kid.outpoint.encode());
	key
}

fn height_entry_key(height: u32, kid: &KidOutput) -> Vec<u8> {
	let mut key = height_prefix(height);
	key.extend_from_slice(&nursery_key(kid));
	key
}

/// Durable nursery state. An output's stage is encoded by the bucket holding
/// its serialized form; every transition is one atomic batch.
pub struct NurseryStore<K: Deref>
where
	K::Target: KVStore,
{
	db: K,
}

impl<K: Deref> NurseryStore<K>
where
	K::Target: KVStore,
{
	/// Wraps the given backend.
	pub fn new(db: K) -> Self {
		NurseryStore { db }
	}

	/// Persists a freshly incubated set of outputs in one batch: babies into
	/// the crib (indexed by expiry), preschool kids awaiting confirmation,
	/// and direct-CLTV kids straight into kindergarten (indexed by absolute
	/// maturity).
	pub fn incubate(
		&self, babies: &[BabyOutput], pscl_kids: &[KidOutput], kndr_kids: &[KidOutput],
	) -> Result<(), StoreError> {
		let mut update = StoreUpdate::new();
		for baby in babies {
			update.put(Bucket::Crib, nursery_key(&baby.kid), baby.encode());
			update.put(Bucket::HeightIndex, height_entry_key(baby.expiry, &baby.kid), vec![HEIGHT_TAG_CRIB]);
		}
		for kid in pscl_kids {
			update.put(Bucket::Preschool, nursery_key(kid), kid.encode());
		}
		for kid in kndr_kids {
			update.put(Bucket::Kindergarten, nursery_key(kid), kid.encode());
			update.put(
				Bucket::HeightIndex,
				height_entry_key(kid.maturity_height(), kid),
				vec![HEIGHT_TAG_KINDERGARTEN],
			);
		}
		self.db.apply(update)
	}

	/// Moves a kid whose prerequisite transaction confirmed from preschool to
	/// kindergarten, indexed at its maturity height. The kid must carry its
	/// confirmation height already.
	pub fn preschool_to_kinder(&self, kid: &KidOutput) -> Result<(), StoreError> {
		let key = nursery_key(kid);
		if self.db.read(Bucket::Preschool, &key)?.is_none() {
			return Err(StoreError::NotFound);
		}
		let mut update = StoreUpdate::new();
		update.delete(Bucket::Preschool, key.clone());
		update.put(Bucket::Kindergarten, key, kid.encode());
		update.put(
			Bucket::HeightIndex,
			height_entry_key(kid.maturity_height(), kid),
			vec![HEIGHT_TAG_KINDERGARTEN],
		);
		self.db.apply(update)
	}

	/// Moves a baby whose first-stage transaction confirmed from the crib to
	/// kindergarten. The embedded kid must carry its confirmation height.
	pub fn crib_to_kinder(&self, baby: &BabyOutput) -> Result<(), StoreError> {
		let key = nursery_key(&baby.kid);
		if self.db.read(Bucket::Crib, &key)?.is_none() {
			return Err(StoreError::NotFound);
		}
		let mut update = StoreUpdate::new();
		update.delete(Bucket::Crib, key.clone());
		update.delete(Bucket::HeightIndex, height_entry_key(baby.expiry, &baby.kid));
		update.put(Bucket::Kindergarten, key, baby.kid.encode());
		update.put(
			Bucket::HeightIndex,
			height_entry_key(baby.kid.maturity_height(), &baby.kid),
			vec![HEIGHT_TAG_KINDERGARTEN],
		);
		self.db.apply(update)
	}

	/// Persists the sweep transaction for a height before its first
	/// broadcast, or the empty marker when no sweep was needed, and advances
	/// the last-finalized counter. Overwrites idempotently.
	pub fn finalize_kinder(&self, height: u32, tx: Option<&Transaction>) -> Result<(), StoreError> {
		let mut update = StoreUpdate::new();
		let value = match tx {
			Some(tx) => tx.encode(),
			None => Vec::new(),
		};
		update.put(Bucket::HeightIndex, height_prefix(height), value);
		update.put(
			Bucket::LastFinalizedHeight,
			Vec::new(),
			byte_utils::be32_to_array(height).to_vec(),
		);
		self.db.apply(update)
	}

	/// Fetches everything due at `height`: the finalized sweep (if any), the
	/// kindergarten class, and expiring babies.
	pub fn fetch_class(&self, height: u32) -> Result<HeightClass, StoreError> {
		let mut class = HeightClass {
			finalized: false,
			sweep_tx: None,
			kinder: Vec::new(),
			babies: Vec::new(),
			corrupt: Vec::new(),
		};
		for (key, value) in self.db.list(Bucket::HeightIndex, &height_prefix(height))? {
			if key.len() == 4 {
				class.finalized = true;
				if !value.is_empty() {
					match decode(&value) {
						Ok(tx) => class.sweep_tx = Some(tx),
						Err(_) => class.corrupt.push(key),
					}
				}
				continue;
			}
			let record_key = &key[4..];
			let fetched = match value.first() {
				Some(&HEIGHT_TAG_CRIB) => {
					match self.db.read(Bucket::Crib, record_key)? {
						Some(bytes) => decode::<BabyOutput>(&bytes).map(|baby| class.babies.push(baby)),
						None => Err(DecodeError::InvalidValue),
					}
				},
				Some(&HEIGHT_TAG_KINDERGARTEN) => {
					match self.db.read(Bucket::Kindergarten, record_key)? {
						Some(bytes) => decode::<KidOutput>(&bytes).map(|kid| class.kinder.push(kid)),
						None => Err(DecodeError::InvalidValue),
					}
				},
				_ => Err(DecodeError::InvalidValue),
			};
			if fetched.is_err() {
				class.corrupt.push(key);
			}
		}
		Ok(class)
	}

	/// Moves a swept-and-confirmed kindergarten class to graduated and drops
	/// the height's index entries (including the finalized sweep) once empty.
	pub fn graduate_kinder(&self, height: u32, kids: &[KidOutput]) -> Result<(), StoreError> {
		let mut update = StoreUpdate::new();
		for kid in kids {
			let key = nursery_key(kid);
			update.delete(Bucket::Kindergarten, key.clone());
			update.delete(Bucket::HeightIndex, height_entry_key(height, kid));
			update.put(Bucket::Graduated, key, kid.encode());
		}
		update.delete(Bucket::HeightIndex, height_prefix(height));
		self.db.apply(update)
	}

	/// Drops the finalized marker for a height whose class has fully
	/// drained, so replay stops revisiting it.
	pub fn prune_finalized_marker(&self, height: u32) -> Result<(), StoreError> {
		let mut update = StoreUpdate::new();
		update.delete(Bucket::HeightIndex, height_prefix(height));
		self.db.apply(update)
	}

	/// The highest height with a finalized sweep, or 0.
	pub fn last_finalized_height(&self) -> Result<u32, StoreError> {
		self.read_height_counter(Bucket::LastFinalizedHeight)
	}

	/// The highest height fully processed by the block-epoch handler, or 0.
	pub fn last_graduated_height(&self) -> Result<u32, StoreError> {
		self.read_height_counter(Bucket::LastGraduatedHeight)
	}

	/// Records that the block-epoch handler finished processing `height`.
	pub fn set_last_graduated_height(&self, height: u32) -> Result<(), StoreError> {
		let mut update = StoreUpdate::new();
		update.put(
			Bucket::LastGraduatedHeight,
			Vec::new(),
			byte_utils::be32_to_array(height).to_vec(),
		);
		self.db.apply(update)
	}

	fn read_height_counter(&self, bucket: Bucket) -> Result<u32, StoreError> {
		match self.db.read(bucket, &[])? {
			Some(bytes) => {
				if bytes.len() != 4 {
					return Err(StoreError::Corrupt(DecodeError::InvalidValue));
				}
				Ok(byte_utils::slice_to_be32(&bytes))
			},
			None => Ok(0),
		}
	}

	/// Every kid currently awaiting prerequisite confirmation. Undecodable
	/// records are returned separately so the caller can log them.
	pub fn preschool_outputs(&self) -> Result<(Vec<KidOutput>, Vec<Vec<u8>>), StoreError> {
		let mut kids = Vec::new();
		let mut corrupt = Vec::new();
		for (key, value) in self.db.list(Bucket::Preschool, &[])? {
			match decode(&value) {
				Ok(kid) => kids.push(kid),
				Err(_) => corrupt.push(key),
			}
		}
		Ok((kids, corrupt))
	}

	/// Heights up to and including `up_to` which still carry any entry — a
	/// finalized sweep whose confirmation has not been observed, or outputs
	/// still waiting there. Ascending and deduplicated.
	pub fn active_heights(&self, up_to: u32) -> Result<Vec<u32>, StoreError> {
		let mut heights = std::collections::BTreeSet::new();
		for (key, _) in self.db.list(Bucket::HeightIndex, &[])? {
			if key.len() >= 4 {
				let height = byte_utils::slice_to_be32(&key[..4]);
				if height <= up_to {
					heights.insert(height);
				}
			}
		}
		Ok(heights.into_iter().collect())
	}

	/// Streams every output of the channel, with its current stage, to `f`.
	/// Backend and callback errors abort; per-record decode failures are
	/// handed to the callback.
	pub fn for_channel_outputs<F>(&self, channel_point: &OutPoint, mut f: F) -> Result<(), StoreError>
	where
		F: FnMut(Result<(NurseryStage, KidOutput), DecodeError>) -> Result<(), StoreError>,
	{
		let prefix = channel_point.encode();
		for (bucket, stage) in &[
			(Bucket::Crib, NurseryStage::Crib),
			(Bucket::Preschool, NurseryStage::Preschool),
			(Bucket::Kindergarten, NurseryStage::Kindergarten),
			(Bucket::Graduated, NurseryStage::Graduated),
		] {
			for (_, value) in self.db.list(*bucket, &prefix)? {
				let kid = match *stage {
					NurseryStage::Crib => decode::<BabyOutput>(&value).map(|baby| baby.kid),
					_ => decode::<KidOutput>(&value),
				};
				f(kid.map(|kid| (*stage, kid)))?;
			}
		}
		Ok(())
	}

	/// True iff the channel has no output left outside the graduated bucket.
	/// A channel unknown to the nursery is vacuously mature.
	pub fn is_mature(&self, channel_point: &OutPoint) -> Result<bool, StoreError> {
		let prefix = channel_point.encode();
		for bucket in &[Bucket::Crib, Bucket::Preschool, Bucket::Kindergarten] {
			if !self.db.list(*bucket, &prefix)?.is_empty() {
				return Ok(false);
			}
		}
		Ok(true)
	}

	/// Removes every record of the channel across all buckets, including any
	/// height-index entries still referencing it. Called only once the
	/// channel is fully mature.
	pub fn remove_channel(&self, channel_point: &OutPoint) -> Result<(), StoreError> {
		let prefix = channel_point.encode();
		let mut update = StoreUpdate::new();
		for bucket in &[Bucket::Crib, Bucket::Preschool, Bucket::Kindergarten, Bucket::Graduated] {
			for (key, _) in self.db.list(*bucket, &prefix)? {
				update.delete(*bucket, key);
			}
		}
		for (key, _) in self.db.list(Bucket::HeightIndex, &[])? {
			if key.len() > 4 && key[4..].starts_with(&prefix) {
				update.delete(Bucket::HeightIndex, key);
			}
		}
		self.db.apply(update)
	}
}
