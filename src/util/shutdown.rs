// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! A process-wide shutdown signal shared by both enforcement engines.
//!
//! Engines check the flag at the top of every select loop and before every
//! state mutation; the notifier unblocks suspended waits by closing its
//! subscription channels. Triggering shutdown therefore causes every engine
//! task to return promptly without mutating persistent state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cloneable handle signalling that the process is exiting.
#[derive(Clone)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
	/// Creates a new, untriggered signal.
	pub fn new() -> Self {
		ShutdownSignal(Arc::new(AtomicBool::new(false)))
	}

	/// Flags the process as exiting. Idempotent.
	pub fn trigger(&self) {
		self.0.store(true, Ordering::Release);
	}

	/// Whether shutdown has been requested.
	pub fn is_triggered(&self) -> bool {
		self.0.load(Ordering::Acquire)
	}
}

impl Default for ShutdownSignal {
	fn default() -> Self {
		ShutdownSignal::new()
	}
}
