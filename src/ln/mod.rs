// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The channel-enforcement machinery itself: output models, sweep planning,
//! durable state, and the two engines which drive force-closed channels'
//! outputs back into the wallet.

pub mod channels;
pub mod nursery;
pub mod retribution;
pub mod store;
pub mod sweep_utils;
pub mod sweeper;
