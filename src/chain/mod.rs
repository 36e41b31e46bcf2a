// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Structs and traits which allow the enforcement engines to interact with
//! the bitcoin blockchain: fee estimation, transaction broadcast, signing,
//! and confirmation/spend notifications. All of them are implemented by the
//! client against its own chain backend.

pub mod chaininterface;
pub mod keysinterface;
pub mod notify;
pub mod transaction;
