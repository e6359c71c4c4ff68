//! Expiring caches with a single fixed TTL per table
//!
//! [`ExpiringTable`] is the engine behind both the peer table and the message
//! cache. [`Ticker`] advances its clock in the background.

pub mod table;
pub mod ticker;

pub use table::{ExpiringTable, ExpiryHooks};
pub use ticker::{Tick, Ticker};
