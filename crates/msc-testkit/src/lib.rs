//! Test support: in-memory store and message fixtures.

mod fixtures;
mod memory_store;

pub use fixtures::{scan_message_v1, scan_message_v2};
pub use memory_store::MemoryStore;
