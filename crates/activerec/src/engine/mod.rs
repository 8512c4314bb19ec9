//! Storage Engine Abstractions
//!
//! This module defines the seam between the active-record layer and the
//! persistence engine that actually owns query execution, flushing, and
//! transactions. The layer consumes these traits as black boxes; the
//! `memory` module provides the reference engine used by the test suite
//! and by embedders who want a zero-I/O store.

pub mod core;
pub mod memory;

// Re-export core traits and types
pub use self::core::*;
pub use memory::{MemoryConfiguration, MemoryStore};
