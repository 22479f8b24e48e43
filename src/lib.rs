//! # Chaintable
//!
//! A concurrent, resizable, open-chaining hash table for read-heavy
//! workloads with concurrent writers and rare bulk maintenance.
//!
//! Chaintable combines three mechanisms:
//! - Lock-free chain reads guarded by a global-counter quiescence service
//! - A per-bucket spin lock packed into the bucket head pointer
//! - Incremental in-place grow/shrink by a factor of two, rewiring one
//!   chain link per quiescence barrier
//!
//! ## Design
//!
//! Values carry their own hash through a [`TableConfig`]; probes supply a
//! hash plus equality through a [`Lookup`]. The bucket head word encodes a
//! lock flag and a terminal redirect flag in its low bits, so a reader's
//! single acquire load observes the chain and the bucket state together.
//! During a resize, retired buckets redirect lookups into the sibling
//! table while untouched buckets keep serving single-key traffic.
//!
//! ## Performance
//!
//! - Lookups: lock-free, one acquire load per chain hop
//! - Updates: CAS at the bucket head, or the bucket lock for splices
//! - Maintenance: scans and bulk deletes amortize via per-bucket critical
//!   sections and chain prefetch

pub mod bucket;
pub mod config;
pub mod ordering;
pub mod prefetch;
pub mod smr;
pub mod table;

mod tracing_helpers;

pub use bucket::Node;
pub use config::{Lookup, TableConfig};
pub use table::{
    ConcurrentHashTable, DEFAULT_GROW_HINT, DEFAULT_START_SIZE_LOG2, MultiGetHandle,
    SIZE_BIG_LOG2, SIZE_SMALL_LOG2,
};
