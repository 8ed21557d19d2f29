//! Tiered segment cache.
//!
//! - [`id`]: 16-byte object identifiers
//! - [`item`]: per-object metadata and segment arithmetic
//! - [`registry`]: the authoritative catalogue of items and resident segments
//! - [`tier`]: one storage level with its own capacity and auxiliary index
//! - [`orchestrator`]: the [`Cache`](orchestrator::Cache) tying registry and tiers together
//! - [`evictor`]: FIFO capacity accounting for the bundled stores
//! - [`promoter`]: where a read hit gets copied to
//! - [`auxiliary`]: caller-defined secondary index
//! - [`compressor`]: zstd framing for on-disk segments

pub mod auxiliary;
pub mod compressor;
pub mod evictor;
pub mod id;
pub mod item;
pub mod orchestrator;
pub mod promoter;
pub mod registry;
pub mod tier;
