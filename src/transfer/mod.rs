//! Segment storage backends and bounded fan-out.
//!
//! - [`store`]: the backend trait a tier drives
//! - [`disk_io`]: one file per segment, optionally zstd-compressed
//! - [`memory`]: segments in RAM, persisted only on dump
//! - [`pool`]: bounded worker pool used by dump and batch delete

pub mod disk_io;
pub mod memory;
pub mod pool;
pub mod store;
