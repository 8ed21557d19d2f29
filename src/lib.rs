//! level-cache: a multi-tier segmented object cache.
//!
//! Objects are split into fixed-size segments. New segments land in the
//! coldest tier; every read hit is copied one tier hotter. A central registry
//! records which segments exist, and a caller-defined auxiliary index drives
//! bulk deletion.

pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod transfer;

pub use cache::auxiliary::{AuxFactory, AuxSlot, Auxiliary, MapAuxiliary, Matcher};
pub use cache::id::ObjectId;
pub use cache::item::Item;
pub use cache::orchestrator::{Cache, Fetched};
pub use cache::promoter::{NoPromotion, OneLevelUp, PromotionPolicy, ToTop};
pub use cache::tier::TierStats;
pub use config::{BackendKind, CacheConfig, TierConfig};
pub use error::{Error, Result};
