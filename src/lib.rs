//! soma-decode: the key/value cache behind autoregressive shape generation.
//!
//! Each generation request allocates its caches once at full capacity and
//! writes every decode step in place:
//! - A one-shot device probe picks indexed scatter or slice assignment
//! - Bounds, shape and dtype are checked before any write
//! - Prefill runs and single decode steps share one `update` call
//! - One cache per decoder layer, all sharing the probe result

pub mod config;
pub mod error;

pub mod core;

pub use crate::core::{
    probe_indexed_write, DecodeCache, DecodeCacheConfig, LayerCaches, WritePositions,
    WriteStrategy,
};
pub use config::{CacheDType, DeviceKind, GenerationConfig};
pub use error::{Error, Result};
