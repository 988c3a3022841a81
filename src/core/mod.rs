//! Core infrastructure for soma-decode.
//!
//! This module contains the decode-time cache:
//! - WritePositions for the sequence positions of one update
//! - DecodeCache for one layer's preallocated keys and values
//! - LayerCaches for a full decoder stack sharing one probe result

pub mod decode_cache;
pub mod positions;

pub use decode_cache::{
    probe_indexed_write, DecodeCache, DecodeCacheConfig, LayerCaches, WriteStrategy,
};
pub use positions::WritePositions;
