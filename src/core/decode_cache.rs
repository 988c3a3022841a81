//! Preallocated key/value cache for autoregressive decoding.
//!
//! A [`DecodeCache`] owns one key tensor and one value tensor, each allocated
//! once at full capacity and then written in place at the sequence positions
//! produced by the decode loop.
//!
//! ## Memory Layout
//!
//! Keys and values share the shape
//! `[batch, num_heads, max_seq_len, head_dim]`; dim 2 is the sequence axis.
//!
//! For a 24-layer decoder with 16 heads of 64 and 2048 positions in f16:
//! - Key cache per layer: `[1, 16, 2048, 64]` = 4 MiB
//! - Key + value, all layers: 192 MiB
//!
//! ## Write Strategies
//!
//! Not every candle backend implements an in-place scatter along an arbitrary
//! axis. Construction runs a one-shot probe on the target device and stores
//! the resulting [`WriteStrategy`] for the lifetime of the cache:
//! - [`WriteStrategy::IndexedScatter`]: `scatter_set` at any distinct positions.
//! - [`WriteStrategy::SliceAssign`]: `slice_set` over one contiguous run.

use std::panic::{self, AssertUnwindSafe};

use candle_core::{DType, Device, Tensor};
use tracing::{debug, trace};

use super::positions::WritePositions;
use crate::error::{Error, Result};

/// Sequence axis of the key/value tensors.
const SEQ_DIM: usize = 2;

/// Configuration for a decode cache.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeCacheConfig {
    /// Batch size.
    pub batch_size: usize,
    /// Number of attention heads stored per position.
    pub num_heads: usize,
    /// Capacity along the sequence axis.
    pub max_seq_len: usize,
    /// Dimension per head.
    pub head_dim: usize,
    /// Data type for cache tensors.
    pub dtype: DType,
}

impl DecodeCacheConfig {
    /// Create a new decode cache configuration.
    pub fn new(batch_size: usize, num_heads: usize, max_seq_len: usize, head_dim: usize) -> Self {
        Self {
            batch_size,
            num_heads,
            max_seq_len,
            head_dim,
            dtype: DType::F32,
        }
    }

    /// Set the data type.
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    /// Shape of the key (and value) tensor.
    pub fn shape(&self) -> (usize, usize, usize, usize) {
        (
            self.batch_size,
            self.num_heads,
            self.max_seq_len,
            self.head_dim,
        )
    }

    /// Memory size in bytes of one cache tensor (K or V).
    pub fn tensor_size_bytes(&self) -> usize {
        let elements = self.batch_size * self.num_heads * self.max_seq_len * self.head_dim;
        elements * self.dtype.size_in_bytes()
    }

    /// Memory size in bytes of both tensors.
    pub fn total_size_bytes(&self) -> usize {
        self.tensor_size_bytes() * 2 // K and V
    }

    /// Rejects zero dimensions and capacities that cannot be indexed with u32.
    pub fn validate(&self) -> Result<()> {
        let dims = [
            ("batch_size", self.batch_size),
            ("num_heads", self.num_heads),
            ("max_seq_len", self.max_seq_len),
            ("head_dim", self.head_dim),
        ];
        if let Some((name, _)) = dims.iter().find(|(_, value)| *value == 0) {
            return Err(Error::Config(format!("{name} must be greater than zero")));
        }
        if self.max_seq_len > u32::MAX as usize {
            return Err(Error::Config(format!(
                "max_seq_len {} exceeds the u32 index range",
                self.max_seq_len
            )));
        }
        Ok(())
    }
}

/// How a cache writes new positions into its preallocated tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteStrategy {
    /// In-place scatter along the sequence axis; any set of distinct positions.
    IndexedScatter,
    /// In-place slice assignment; one contiguous run per call.
    SliceAssign,
}

impl WriteStrategy {
    /// Whether this strategy accepts non-contiguous position sets.
    pub fn supports_indexed_write(self) -> bool {
        matches!(self, Self::IndexedScatter)
    }

    /// Maps the outcome of a probe run to a strategy.
    ///
    /// Anything other than a clean, verified write falls back to slice
    /// assignment.
    fn from_probe_outcome(outcome: std::thread::Result<candle_core::Result<bool>>) -> Self {
        match outcome {
            Ok(Ok(true)) => Self::IndexedScatter,
            Ok(Ok(false)) => {
                debug!("indexed write probe read back wrong values");
                Self::SliceAssign
            }
            Ok(Err(err)) => {
                debug!(error = %err, "indexed write probe failed");
                Self::SliceAssign
            }
            Err(_) => {
                debug!("indexed write probe panicked");
                Self::SliceAssign
            }
        }
    }
}

/// Probes whether `device` supports an in-place indexed write for `dtype`.
///
/// Writes one element into a throwaway 2-element buffer with `scatter_set`
/// and checks the readback. Never fails: an unrecognized failure selects
/// [`WriteStrategy::SliceAssign`].
pub fn probe_indexed_write(dtype: DType, device: &Device) -> WriteStrategy {
    // Some backends panic on missing kernels rather than returning an error.
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| try_indexed_write(dtype, device)));
    let strategy = WriteStrategy::from_probe_outcome(outcome);
    debug!(?device, ?dtype, ?strategy, "indexed write probe finished");
    strategy
}

fn try_indexed_write(dtype: DType, device: &Device) -> candle_core::Result<bool> {
    let buffer = Tensor::zeros(2, dtype, device)?;
    let index = Tensor::new(&[0u32], device)?;
    let source = Tensor::ones(1, dtype, device)?;
    buffer.scatter_set(&index, &source, 0)?;
    let readback = buffer.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    Ok(readback == [1.0, 0.0])
}

/// Key/value cache for one attention layer of one generation request.
#[derive(Debug)]
pub struct DecodeCache {
    /// Key cache: [batch, num_heads, max_seq_len, head_dim]
    keys: Tensor,
    /// Value cache: [batch, num_heads, max_seq_len, head_dim]
    values: Tensor,
    /// Selected once at construction.
    strategy: WriteStrategy,
    /// One past the highest position written.
    filled_len: usize,
    /// Configuration.
    config: DecodeCacheConfig,
    /// Device.
    device: Device,
}

impl DecodeCache {
    /// Allocates a zeroed cache and probes the device for indexed writes.
    pub fn new(config: &DecodeCacheConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let strategy = probe_indexed_write(config.dtype, device);
        Self::with_strategy(config, device, strategy)
    }

    /// Allocates a zeroed cache with a known strategy, skipping the probe.
    pub fn with_strategy(
        config: &DecodeCacheConfig,
        device: &Device,
        strategy: WriteStrategy,
    ) -> Result<Self> {
        config.validate()?;

        let keys = Tensor::zeros(config.shape(), config.dtype, device)?;
        let values = Tensor::zeros(config.shape(), config.dtype, device)?;

        debug!(
            shape = ?config.shape(),
            dtype = ?config.dtype,
            ?strategy,
            bytes = config.total_size_bytes(),
            "allocated decode cache"
        );

        Ok(Self {
            keys,
            values,
            strategy,
            filled_len: 0,
            config: config.clone(),
            device: device.clone(),
        })
    }

    /// Writes `key_update` and `value_update` at `positions` in place.
    ///
    /// Both updates must be shaped `[batch, num_heads, positions.len(), head_dim]`.
    /// Every check runs before the first write, so a rejected call leaves the
    /// cache unchanged.
    pub fn update(
        &mut self,
        positions: impl Into<WritePositions>,
        key_update: &Tensor,
        value_update: &Tensor,
    ) -> Result<()> {
        let positions: WritePositions = positions.into();
        positions.validate(self.config.max_seq_len)?;
        self.check_update("key", key_update, positions.len())?;
        self.check_update("value", value_update, positions.len())?;

        let key_update = key_update.contiguous()?;
        let value_update = value_update.contiguous()?;

        match self.strategy {
            WriteStrategy::IndexedScatter => {
                let index = self.scatter_index(&positions)?;
                self.keys.scatter_set(&index, &key_update, SEQ_DIM)?;
                self.values.scatter_set(&index, &value_update, SEQ_DIM)?;
            }
            WriteStrategy::SliceAssign => {
                let start = positions.contiguous_start().ok_or_else(|| {
                    Error::NonContiguousPositions {
                        positions: positions.to_vec(),
                    }
                })?;
                self.keys.slice_set(&key_update, SEQ_DIM, start)?;
                self.values.slice_set(&value_update, SEQ_DIM, start)?;
            }
        }

        self.filled_len = self.filled_len.max(positions.end());
        trace!(?positions, filled_len = self.filled_len, "decode cache updated");
        Ok(())
    }

    /// Builds a u32 index tensor matching the update shape, with each
    /// position broadcast over batch, heads and features.
    fn scatter_index(&self, positions: &WritePositions) -> Result<Tensor> {
        let indices: Vec<u32> = positions.to_vec().into_iter().map(|p| p as u32).collect();
        let len = indices.len();
        let index = Tensor::from_vec(indices, (1, 1, len, 1), &self.device)?
            .broadcast_as((
                self.config.batch_size,
                self.config.num_heads,
                len,
                self.config.head_dim,
            ))?
            .contiguous()?;
        Ok(index)
    }

    fn check_update(&self, tensor: &'static str, update: &Tensor, len: usize) -> Result<()> {
        let expected = [
            self.config.batch_size,
            self.config.num_heads,
            len,
            self.config.head_dim,
        ];
        if update.dims() != expected {
            return Err(Error::ShapeMismatch {
                tensor,
                expected: expected.to_vec(),
                actual: update.dims().to_vec(),
            });
        }
        if update.dtype() != self.config.dtype {
            return Err(Error::DTypeMismatch {
                expected: self.config.dtype,
                actual: update.dtype(),
            });
        }
        Ok(())
    }

    /// Get the full key tensor.
    pub fn keys(&self) -> &Tensor {
        &self.keys
    }

    /// Get the full value tensor.
    pub fn values(&self) -> &Tensor {
        &self.values
    }

    /// Keys narrowed to `[0, filled_len)` along the sequence axis.
    pub fn keys_window(&self) -> Result<Tensor> {
        Ok(self.keys.narrow(SEQ_DIM, 0, self.filled_len)?)
    }

    /// Values narrowed to `[0, filled_len)` along the sequence axis.
    pub fn values_window(&self) -> Result<Tensor> {
        Ok(self.values.narrow(SEQ_DIM, 0, self.filled_len)?)
    }

    /// Key and value slices at one position.
    ///
    /// # Returns
    ///
    /// Tensors of shape `[batch, num_heads, 1, head_dim]`
    pub fn read_position(&self, position: usize) -> Result<(Tensor, Tensor)> {
        WritePositions::Step(position).validate(self.config.max_seq_len)?;
        let key = self.keys.narrow(SEQ_DIM, position, 1)?;
        let value = self.values.narrow(SEQ_DIM, position, 1)?;
        Ok((key, value))
    }

    /// One past the highest position written so far.
    pub fn filled_len(&self) -> usize {
        self.filled_len
    }

    pub fn max_seq_len(&self) -> usize {
        self.config.max_seq_len
    }

    /// Get the write strategy selected at construction.
    pub fn strategy(&self) -> WriteStrategy {
        self.strategy
    }

    pub fn supports_indexed_write(&self) -> bool {
        self.strategy.supports_indexed_write()
    }

    /// Get the configuration.
    pub fn config(&self) -> &DecodeCacheConfig {
        &self.config
    }

    /// Get the device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Bytes held by the key and value tensors.
    pub fn memory_size_bytes(&self) -> usize {
        self.config.total_size_bytes()
    }
}

/// Decode caches for every attention layer of one generation request.
#[derive(Debug)]
pub struct LayerCaches {
    /// Per-layer caches.
    layers: Vec<DecodeCache>,
    /// Shared by every layer.
    strategy: WriteStrategy,
}

impl LayerCaches {
    /// Probes the device once and allocates `num_layers` caches with the result.
    pub fn new(num_layers: usize, config: &DecodeCacheConfig, device: &Device) -> Result<Self> {
        if num_layers == 0 {
            return Err(Error::Config("num_layers must be greater than zero".into()));
        }
        config.validate()?;
        let strategy = probe_indexed_write(config.dtype, device);
        Self::with_strategy(num_layers, config, device, strategy)
    }

    /// Allocates `num_layers` caches with a known strategy.
    pub fn with_strategy(
        num_layers: usize,
        config: &DecodeCacheConfig,
        device: &Device,
        strategy: WriteStrategy,
    ) -> Result<Self> {
        if num_layers == 0 {
            return Err(Error::Config("num_layers must be greater than zero".into()));
        }
        let layers = (0..num_layers)
            .map(|_| DecodeCache::with_strategy(config, device, strategy))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { layers, strategy })
    }

    /// Get the cache for a specific layer.
    pub fn layer(&self, layer_idx: usize) -> Option<&DecodeCache> {
        self.layers.get(layer_idx)
    }

    /// Get mutable access to a layer's cache.
    pub fn layer_mut(&mut self, layer_idx: usize) -> Option<&mut DecodeCache> {
        self.layers.get_mut(layer_idx)
    }

    /// Writes one layer's keys and values; see [`DecodeCache::update`].
    pub fn update(
        &mut self,
        layer_idx: usize,
        positions: impl Into<WritePositions>,
        key_update: &Tensor,
        value_update: &Tensor,
    ) -> Result<()> {
        let num_layers = self.layers.len();
        let layer = self
            .layers
            .get_mut(layer_idx)
            .ok_or(Error::LayerOutOfBounds {
                layer: layer_idx,
                num_layers,
            })?;
        layer.update(positions, key_update, value_update)
    }

    /// Get the number of layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn strategy(&self) -> WriteStrategy {
        self.strategy
    }

    /// Bytes held by all layers, keys and values.
    pub fn total_size_bytes(&self) -> usize {
        self.layers.iter().map(DecodeCache::memory_size_bytes).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DecodeCache> {
        self.layers.iter()
    }
}
