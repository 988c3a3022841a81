//! Configuration types for soma-decode.

use std::path::Path;

use candle_core::{DType, Device};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::core::DecodeCacheConfig;
use crate::error::{Error, Result};

/// Element type of the cache tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CacheDType {
    F32,
    F16,
    Bf16,
}

impl From<CacheDType> for DType {
    fn from(dtype: CacheDType) -> Self {
        match dtype {
            CacheDType::F32 => DType::F32,
            CacheDType::F16 => DType::F16,
            CacheDType::Bf16 => DType::BF16,
        }
    }
}

/// Compute backend hosting the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Cuda,
    Metal,
}

impl DeviceKind {
    /// Opens ordinal 0 of this backend.
    ///
    /// Fails with a tensor error when the crate was built without the
    /// matching `cuda` or `metal` feature.
    pub fn to_device(self) -> Result<Device> {
        let device = match self {
            Self::Cpu => Device::Cpu,
            Self::Cuda => Device::new_cuda(0)?,
            Self::Metal => Device::new_metal(0)?,
        };
        Ok(device)
    }
}

/// Per-request generation configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Prompts decoded together.
    pub batch_size: usize,
    /// Number of attention heads.
    pub num_heads: usize,
    /// Dimension per head.
    pub head_dim: usize,
    /// Number of decoder layers, one cache each.
    pub num_layers: usize,
    /// Maximum generated sequence length (cache capacity).
    pub max_seq_len: usize,
    /// Cache element type.
    pub dtype: CacheDType,
    /// Compute backend.
    pub device: DeviceKind,
    /// Skip the capability probe and always use slice assignment.
    pub force_slice_assign: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            num_heads: 12,
            head_dim: 64,
            num_layers: 12,
            max_seq_len: 2048,
            dtype: CacheDType::F32,
            device: DeviceKind::Cpu,
            force_slice_assign: false,
        }
    }
}

impl GenerationConfig {
    /// Loads a config from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every dimension is usable for a cache allocation.
    pub fn validate(&self) -> Result<()> {
        if self.num_layers == 0 {
            return Err(Error::Config("num_layers must be greater than zero".into()));
        }
        self.cache_config().validate()
    }

    /// Cache configuration for one layer.
    pub fn cache_config(&self) -> DecodeCacheConfig {
        DecodeCacheConfig::new(
            self.batch_size,
            self.num_heads,
            self.max_seq_len,
            self.head_dim,
        )
        .with_dtype(self.dtype.into())
    }

    /// Total bytes for keys and values across all layers.
    pub fn total_cache_size_bytes(&self) -> usize {
        self.cache_config().total_size_bytes() * self.num_layers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = GenerationConfig::default();
        assert!(config.validate().is_ok());

        // 12 layers * 2 * (1 * 12 * 2048 * 64 * 4 bytes)
        assert_eq!(config.total_cache_size_bytes(), 12 * 2 * 6_291_456);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: GenerationConfig =
            serde_json::from_str(r#"{"max_seq_len": 64, "dtype": "bf16"}"#).unwrap();

        assert_eq!(config.max_seq_len, 64);
        assert_eq!(config.dtype, CacheDType::Bf16);
        assert_eq!(config.num_heads, 12);
        assert_eq!(config.cache_config().dtype, DType::BF16);
    }

    #[test]
    fn test_validate_rejects_zero_layers() {
        let config = GenerationConfig {
            num_layers: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_cpu_device() {
        assert!(DeviceKind::Cpu.to_device().unwrap().is_cpu());
    }
}
