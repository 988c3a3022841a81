//! Integration tests for GenerationConfig loading.

use std::io::Write;

use candle_core::DType;
use soma_decode::{CacheDType, DeviceKind, Error, GenerationConfig, LayerCaches};

#[test]
fn test_load_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            "batch_size": 1,
            "num_heads": 4,
            "head_dim": 8,
            "num_layers": 3,
            "max_seq_len": 32,
            "dtype": "f16",
            "device": "cpu",
            "force_slice_assign": true
        }}"#
    )
    .unwrap();

    let config = GenerationConfig::from_json_file(file.path()).unwrap();

    assert_eq!(config.num_layers, 3);
    assert_eq!(config.dtype, CacheDType::F16);
    assert_eq!(config.device, DeviceKind::Cpu);
    assert!(config.force_slice_assign);

    let cache_config = config.cache_config();
    assert_eq!(cache_config.shape(), (1, 4, 32, 8));
    assert_eq!(cache_config.dtype, DType::F16);
}

#[test]
fn test_invalid_config_file_is_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{"head_dim": 0}}"#).unwrap();

    assert!(matches!(
        GenerationConfig::from_json_file(file.path()),
        Err(Error::Config(_))
    ));
}

#[test]
fn test_malformed_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "not json").unwrap();

    assert!(matches!(
        GenerationConfig::from_json_file(file.path()),
        Err(Error::Json(_))
    ));
}

#[test]
fn test_missing_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent.json");

    assert!(matches!(
        GenerationConfig::from_json_file(missing),
        Err(Error::Io(_))
    ));
}

#[test]
fn test_layer_caches_from_config() {
    let config = GenerationConfig {
        num_heads: 2,
        head_dim: 4,
        num_layers: 4,
        max_seq_len: 16,
        ..Default::default()
    };
    let device = config.device.to_device().unwrap();
    let caches = LayerCaches::new(config.num_layers, &config.cache_config(), &device).unwrap();

    assert_eq!(caches.num_layers(), 4);
    assert_eq!(caches.total_size_bytes(), config.total_cache_size_bytes());
}
