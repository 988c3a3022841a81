use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context};
use candle_core::{DType, Device, Tensor};
use clap::Parser;
use soma_decode::{
    CacheDType, DecodeCache, DeviceKind, GenerationConfig, LayerCaches, WritePositions,
    WriteStrategy,
};
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "soma-decode")]
#[command(about = "Drive a synthetic decode loop through the preallocated KV cache")]
struct Args {
    /// JSON generation config; flags below override its fields
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    num_heads: Option<usize>,

    #[arg(long)]
    head_dim: Option<usize>,

    #[arg(long)]
    num_layers: Option<usize>,

    /// Cache capacity along the sequence axis
    #[arg(long)]
    max_seq_len: Option<usize>,

    /// Positions written by the prefill call
    #[arg(long, default_value = "16")]
    prefill: usize,

    /// Decode steps after prefill (default: fill the cache)
    #[arg(long)]
    steps: Option<usize>,

    #[arg(long, value_enum)]
    device: Option<DeviceKind>,

    #[arg(long, value_enum)]
    dtype: Option<CacheDType>,

    /// Skip the capability probe and use slice assignment
    #[arg(long)]
    force_slice_assign: bool,
}

impl Args {
    fn generation_config(&self) -> anyhow::Result<GenerationConfig> {
        let mut config = match &self.config {
            Some(path) => GenerationConfig::from_json_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => GenerationConfig::default(),
        };

        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(num_heads) = self.num_heads {
            config.num_heads = num_heads;
        }
        if let Some(head_dim) = self.head_dim {
            config.head_dim = head_dim;
        }
        if let Some(num_layers) = self.num_layers {
            config.num_layers = num_layers;
        }
        if let Some(max_seq_len) = self.max_seq_len {
            config.max_seq_len = max_seq_len;
        }
        if let Some(device) = self.device {
            config.device = device;
        }
        if let Some(dtype) = self.dtype {
            config.dtype = dtype;
        }
        config.force_slice_assign |= self.force_slice_assign;

        config.validate()?;
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    let config = args.generation_config()?;

    println!("soma-decode v{}", env!("CARGO_PKG_VERSION"));

    let end = match args.steps {
        Some(steps) => args.prefill + steps,
        None => config.max_seq_len,
    };
    if args.prefill > config.max_seq_len || end > config.max_seq_len {
        bail!(
            "prefill {} with {:?} decode steps exceeds max_seq_len {}",
            args.prefill,
            args.steps,
            config.max_seq_len
        );
    }

    let device = config.device.to_device()?;
    let cache_config = config.cache_config();
    let mut caches = if config.force_slice_assign {
        LayerCaches::with_strategy(
            config.num_layers,
            &cache_config,
            &device,
            WriteStrategy::SliceAssign,
        )?
    } else {
        LayerCaches::new(config.num_layers, &cache_config, &device)?
    };

    info!(
        strategy = ?caches.strategy(),
        layers = caches.num_layers(),
        bytes = caches.total_size_bytes(),
        "decode caches ready"
    );

    let start = Instant::now();
    if args.prefill > 0 {
        write_all_layers(&mut caches, 0..args.prefill, &device)?;
    }
    let prefill_elapsed = start.elapsed();

    let decode_start = Instant::now();
    for pos in args.prefill..end {
        write_all_layers(&mut caches, pos, &device)?;
    }
    let decode_elapsed = decode_start.elapsed();
    let decode_steps = end - args.prefill;

    println!("Strategy: {:?}", caches.strategy());
    println!(
        "Cache: {} layers x {:?} {:?} ({:.1} MiB)",
        caches.num_layers(),
        cache_config.shape(),
        cache_config.dtype,
        caches.total_size_bytes() as f64 / (1024.0 * 1024.0)
    );
    println!("Prefill: {} positions in {:?}", args.prefill, prefill_elapsed);
    if decode_steps > 0 {
        println!(
            "Decode: {} steps in {:?} ({:?}/step)",
            decode_steps,
            decode_elapsed,
            decode_elapsed / decode_steps as u32
        );
    }
    println!("Filled: {}/{}", end, config.max_seq_len);

    Ok(())
}

/// Writes random keys and values at `positions` on every layer and checks
/// each layer reads them back exactly.
fn write_all_layers(
    caches: &mut LayerCaches,
    positions: impl Into<WritePositions>,
    device: &Device,
) -> anyhow::Result<()> {
    let positions: WritePositions = positions.into();
    for layer_idx in 0..caches.num_layers() {
        let cache = caches
            .layer_mut(layer_idx)
            .context("layer index within num_layers")?;
        let config = cache.config().clone();
        let shape = (
            config.batch_size,
            config.num_heads,
            positions.len(),
            config.head_dim,
        );
        let k = Tensor::randn(0.0f32, 1.0, shape, device)?.to_dtype(config.dtype)?;
        let v = Tensor::randn(0.0f32, 1.0, shape, device)?.to_dtype(config.dtype)?;

        cache.update(positions.clone(), &k, &v)?;
        verify(cache, &positions, &k, &v)
            .with_context(|| format!("layer {layer_idx} at {positions:?}"))?;
    }
    debug!(?positions, "all layers written");
    Ok(())
}

fn verify(
    cache: &DecodeCache,
    positions: &WritePositions,
    k: &Tensor,
    v: &Tensor,
) -> anyhow::Result<()> {
    for (i, pos) in positions.to_vec().into_iter().enumerate() {
        let (k_read, v_read) = cache.read_position(pos)?;
        if to_f32(&k_read)? != to_f32(&k.narrow(2, i, 1)?)?
            || to_f32(&v_read)? != to_f32(&v.narrow(2, i, 1)?)?
        {
            bail!("readback mismatch at position {pos}");
        }
    }
    Ok(())
}

fn to_f32(t: &Tensor) -> candle_core::Result<Vec<f32>> {
    t.to_dtype(DType::F32)?.flatten_all()?.to_vec1()
}
