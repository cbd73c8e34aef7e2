//! Command-line interface for the vector-quantization bottleneck.
//!
//! The CLI wraps [`VectorQuantizer`] to inspect a configuration, turn stored
//! latents into codebook indices, and decode indices back into latents.

#![recursion_limit = "256"]

use anyhow::{ensure, Result};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use burn_ndarray::{NdArray, NdArrayDevice};
use clap::ValueEnum;
use clap::{Parser, Subcommand};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use vqbook::config::load_config;
use vqbook::perf;
use vqbook::tensors::{fixed_dims, float_values, int_tensor};
use vqbook::weights::WeightTensor;
use vqbook::{SpatialLayout, VectorQuantizer};

#[cfg(feature = "backend-wgpu")]
use burn_wgpu::graphics::AutoGraphicsApi;
#[cfg(feature = "backend-wgpu")]
use burn_wgpu::{init_setup, Wgpu, WgpuDevice};

/// Backend the quantizer runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
enum BackendChoice {
    /// GPU through WGPU (requires the `backend-wgpu` feature).
    Wgpu,
    /// CPU through ndarray.
    Ndarray,
}

#[cfg(feature = "backend-wgpu")]
const DEFAULT_BACKEND: BackendChoice = BackendChoice::Wgpu;
#[cfg(not(feature = "backend-wgpu"))]
const DEFAULT_BACKEND: BackendChoice = BackendChoice::Ndarray;

#[derive(Parser)]
#[command(name = "vqbook")]
#[command(about = "Vector-quantization codebook bottleneck", long_about = None)]
struct Cli {
    /// Debug logging plus a timing summary on exit.
    #[arg(long, short, global = true)]
    verbose: bool,
    #[arg(long, value_enum, default_value_t = DEFAULT_BACKEND, global = true)]
    backend: BackendChoice,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Describe the quantizer a configuration builds.
    Info {
        /// Quantizer configuration YAML.
        #[arg(long)]
        config: PathBuf,
    },
    /// Quantize stored latents into codebook indices.
    Encode {
        /// Quantizer configuration YAML.
        #[arg(long)]
        config: PathBuf,
        /// SafeTensors file holding the latents.
        #[arg(long)]
        input: PathBuf,
        /// Name of the latent tensor inside the input file.
        #[arg(long, default_value = "z")]
        tensor: String,
        /// Output JSON path (stdout when omitted).
        #[arg(long)]
        output: Option<PathBuf>,
        /// Run the full forward pass and report the loss.
        #[arg(long)]
        forward: bool,
    },
    /// Decode codebook indices back into latents.
    Decode {
        /// Quantizer configuration YAML.
        #[arg(long)]
        config: PathBuf,
        /// Index JSON produced by `encode`.
        #[arg(long)]
        indices: PathBuf,
        /// Output SafeTensors path.
        #[arg(long)]
        output: PathBuf,
    },
}

/// Indices in the quantizer's emitted index space with their spatial shape.
#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    /// `[batch, *spatial]`.
    shape: Vec<usize>,
    /// Flat indices in row-major order.
    indices: Vec<i64>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let verbose = cli.verbose;

    match cli.backend {
        BackendChoice::Wgpu => {
            #[cfg(feature = "backend-wgpu")]
            {
                let device = WgpuDevice::default();
                init_setup::<AutoGraphicsApi>(&device, Default::default());
                run::<Wgpu>(cli.command, &device)?;
            }
            #[cfg(not(feature = "backend-wgpu"))]
            {
                anyhow::bail!("WGPU backend not enabled; build with --features backend-wgpu");
            }
        }
        BackendChoice::Ndarray => {
            let device = NdArrayDevice::default();
            run::<NdArray<f32>>(cli.command, &device)?;
        }
    }

    if verbose {
        eprintln!("{}", perf::report());
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "vqbook=debug" } else { "vqbook=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run<B: Backend>(command: Commands, device: &B::Device) -> Result<()> {
    match command {
        Commands::Info { config } => {
            let config = load_config(&config)?;
            let quantizer = VectorQuantizer::<B>::from_config(&config, device)?;
            println!("n_e: {}", quantizer.n_e());
            println!("e_dim: {}", quantizer.e_dim());
            println!("z_channels: {}", config.z_channels);
            println!("re_embed: {}", quantizer.re_embed());
            println!("layout: {}", quantizer.layout().name());
            println!("legacy: {}", quantizer.legacy);
            match quantizer.remap_table() {
                Some(table) => println!("unknown_index: {:?}", table.policy()),
                None => println!("remap: none"),
            }
        }
        Commands::Encode {
            config,
            input,
            tensor,
            output,
            forward,
        } => {
            let config = load_config(&config)?;
            let quantizer = VectorQuantizer::<B>::from_config(&config, device)?;
            let latents = read_latents(&input, &tensor)?;
            let encoded = match quantizer.layout() {
                SpatialLayout::Planar => encode::<B, 4>(&quantizer, &latents, forward, device)?,
                SpatialLayout::Volumetric => {
                    encode::<B, 5>(&quantizer, &latents, forward, device)?
                }
            };
            let json = serde_json::to_string(&encoded)?;
            match output {
                Some(path) => fs::write(path, json)?,
                None => println!("{json}"),
            }
        }
        Commands::Decode {
            config,
            indices,
            output,
        } => {
            let config = load_config(&config)?;
            let quantizer = VectorQuantizer::<B>::from_config(&config, device)?;
            let file: IndexFile = serde_json::from_str(&fs::read_to_string(&indices)?)?;
            let (values, shape) = match quantizer.layout() {
                SpatialLayout::Planar => decode::<B, 4>(&quantizer, file, device)?,
                SpatialLayout::Volumetric => decode::<B, 5>(&quantizer, file, device)?,
            };
            write_latents(&output, &values, shape)?;
        }
    }
    Ok(())
}

/// Map latents to indices in the quantizer's emitted index space.
fn encode<B: Backend, const D: usize>(
    quantizer: &VectorQuantizer<B>,
    latents: &WeightTensor,
    forward: bool,
    device: &B::Device,
) -> Result<IndexFile> {
    let dims = fixed_dims::<D>(&latents.shape)?;
    let z = Tensor::<B, D>::from_data(TensorData::new(latents.to_f32_vec()?, dims), device);
    let shape = std::iter::once(dims[0]).chain(dims[2..].iter().copied()).collect::<Vec<_>>();

    let indices = if forward {
        let output = quantizer.forward(z)?;
        let loss = float_values(output.loss);
        eprintln!("loss: {:.6}", loss.first().copied().unwrap_or(f32::NAN));
        output.info.indices.to_vec()
    } else {
        let full = quantizer.get_codebook_index(z)?.to_vec();
        match quantizer.remap_table() {
            Some(table) => {
                let per_item = full.len().checked_div(dims[0]).unwrap_or(0);
                table.remap_to_used(&full, &[dims[0], per_item])?
            }
            None => full,
        }
    };
    Ok(IndexFile { shape, indices })
}

/// Decode an index file into channel-first latents.
fn decode<B: Backend, const D: usize>(
    quantizer: &VectorQuantizer<B>,
    file: IndexFile,
    device: &B::Device,
) -> Result<(Vec<f32>, Vec<usize>)> {
    ensure!(
        file.shape.len() + 1 == D,
        "index shape {:?} does not fit the {} layout",
        file.shape,
        quantizer.layout().name()
    );
    let mut target = file.shape.clone();
    target.push(quantizer.e_dim());
    let target = fixed_dims::<D>(&target)?;

    let len = file.indices.len();
    let indices = int_tensor::<B, 1>(file.indices, [len], device);
    let latents = quantizer.decode_indices(indices, target)?;
    let shape = latents.dims().to_vec();
    Ok((float_values(latents), shape))
}

/// Read a named float tensor from a SafeTensors file.
fn read_latents(path: &Path, name: &str) -> Result<WeightTensor> {
    let bytes = fs::read(path)?;
    let tensors = SafeTensors::deserialize(&bytes)?;
    let tensor = tensors.tensor(name)?;
    Ok(WeightTensor::from_safetensor(tensor))
}

/// Write `f32` latents as a single tensor named `z`.
fn write_latents(path: &Path, values: &[f32], shape: Vec<usize>) -> Result<()> {
    let data: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    let view = TensorView::new(Dtype::F32, shape, &data)?;
    let bytes = safetensors::serialize(vec![("z".to_string(), view)], &None)?;
    fs::write(path, bytes)?;
    Ok(())
}
