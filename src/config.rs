//! Configuration types for the vector-quantization bottleneck.
//!
//! Configurations are typically loaded from YAML files using [`load_config`].

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// How indices missing from the remap table are handled.
///
/// Serialized as `"random"`, `"extra"`, or a plain integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UnknownIndex {
    /// Named policy (`"random"` or `"extra"`).
    Named(UnknownIndexName),
    /// Fixed replacement index.
    Fixed(i64),
}

/// Named unknown-index policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownIndexName {
    /// Draw uniformly from `[0, re_embed)`.
    Random,
    /// Reserve one extra slot past the end of the table.
    Extra,
}

impl Default for UnknownIndex {
    fn default() -> Self {
        UnknownIndex::Named(UnknownIndexName::Random)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
/// Construction parameters for [`crate::model::quantizer::VectorQuantizer`].
pub struct QuantizerConfig {
    /// Codebook size.
    pub n_e: usize,
    /// Embedding dimensionality of each codebook vector.
    pub e_dim: usize,
    /// Commitment-loss weight.
    pub beta: f32,
    /// Channel count of the encoder output before projection.
    pub z_channels: usize,
    /// Optional path to the table of used indices.
    #[serde(default)]
    pub remap: Option<String>,
    /// Policy for indices absent from the remap table.
    #[serde(default)]
    pub unknown_index: UnknownIndex,
    /// Reshape emitted indices to `[batch, *spatial]` instead of flat.
    #[serde(default)]
    pub sane_index_shape: bool,
    /// Keep the historical beta placement (beta on the codebook term).
    #[serde(default = "default_true")]
    pub legacy: bool,
    /// Use 3-D (`[b, c, d, h, w]`) projections instead of 2-D.
    #[serde(default = "default_true")]
    pub use_voxel: bool,
    /// Seed for parameter init and random unknown-index draws.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Optional SafeTensors checkpoint with quantizer parameters.
    #[serde(default)]
    pub weights_path: Option<String>,
}

fn default_true() -> bool {
    true
}

impl QuantizerConfig {
    /// Create a config with required fields and defaults for the rest.
    pub fn new(n_e: usize, e_dim: usize, beta: f32, z_channels: usize) -> Self {
        Self {
            n_e,
            e_dim,
            beta,
            z_channels,
            remap: None,
            unknown_index: UnknownIndex::default(),
            sane_index_shape: false,
            legacy: true,
            use_voxel: true,
            seed: None,
            weights_path: None,
        }
    }

    /// Set the remap table path.
    pub fn with_remap(mut self, path: impl Into<String>) -> Self {
        self.remap = Some(path.into());
        self
    }

    /// Set the unknown-index policy.
    pub fn with_unknown_index(mut self, unknown_index: UnknownIndex) -> Self {
        self.unknown_index = unknown_index;
        self
    }

    /// Toggle spatially shaped index output.
    pub fn with_sane_index_shape(mut self, sane: bool) -> Self {
        self.sane_index_shape = sane;
        self
    }

    /// Toggle the legacy loss ordering.
    pub fn with_legacy(mut self, legacy: bool) -> Self {
        self.legacy = legacy;
        self
    }

    /// Select 3-D (`true`) or 2-D (`false`) projections.
    pub fn with_voxel(mut self, use_voxel: bool) -> Self {
        self.use_voxel = use_voxel;
        self
    }

    /// Seed init and random draws.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Reject values the quantizer cannot be built from.
    pub fn validate(&self) -> Result<()> {
        if self.n_e == 0 {
            bail!("n_e must be at least 1");
        }
        if self.e_dim == 0 {
            bail!("e_dim must be at least 1");
        }
        if self.z_channels == 0 {
            bail!("z_channels must be at least 1");
        }
        if !self.beta.is_finite() || self.beta < 0.0 {
            bail!("beta must be a non-negative finite number, got {}", self.beta);
        }
        Ok(())
    }
}

/// Load a quantizer configuration from a YAML file.
///
/// Relative `remap` and `weights_path` entries are resolved against the
/// directory containing the config file.
///
/// # Errors
///
/// Returns an error if the file doesn't exist, contains invalid YAML, or fails
/// [`QuantizerConfig::validate`].
pub fn load_config(path: impl AsRef<Path>) -> Result<QuantizerConfig> {
    let path = path.as_ref();
    if !path.exists() {
        bail!("Config file not found: {}", path.display());
    }

    let data = fs::read_to_string(path)?;
    let mut config: QuantizerConfig = serde_yaml::from_str(&data)?;
    config.validate()?;

    if let Some(remap) = config.remap.as_deref() {
        config.remap = Some(resolve_relative_path(path, remap).display().to_string());
    }
    if let Some(weights) = config.weights_path.as_deref() {
        config.weights_path = Some(resolve_relative_path(path, weights).display().to_string());
    }
    Ok(config)
}

/// Resolve a possibly relative path against a config file location.
pub fn resolve_relative_path(config_path: &Path, maybe_relative: &str) -> PathBuf {
    let candidate = Path::new(maybe_relative);
    if candidate.is_absolute() {
        return candidate.to_path_buf();
    }
    config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(candidate)
}
