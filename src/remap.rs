//! Compaction of codebook indices to a known-used subset.
//!
//! A remap table lists which of the `n_e` full codebook indices are actually
//! used. Full indices are compacted to their position in the table and compact
//! indices expand back by direct lookup. The table is read once and never
//! changes afterwards.

use crate::config::{UnknownIndex, UnknownIndexName};
use crate::perf::{self, Metric};
use anyhow::{anyhow, bail, ensure, Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use safetensors::{Dtype, SafeTensors};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

/// Resolved policy for full indices that are missing from the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownIndexPolicy {
    /// Uniform draw in `[0, re_embed)`.
    Random,
    /// The extra slot reserved right after the table entries.
    Extra(i64),
    /// A fixed compact index.
    Fixed(i64),
}

/// Immutable remap table plus the unknown-index policy.
#[derive(Debug)]
pub struct RemapTable {
    used: Vec<i64>,
    positions: HashMap<i64, i64>,
    policy: UnknownIndexPolicy,
    re_embed: usize,
    rng: Mutex<StdRng>,
}

impl RemapTable {
    /// Build a table from the list of used full indices.
    ///
    /// Duplicate entries keep their first position. `seed` drives the random
    /// unknown-index policy; without one the generator is seeded from entropy.
    pub fn new(used: Vec<i64>, unknown_index: UnknownIndex, seed: Option<u64>) -> Result<Self> {
        ensure!(!used.is_empty(), "remap table is empty");

        let mut positions = HashMap::with_capacity(used.len());
        for (pos, &full) in used.iter().enumerate() {
            positions.entry(full).or_insert(pos as i64);
        }

        let base = used.len();
        let (policy, re_embed) = match unknown_index {
            UnknownIndex::Named(UnknownIndexName::Random) => (UnknownIndexPolicy::Random, base),
            UnknownIndex::Named(UnknownIndexName::Extra) => {
                (UnknownIndexPolicy::Extra(base as i64), base + 1)
            }
            UnknownIndex::Fixed(value) => {
                if value < 0 || value as usize >= base {
                    bail!("unknown_index {value} is outside the compact range [0, {base})");
                }
                (UnknownIndexPolicy::Fixed(value), base)
            }
        };

        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            used,
            positions,
            policy,
            re_embed,
            rng: Mutex::new(rng),
        })
    }

    /// Load the used-index list from disk and build the table.
    pub fn from_path(
        path: impl AsRef<Path>,
        unknown_index: UnknownIndex,
        seed: Option<u64>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let used = load_used_indices(path)
            .with_context(|| format!("failed to load remap table {}", path.display()))?;
        Self::new(used, unknown_index, seed)
    }

    /// Full indices listed in the table.
    pub fn used(&self) -> &[i64] {
        &self.used
    }

    /// Size of the compact index space.
    pub fn re_embed(&self) -> usize {
        self.re_embed
    }

    /// Resolved unknown-index policy.
    pub fn policy(&self) -> UnknownIndexPolicy {
        self.policy
    }

    /// Compact full indices using the table's own random source.
    ///
    /// `shape` must have a leading batch axis (rank >= 2).
    pub fn remap_to_used(&self, inds: &[i64], shape: &[usize]) -> Result<Vec<i64>> {
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| anyhow!("remap random source poisoned"))?;
        self.remap_to_used_with_rng(inds, shape, &mut *rng)
    }

    /// Compact full indices, drawing random replacements from `rng`.
    pub fn remap_to_used_with_rng<R: Rng + ?Sized>(
        &self,
        inds: &[i64],
        shape: &[usize],
        rng: &mut R,
    ) -> Result<Vec<i64>> {
        let _span = perf::span(Metric::RemapToUsed);
        check_batched(inds, shape)?;

        let mut unknown = 0u64;
        let compact = inds
            .iter()
            .map(|full| match self.positions.get(full) {
                Some(&pos) => pos,
                None => {
                    unknown += 1;
                    match self.policy {
                        UnknownIndexPolicy::Random => rng.gen_range(0..self.re_embed as i64),
                        UnknownIndexPolicy::Extra(slot) => slot,
                        UnknownIndexPolicy::Fixed(value) => value,
                    }
                }
            })
            .collect();

        if unknown > 0 {
            tracing::warn!(unknown, total = inds.len(), "indices missing from remap table");
            perf::add_count(Metric::UnknownIndices, unknown);
        }
        Ok(compact)
    }

    /// Expand compact indices back to full codebook indices.
    ///
    /// The extra unknown slot has no meaningful inverse and maps to full index 0.
    pub fn unmap_to_all(&self, inds: &[i64], shape: &[usize]) -> Result<Vec<i64>> {
        let _span = perf::span(Metric::UnmapToAll);
        check_batched(inds, shape)?;

        let base = self.used.len() as i64;
        let has_extra = self.re_embed > self.used.len();
        inds.iter()
            .map(|&compact| {
                if has_extra && compact >= base {
                    return Ok(0);
                }
                if compact < 0 || compact >= base {
                    bail!("compact index {compact} out of bounds for remap table of size {base}");
                }
                Ok(self.used[compact as usize])
            })
            .collect()
    }
}

/// Both remap directions need an explicit batch axis.
fn check_batched(inds: &[i64], shape: &[usize]) -> Result<()> {
    ensure!(
        shape.len() > 1,
        "index tensor must have a batch axis (rank >= 2), got shape {shape:?}"
    );
    let expected: usize = shape.iter().product();
    ensure!(
        expected == inds.len(),
        "index count {} does not match shape {shape:?}",
        inds.len()
    );
    Ok(())
}

/// Read a flat list of used indices from `.npy`, `.safetensors` or `.json`.
pub fn load_used_indices(path: &Path) -> Result<Vec<i64>> {
    let bytes = fs::read(path)?;
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("npy") => parse_npy_indices(&bytes),
        Some("safetensors") => parse_safetensors_indices(&bytes),
        Some("json") => Ok(serde_json::from_slice::<Vec<i64>>(&bytes)?),
        other => bail!("unsupported remap table format: {other:?}"),
    }
}

const NPY_MAGIC: &[u8] = b"\x93NUMPY";

/// Parse a 1-D integer array stored in NumPy's `.npy` format.
fn parse_npy_indices(bytes: &[u8]) -> Result<Vec<i64>> {
    ensure!(bytes.starts_with(NPY_MAGIC), "missing NPY magic");
    let major = *bytes.get(6).ok_or_else(|| anyhow!("truncated NPY header"))?;
    let (header_len, header_start) = match major {
        1 => {
            let raw = bytes.get(8..10).ok_or_else(|| anyhow!("truncated NPY header"))?;
            (u16::from_le_bytes([raw[0], raw[1]]) as usize, 10)
        }
        2 | 3 => {
            let raw = bytes.get(8..12).ok_or_else(|| anyhow!("truncated NPY header"))?;
            (u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize, 12)
        }
        other => bail!("unsupported NPY version {other}"),
    };
    let data_start = header_start + header_len;
    let header = bytes
        .get(header_start..data_start)
        .ok_or_else(|| anyhow!("truncated NPY header"))?;
    let header = std::str::from_utf8(header)?;

    let descr = npy_header_value(header, "descr")
        .and_then(|raw| raw.trim().strip_prefix('\'')?.split('\'').next())
        .ok_or_else(|| anyhow!("NPY header has no descr"))?;
    let shape = npy_header_value(header, "shape")
        .and_then(|raw| raw.trim().strip_prefix('(')?.split(')').next())
        .ok_or_else(|| anyhow!("NPY header has no shape"))?;
    let dims = shape
        .split(',')
        .map(str::trim)
        .filter(|dim| !dim.is_empty())
        .map(|dim| dim.parse::<usize>())
        .collect::<std::result::Result<Vec<_>, _>>()?;
    ensure!(dims.len() == 1, "remap table must be 1-D, got shape {dims:?}");

    let mut chars = descr.chars();
    let endian = chars.next();
    let kind = chars.as_str();
    ensure!(
        matches!(endian, Some('<' | '|')),
        "unsupported NPY byte order in {descr:?}"
    );
    let width: usize = kind
        .get(1..)
        .ok_or_else(|| anyhow!("bad NPY descr {descr}"))?
        .parse()?;
    let signed = match kind.chars().next() {
        Some('i') => true,
        Some('u') => false,
        _ => bail!("remap table must hold integers, got {descr}"),
    };

    let count = dims[0];
    let data_end = count
        .checked_mul(width)
        .and_then(|len| data_start.checked_add(len))
        .ok_or_else(|| anyhow!("NPY shape ({count},) is too large"))?;
    ensure!(
        bytes.len() == data_end,
        "NPY payload holds {} bytes, shape ({count},) of {descr} needs {}",
        bytes.len().saturating_sub(data_start),
        data_end - data_start
    );
    decode_le_ints(&bytes[data_start..], width, signed)
}

/// Find the raw text following `'key':` in a NumPy header dict.
fn npy_header_value<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    let needle = format!("'{key}':");
    let start = header.find(&needle)? + needle.len();
    Some(&header[start..])
}

fn parse_safetensors_indices(bytes: &[u8]) -> Result<Vec<i64>> {
    let tensors = SafeTensors::deserialize(bytes)?;
    let names = tensors.names();
    let name = if names.iter().any(|name| name.as_str() == "used") {
        "used".to_string()
    } else if names.len() == 1 {
        names[0].to_string()
    } else {
        bail!("safetensors remap table needs a tensor named `used`");
    };
    let tensor = tensors.tensor(&name)?;
    ensure!(
        tensor.shape().len() == 1,
        "remap table must be 1-D, got shape {:?}",
        tensor.shape()
    );
    let (width, signed) = match tensor.dtype() {
        Dtype::I64 => (8, true),
        Dtype::I32 => (4, true),
        Dtype::I16 => (2, true),
        Dtype::I8 => (1, true),
        Dtype::U64 => (8, false),
        Dtype::U32 => (4, false),
        Dtype::U16 => (2, false),
        Dtype::U8 => (1, false),
        other => bail!("remap table must hold integers, got {other:?}"),
    };
    decode_le_ints(tensor.data(), width, signed)
}

/// Decode little-endian integers of `width` bytes into `i64`.
fn decode_le_ints(data: &[u8], width: usize, signed: bool) -> Result<Vec<i64>> {
    ensure!(
        matches!(width, 1 | 2 | 4 | 8),
        "unsupported integer width {width}"
    );
    data.chunks_exact(width)
        .map(|chunk| {
            let mut buf = [0u8; 8];
            buf[..width].copy_from_slice(chunk);
            let raw = u64::from_le_bytes(buf);
            if signed {
                let shift = 64 - 8 * width as u32;
                Ok(((raw << shift) as i64) >> shift)
            } else {
                i64::try_from(raw).map_err(|_| anyhow!("index {raw} does not fit in i64"))
            }
        })
        .collect()
}
