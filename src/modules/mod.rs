//! Low-level building blocks of the quantizer.
//!
//! The codebook owns the embedding table and the nearest-neighbor search; the
//! projections are the 1x1 convolutions around it.

pub mod codebook;
pub mod projection;
