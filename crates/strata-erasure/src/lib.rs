//! Strata Erasure - Reed-Solomon coding
//!
//! Maximum Distance Separable coding over `reed-solomon-simd`: any k of the
//! k+m shards reconstruct the original payload.

mod codec;

pub use codec::{ErasureCodec, ErasureError};
