//! Reed-Solomon encoder/decoder
//!
//! The codec splits a payload into k equal data shards (zero-padding the
//! tail) and derives m parity shards. Decoding accepts any k surviving
//! shards; `reconstruct` additionally rebuilds the missing shards so a
//! repair pass can re-upload them.

use reed_solomon_simd::{ReedSolomonDecoder, ReedSolomonEncoder};
use strata_common::{EcParams, Error as CommonError};
use thiserror::Error;

/// Errors specific to erasure coding operations
#[derive(Debug, Error)]
pub enum ErasureError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("encoding failed: {0}")]
    EncodingFailed(String),

    #[error("decoding failed: {0}")]
    DecodingFailed(String),

    #[error("insufficient shards: have {available}, need {required}")]
    InsufficientShards { available: usize, required: usize },

    #[error("shard size mismatch")]
    ShardSizeMismatch,
}

impl From<ErasureError> for CommonError {
    fn from(e: ErasureError) -> Self {
        match e {
            ErasureError::InsufficientShards {
                available,
                required,
            } => CommonError::InsufficientShards {
                available,
                required,
            },
            other => CommonError::ErasureCoding(other.to_string()),
        }
    }
}

/// MDS Reed-Solomon codec for a fixed k+m geometry
pub struct ErasureCodec {
    params: EcParams,
}

impl ErasureCodec {
    /// Create a codec for the given parameters
    pub fn new(params: EcParams) -> Result<Self, ErasureError> {
        if params.data_shards == 0 {
            return Err(ErasureError::InvalidConfig("data_shards must be > 0".into()));
        }
        if params.parity_shards == 0 {
            return Err(ErasureError::InvalidConfig(
                "parity_shards must be > 0".into(),
            ));
        }
        if params.total_shards() > 255 {
            return Err(ErasureError::InvalidConfig(
                "total shards must be <= 255".into(),
            ));
        }
        Ok(Self { params })
    }

    #[must_use]
    pub fn data_shards(&self) -> usize {
        self.params.data_shards
    }

    #[must_use]
    pub fn parity_shards(&self) -> usize {
        self.params.parity_shards
    }

    #[must_use]
    pub fn total_shards(&self) -> usize {
        self.params.total_shards()
    }

    /// Shard size for a payload of `len` bytes
    ///
    /// Rounded up to a multiple of 64 to satisfy the SIMD backend's
    /// alignment requirement.
    fn shard_size_for(&self, len: usize) -> usize {
        let k = self.data_shards();
        let raw = len.div_ceil(k).max(1);
        raw.div_ceil(64) * 64
    }

    /// Encode a payload into k data shards followed by m parity shards
    pub fn encode(&self, data: &[u8]) -> Result<Vec<Vec<u8>>, ErasureError> {
        let k = self.data_shards();
        let m = self.parity_shards();
        let shard_size = self.shard_size_for(data.len());

        let mut padded = vec![0u8; shard_size * k];
        padded[..data.len()].copy_from_slice(data);

        let mut encoder = ReedSolomonEncoder::new(k, m, shard_size)
            .map_err(|e| ErasureError::InvalidConfig(e.to_string()))?;

        for i in 0..k {
            encoder
                .add_original_shard(&padded[i * shard_size..(i + 1) * shard_size])
                .map_err(|e| ErasureError::EncodingFailed(e.to_string()))?;
        }

        let result = encoder
            .encode()
            .map_err(|e| ErasureError::EncodingFailed(e.to_string()))?;

        let mut shards: Vec<Vec<u8>> = Vec::with_capacity(k + m);
        for i in 0..k {
            shards.push(padded[i * shard_size..(i + 1) * shard_size].to_vec());
        }
        for parity in result.recovery_iter() {
            shards.push(parity.to_vec());
        }

        Ok(shards)
    }

    /// Decode shards back to the original payload
    ///
    /// Takes a slice of `Option<Vec<u8>>` where `None` marks a missing
    /// shard; at least k shards must be present.
    pub fn decode(
        &self,
        shards: &[Option<Vec<u8>>],
        original_size: usize,
    ) -> Result<Vec<u8>, ErasureError> {
        let k = self.data_shards();
        let restored = self.restore_data_shards(shards)?;

        let shard_size = restored[0].len();
        let mut output = Vec::with_capacity(k * shard_size);
        for shard in &restored[..k] {
            output.extend_from_slice(shard);
        }
        output.truncate(original_size);
        Ok(output)
    }

    /// Rebuild the complete shard set, re-encoding any missing parity
    ///
    /// Used by the repair loop to re-upload shards that a node has lost.
    pub fn reconstruct(
        &self,
        shards: &[Option<Vec<u8>>],
    ) -> Result<Vec<Vec<u8>>, ErasureError> {
        let k = self.data_shards();
        let m = self.parity_shards();
        let data = self.restore_data_shards(shards)?;
        let shard_size = data[0].len();

        let parity_missing = shards[k..].iter().any(|s| s.is_none());
        let mut all = data;
        if parity_missing {
            let mut encoder = ReedSolomonEncoder::new(k, m, shard_size)
                .map_err(|e| ErasureError::InvalidConfig(e.to_string()))?;
            for shard in &all {
                encoder
                    .add_original_shard(shard)
                    .map_err(|e| ErasureError::EncodingFailed(e.to_string()))?;
            }
            let result = encoder
                .encode()
                .map_err(|e| ErasureError::EncodingFailed(e.to_string()))?;
            for parity in result.recovery_iter() {
                all.push(parity.to_vec());
            }
        } else {
            for shard in &shards[k..] {
                all.push(shard.clone().expect("parity shard present"));
            }
        }

        Ok(all)
    }

    /// Restore the k data shards from whatever subset survives
    fn restore_data_shards(
        &self,
        shards: &[Option<Vec<u8>>],
    ) -> Result<Vec<Vec<u8>>, ErasureError> {
        let k = self.data_shards();
        let m = self.parity_shards();

        if shards.len() != k + m {
            return Err(ErasureError::InvalidConfig(format!(
                "expected {} shards, got {}",
                k + m,
                shards.len()
            )));
        }

        let available = shards.iter().filter(|s| s.is_some()).count();
        if available < k {
            return Err(ErasureError::InsufficientShards {
                available,
                required: k,
            });
        }

        let shard_size = shards
            .iter()
            .find_map(|s| s.as_ref().map(Vec::len))
            .expect("at least k shards present");
        if shards
            .iter()
            .flatten()
            .any(|s| s.len() != shard_size)
        {
            return Err(ErasureError::ShardSizeMismatch);
        }

        // Fast path: all data shards survived
        if shards[..k].iter().all(|s| s.is_some()) {
            return Ok(shards[..k]
                .iter()
                .map(|s| s.clone().expect("data shard present"))
                .collect());
        }

        let mut decoder = ReedSolomonDecoder::new(k, m, shard_size)
            .map_err(|e| ErasureError::InvalidConfig(e.to_string()))?;

        for (i, shard) in shards.iter().enumerate().take(k) {
            if let Some(data) = shard {
                decoder
                    .add_original_shard(i, data)
                    .map_err(|e| ErasureError::DecodingFailed(e.to_string()))?;
            }
        }
        for (i, shard) in shards[k..].iter().enumerate() {
            if let Some(data) = shard {
                decoder
                    .add_recovery_shard(i, data)
                    .map_err(|e| ErasureError::DecodingFailed(e.to_string()))?;
            }
        }

        let result = decoder
            .decode()
            .map_err(|e| ErasureError::DecodingFailed(e.to_string()))?;

        let mut data = Vec::with_capacity(k);
        for (i, shard) in shards.iter().enumerate().take(k) {
            if let Some(original) = shard {
                data.push(original.clone());
            } else if let Some(restored) = result.restored_original(i) {
                data.push(restored.to_vec());
            } else {
                return Err(ErasureError::DecodingFailed(format!(
                    "failed to restore data shard {i}"
                )));
            }
        }
        Ok(data)
    }
}
