//! Systematic Reed-Solomon parity for PGM transmission groups.
//!
//! This crate only knows about equal-length byte shards; it has no notion of
//! a PGM packet, an `OPT_VAR_PKTLEN` trailer, or a transmission group's
//! sequence numbers. Zero-padding mismatched original lengths to a common
//! shard length, and recording which originals were padded, is the sender's
//! job (see `pgm-send`'s `fec` module) — this crate only ever sees the
//! already-padded shards.
#![deny(missing_docs)]
#![deny(warnings)]

use reed_solomon_erasure::galois_8::ReedSolomon;

/// Errors constructing or running a [`ParityEncoder`].
#[derive(Debug, thiserror::Error)]
pub enum FecError {
    /// `k` (data shards) or `h` (parity shards) was zero, or their sum
    /// exceeded the GF(2^8) shard-count limit of 255.
    #[error("invalid Reed-Solomon configuration: k={k}, h={h}")]
    InvalidConfig {
        /// Requested data shard count.
        k: usize,
        /// Requested parity shard count.
        h: usize,
    },
    /// The caller's shards were not all the same length.
    #[error("all shards in a transmission group must share one length, got {0} and {1}")]
    ShardLengthMismatch(usize, usize),
    /// `reed-solomon-erasure` rejected the encode.
    #[error("Reed-Solomon encode failed: {0}")]
    Encode(#[from] reed_solomon_erasure::Error),
}

/// A configured encoder for one transmission group size `(k, h)`.
///
/// PGM transmission groups are small (RFC 3208 recommends `k` in the tens),
/// so a fresh [`ReedSolomon`] matrix is built per group rather than cached;
/// the sender is expected to hold one `ParityEncoder` per distinct `(k, h)`
/// it uses, not one per group.
pub struct ParityEncoder {
    k: usize,
    h: usize,
    rs: ReedSolomon,
}

impl ParityEncoder {
    /// Builds an encoder for `k` original (data) shards and `h` parity
    /// shards, per spec.md §4.7.
    pub fn new(k: usize, h: usize) -> Result<Self, FecError> {
        if k == 0 || h == 0 || k + h > 255 {
            return Err(FecError::InvalidConfig { k, h });
        }
        let rs = ReedSolomon::new(k, h).map_err(|_| FecError::InvalidConfig { k, h })?;
        Ok(Self { k, h, rs })
    }

    /// Number of original shards this encoder was built for.
    pub fn k(&self) -> usize {
        self.k
    }

    /// Number of parity shards this encoder was built for.
    pub fn h(&self) -> usize {
        self.h
    }

    /// Computes all `h` parity shards for one transmission group.
    ///
    /// `originals` must contain exactly `k` shards, all the same length
    /// (the caller is responsible for zero-padding per spec.md §4.7).
    /// Returns the `h` parity shards in index order, i.e. parity index `j`
    /// is `result[j]`.
    pub fn encode(&self, originals: &[&[u8]]) -> Result<Vec<Vec<u8>>, FecError> {
        if originals.len() != self.k {
            return Err(FecError::InvalidConfig { k: self.k, h: self.h });
        }
        let shard_len = originals.first().map_or(0, |s| s.len());
        for shard in originals {
            if shard.len() != shard_len {
                return Err(FecError::ShardLengthMismatch(shard_len, shard.len()));
            }
        }

        let mut shards: Vec<Vec<u8>> = originals.iter().map(|s| s.to_vec()).collect();
        shards.extend((0..self.h).map(|_| vec![0u8; shard_len]));

        self.rs.encode(&mut shards)?;

        Ok(shards.split_off(self.k))
    }

    /// Recovers the original `k` shards from any `k` of the `k + h` shards
    /// in a group, given which positions are missing.
    ///
    /// `shards` must have exactly `k + h` entries; a missing shard is `None`.
    /// On success, every entry is `Some`; the first `k` are the originals.
    pub fn reconstruct(&self, shards: &mut Vec<Option<Vec<u8>>>) -> Result<(), FecError> {
        if shards.len() != self.k + self.h {
            return Err(FecError::InvalidConfig { k: self.k, h: self.h });
        }
        self.rs.reconstruct(shards)?;
        Ok(())
    }
}
