use std::collections::TryReserveError;

use ethereum_types::H256;

/// Everything that can go wrong while building or using the per-epoch
/// buffers. Compute paths on a successfully built handle are infallible;
/// failures surface at construction and verification time instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The size schedule ran out of candidates before reaching a prime
    /// multiple of the node size.
    #[error("no prime-multiple buffer size for block {block_number}")]
    InvalidSize { block_number: u64 },

    /// The derived size does not fit the address space of this target.
    #[error("buffer of {requested} bytes exceeds the address space")]
    SizeOverflow { requested: u64 },

    /// The allocator refused to reserve the cache or dataset buffer.
    #[error("failed to reserve {requested} bytes")]
    OutOfMemory {
        requested: u64,
        source: TryReserveError,
    },

    /// The progress callback requested an abort; no partial dataset is kept.
    #[error("dataset generation aborted by caller")]
    Aborted,

    /// The handle was built for a different epoch than the block under
    /// verification.
    #[error("handle covers epoch {built}, block maps to epoch {requested}")]
    EpochMismatch { built: u64, requested: u64 },

    /// The sealed mix hash does not match the recomputed one.
    #[error("mix hash mismatch: sealed {sealed:?}, computed {computed:?}")]
    MixMismatch { sealed: H256, computed: H256 },

    /// The result hash is above the difficulty target.
    #[error("result hash does not meet the difficulty target")]
    DifficultyNotMet,
}
