//! Owning handles over the per-epoch verification cache and mining dataset.

use byteorder::{ByteOrder, LittleEndian};
use ethereum_types::{H256, U256};
use tracing::{debug, info};

use crate::error::Error;
use crate::{
    difficulty_to_target, get_cache_size, get_full_size, get_seedhash, hashimoto_full,
    hashimoto_light, make_cache, make_dataset_with_progress, mine, DAG_MAGIC, DAG_MAGIC_BYTES,
    EPOCH_LENGTH,
};

/// Allocate a zeroed buffer, reporting reservation failure as an error
/// instead of aborting the process.
fn try_alloc(size: u64) -> Result<Vec<u8>, Error> {
    let len = usize::try_from(size).map_err(|_| Error::SizeOverflow { requested: size })?;
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|source| Error::OutOfMemory {
            requested: size,
            source,
        })?;
    buf.resize(len, 0);
    Ok(buf)
}

/// Light client handle: holds the small cache for one epoch and recomputes
/// dataset elements on demand. Immutable after construction, so shared
/// read-only compute calls are safe.
pub struct LightDAG {
    block_number: u64,
    epoch: u64,
    cache: Vec<u8>,
    full_size: u64,
}

impl LightDAG {
    /// Derive the epoch parameters for `block_number` and build the cache.
    pub fn new(block_number: u64) -> Result<Self, Error> {
        let cache_size = get_cache_size(block_number)?;
        let full_size = get_full_size(block_number)?;
        let seed = get_seedhash(block_number);
        let epoch = block_number / EPOCH_LENGTH;

        debug!(epoch, cache_size, "generating verification cache");
        let mut cache = try_alloc(cache_size)?;
        make_cache(&mut cache, seed);

        Ok(Self {
            block_number,
            epoch,
            cache,
            full_size,
        })
    }

    /// Mix `header_hash` and `nonce` against this epoch's virtual dataset.
    /// Returns `(mix_hash, result)`.
    pub fn compute(&self, header_hash: H256, nonce: u64) -> (H256, H256) {
        hashimoto_light(header_hash, nonce, self.full_size, &self.cache)
    }

    /// Check a seal produced for `block_number`: the handle must cover the
    /// block's epoch, the recomputed mix hash must match the sealed one, and
    /// the result must meet the difficulty target.
    pub fn verify(
        &self,
        block_number: u64,
        header_hash: H256,
        nonce: u64,
        mix_hash: H256,
        difficulty: U256,
    ) -> Result<(), Error> {
        if !self.is_valid_for(block_number) {
            return Err(Error::EpochMismatch {
                built: self.epoch,
                requested: block_number / EPOCH_LENGTH,
            });
        }
        let (computed, result) = self.compute(header_hash, nonce);
        if computed != mix_hash {
            return Err(Error::MixMismatch {
                sealed: mix_hash,
                computed,
            });
        }
        if U256::from_big_endian(result.as_bytes()) > difficulty_to_target(difficulty) {
            return Err(Error::DifficultyNotMet);
        }
        Ok(())
    }

    /// Whether this handle's parameters apply to `block_number`.
    pub fn is_valid_for(&self, block_number: u64) -> bool {
        block_number / EPOCH_LENGTH == self.epoch
    }

    pub fn block_number(&self) -> u64 {
        self.block_number
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// The raw cache, e.g. for external persistence.
    pub fn cache(&self) -> &[u8] {
        &self.cache
    }

    /// Size in bytes of the (virtual) dataset of this epoch.
    pub fn full_size(&self) -> u64 {
        self.full_size
    }
}

/// Full client handle: owns the materialized dataset of one epoch. Built
/// from a [`LightDAG`]'s cache; does not keep the light handle alive.
pub struct FullDAG {
    epoch: u64,
    // DAG_MAGIC tag followed by the dataset proper, never mutated again.
    data: Vec<u8>,
}

impl FullDAG {
    /// Materialize the full dataset for the light handle's epoch.
    ///
    /// `progress` is invoked with a 0-100 percentage, possibly from several
    /// worker threads at once; a non-zero return aborts the build and the
    /// partially written buffer is dropped. The 0% call happens before the
    /// buffer is even allocated, so a caller can back out of committing
    /// gigabytes of memory.
    pub fn new<F>(light: &LightDAG, progress: F) -> Result<Self, Error>
    where
        F: Fn(u32) -> i32 + Sync,
    {
        if progress(0) != 0 {
            return Err(Error::Aborted);
        }
        let full_size = light.full_size();
        info!(
            epoch = light.epoch(),
            size_mb = full_size / (1024 * 1024),
            "generating full dataset"
        );
        let mut data = try_alloc(DAG_MAGIC_BYTES as u64 + full_size)?;
        LittleEndian::write_u64(&mut data, DAG_MAGIC);
        make_dataset_with_progress(&mut data[DAG_MAGIC_BYTES..], light.cache(), progress)?;
        info!(epoch = light.epoch(), "full dataset ready");

        Ok(Self {
            epoch: light.epoch(),
            data,
        })
    }

    /// Mix `header_hash` and `nonce` against the materialized dataset.
    /// Returns `(mix_hash, result)`, identical to the light path for the
    /// same epoch.
    pub fn compute(&self, header_hash: H256, nonce: u64) -> (H256, H256) {
        hashimoto_full(header_hash, nonce, self.dag())
    }

    /// Scan nonces from `start_nonce` for a seal meeting `difficulty`.
    pub fn mine(&self, header_hash: H256, start_nonce: u64, difficulty: U256) -> (u64, H256, H256) {
        mine(header_hash, self.dag(), start_nonce, difficulty)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Read-only view of the dataset elements.
    pub fn dag(&self) -> &[u8] {
        &self.data[DAG_MAGIC_BYTES..]
    }

    pub fn dag_size(&self) -> u64 {
        self.dag().len() as u64
    }

    /// The magic-tagged buffer in its on-disk framing, for callers that
    /// persist the dataset externally.
    pub fn dump(&self) -> &[u8] {
        &self.data
    }
}

/// Whether `data` carries the dump tag a reloaded dataset must start with.
pub fn is_valid_dump(data: &[u8]) -> bool {
    data.len() >= DAG_MAGIC_BYTES && LittleEndian::read_u64(data) == DAG_MAGIC
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_tag_round_trips() {
        let mut dump = vec![0u8; 16];
        LittleEndian::write_u64(&mut dump, DAG_MAGIC);
        assert!(is_valid_dump(&dump));

        // The tag reads back as the two little-endian sanity words a dump
        // reader checks.
        assert_eq!(LittleEndian::read_u32(&dump), 0xBADD_CAFE);
        assert_eq!(LittleEndian::read_u32(&dump[4..]), 0xFEE1_DEAD);

        dump[0] ^= 1;
        assert!(!is_valid_dump(&dump));
        assert!(!is_valid_dump(&[0u8; 4]));
    }
}
