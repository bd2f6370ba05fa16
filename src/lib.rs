//! Memory-hard Ethash-family proof-of-work engine.
//!
//! The engine derives, per 30000-block epoch, a small pseudorandom cache and
//! a ~128x larger dataset, and mixes dataset elements into a header/nonce
//! seed to produce a memory-bandwidth-bound hash. Light clients keep only
//! the cache and recompute dataset elements on demand; miners materialize
//! the whole dataset once and trade memory for speed. Both sides of that
//! asymmetry live here: [`make_cache`], [`calc_dataset_item`],
//! [`make_dataset`] and the [`hashimoto`] mixer, with [`LightDAG`] and
//! [`FullDAG`] as the owning handles.

mod dag;
mod error;
mod miller_rabin;

use byteorder::{ByteOrder, LittleEndian};
use ethereum_types::{H256, H512, U256};
use rayon::prelude::*;
use sha3::{Digest, Keccak256, Keccak512};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub use dag::{is_valid_dump, FullDAG, LightDAG};
pub use error::Error;
use miller_rabin::is_prime;

const DATASET_BYTES_INIT: u64 = 1 << 30;
const DATASET_BYTES_GROWTH: u64 = 1 << 23;
const CACHE_BYTES_INIT: u64 = 1 << 24;
const CACHE_BYTES_GROWTH: u64 = 1 << 17;
const MIX_BYTES: usize = 128;
const WORD_BYTES: usize = 4;
const HASH_BYTES: usize = 64;
const HASH_WORDS: usize = HASH_BYTES / WORD_BYTES;
const MIX_WORDS: usize = MIX_BYTES / WORD_BYTES;
const DATASET_PARENTS: u32 = 256;
const CACHE_ROUNDS: usize = 3;
const ACCESSES: usize = 64;

/// Number of blocks sharing one cache/dataset generation.
pub const EPOCH_LENGTH: u64 = 30_000;

/// Algorithm revision, part of the name of any persisted artifact.
pub const REVISION: u32 = 23;

/// Tag prefixed to a dumped dataset so a reload can reject foreign files.
pub const DAG_MAGIC: u64 = 0xFEE1_DEAD_BADD_CAFE;

pub(crate) const DAG_MAGIC_BYTES: usize = 8;

fn keccak_512(data: &[u8]) -> [u8; HASH_BYTES] {
    Keccak512::digest(data).into()
}

const FNV_PRIME: u32 = 0x0100_0193;

fn fnv(a: u32, b: u32) -> u32 {
    a.wrapping_mul(FNV_PRIME) ^ b
}

fn fnv_mix(mix: &mut [u32; MIX_WORDS], data: &[u32; MIX_WORDS]) {
    for (m, d) in mix.iter_mut().zip(data) {
        *m = fnv(*m, *d);
    }
}

/// Cache size in bytes for the epoch of `block_number`: the linear schedule
/// value rounded down to the nearest prime multiple of the 64-byte node size.
pub fn get_cache_size(block_number: u64) -> Result<u64, Error> {
    let epoch = block_number / EPOCH_LENGTH;
    let invalid = || Error::InvalidSize { block_number };
    let sz = CACHE_BYTES_GROWTH
        .checked_mul(epoch)
        .and_then(|g| g.checked_add(CACHE_BYTES_INIT))
        .ok_or_else(invalid)?;
    let mut sz = sz - HASH_BYTES as u64;
    while !is_prime(sz / HASH_BYTES as u64) {
        sz = sz.checked_sub(2 * HASH_BYTES as u64).ok_or_else(invalid)?;
    }
    Ok(sz)
}

/// Dataset size in bytes for the epoch of `block_number`, prime in units of
/// the 128-byte mix width.
pub fn get_full_size(block_number: u64) -> Result<u64, Error> {
    let epoch = block_number / EPOCH_LENGTH;
    let invalid = || Error::InvalidSize { block_number };
    let sz = DATASET_BYTES_GROWTH
        .checked_mul(epoch)
        .and_then(|g| g.checked_add(DATASET_BYTES_INIT))
        .ok_or_else(invalid)?;
    let mut sz = sz - MIX_BYTES as u64;
    while !is_prime(sz / MIX_BYTES as u64) {
        sz = sz.checked_sub(2 * MIX_BYTES as u64).ok_or_else(invalid)?;
    }
    Ok(sz)
}

/// Seed hash for the epoch of `block_number`: keccak-256 applied epoch times
/// to the all-zero hash. O(epoch); callers computing many nearby blocks
/// should hold on to the result themselves.
pub fn get_seedhash(block_number: u64) -> H256 {
    let mut seed = [0u8; 32];
    for _ in 0..block_number / EPOCH_LENGTH {
        seed = Keccak256::digest(seed).into();
    }
    H256::from(seed)
}

/// Fill `cache` from the epoch seed. The buffer length must be the value
/// reported by [`get_cache_size`] (a multiple of 64).
///
/// A keccak-512 chain seeds the buffer linearly, then three rounds of
/// randomized memory mixing chain every node to a pseudorandom partner,
/// which is what makes recomputing the cache with less than full memory
/// expensive.
pub fn make_cache(cache: &mut [u8], seed: H256) {
    let n = cache.len() / HASH_BYTES;
    if n == 0 {
        return;
    }
    let first = keccak_512(seed.as_bytes());
    cache[..HASH_BYTES].copy_from_slice(&first);
    for i in 1..n {
        let (prev, rest) = cache.split_at_mut(i * HASH_BYTES);
        let node = keccak_512(&prev[(i - 1) * HASH_BYTES..]);
        rest[..HASH_BYTES].copy_from_slice(&node);
    }
    for _ in 0..CACHE_ROUNDS {
        for i in 0..n {
            let dst = i * HASH_BYTES;
            let src = ((i + n - 1) % n) * HASH_BYTES;
            let xor = (LittleEndian::read_u32(&cache[dst..]) as usize % n) * HASH_BYTES;
            let mut tmp = [0u8; HASH_BYTES];
            for j in 0..HASH_BYTES {
                tmp[j] = cache[src + j] ^ cache[xor + j];
            }
            let node = keccak_512(&tmp);
            cache[dst..dst + HASH_BYTES].copy_from_slice(&node);
        }
    }
}

/// Compute the 64-byte dataset element `i` from the cache alone.
///
/// Pure in `(cache, i)`, so a light client can reproduce any single element
/// a full node would read out of its materialized buffer.
pub fn calc_dataset_item(cache: &[u8], i: usize) -> H512 {
    let rows = cache.len() / HASH_BYTES;

    // Start from a cache row, decorrelated from the raw row by folding the
    // element index into the first word before hashing.
    let mut mix = [0u8; HASH_BYTES];
    mix.copy_from_slice(&cache[(i % rows) * HASH_BYTES..][..HASH_BYTES]);
    let head = LittleEndian::read_u32(&mix) ^ i as u32;
    LittleEndian::write_u32(&mut mix, head);
    let mix = keccak_512(&mix);

    let mut words = [0u32; HASH_WORDS];
    for (j, w) in words.iter_mut().enumerate() {
        *w = LittleEndian::read_u32(&mix[j * WORD_BYTES..]);
    }
    for p in 0..DATASET_PARENTS {
        let parent = fnv(i as u32 ^ p, words[p as usize % HASH_WORDS]) % rows as u32;
        let row = &cache[parent as usize * HASH_BYTES..][..HASH_BYTES];
        for (k, w) in words.iter_mut().enumerate() {
            *w = fnv(*w, LittleEndian::read_u32(&row[k * WORD_BYTES..]));
        }
    }

    let mut bytes = [0u8; HASH_BYTES];
    for (j, w) in words.iter().enumerate() {
        LittleEndian::write_u32(&mut bytes[j * WORD_BYTES..], *w);
    }
    H512::from(keccak_512(&bytes))
}

/// Materialize every dataset element into `dataset`, in parallel. The buffer
/// length must be the value reported by [`get_full_size`].
pub fn make_dataset(dataset: &mut [u8], cache: &[u8]) {
    dataset
        .par_chunks_exact_mut(HASH_BYTES)
        .enumerate()
        .for_each(|(i, out)| {
            out.copy_from_slice(calc_dataset_item(cache, i).as_bytes());
        });
}

/// Like [`make_dataset`], reporting completion percentages to `progress`.
///
/// The callback runs on whichever worker crosses a whole-percent boundary,
/// concurrently with the build; returning non-zero stops every worker and
/// fails the build with [`Error::Aborted`]. Either the whole dataset is
/// written or the call errors, there is no partial-success state.
pub fn make_dataset_with_progress<F>(
    dataset: &mut [u8],
    cache: &[u8],
    progress: F,
) -> Result<(), Error>
where
    F: Fn(u32) -> i32 + Sync,
{
    let total = dataset.len() / HASH_BYTES;
    let step = (total / 100).max(1);
    let done = AtomicUsize::new(0);
    let cancelled = AtomicBool::new(false);
    dataset
        .par_chunks_exact_mut(HASH_BYTES)
        .enumerate()
        .try_for_each(|(i, out)| {
            if cancelled.load(Ordering::Relaxed) {
                return Err(Error::Aborted);
            }
            out.copy_from_slice(calc_dataset_item(cache, i).as_bytes());
            let finished = done.fetch_add(1, Ordering::Relaxed) + 1;
            if finished % step == 0 || finished == total {
                let percent = (finished * 100 / total) as u32;
                if progress(percent) != 0 {
                    cancelled.store(true, Ordering::Relaxed);
                    return Err(Error::Aborted);
                }
            }
            Ok(())
        })
}

/// The mixing core shared by light and full clients, parameterized by how a
/// 64-byte dataset element is obtained.
///
/// Folds `header_hash` and the little-endian `nonce` into a 64-byte seed,
/// replicates it into a 128-byte mix, pulls in 64 pseudorandom dataset
/// element pairs, and compresses the mix to the 32-byte mix hash. Returns
/// `(mix_hash, result)` where `result = keccak256(seed ++ mix_hash)` is the
/// value compared against the difficulty target.
pub fn hashimoto<F>(header_hash: H256, nonce: u64, full_size: u64, lookup: F) -> (H256, H256)
where
    F: Fn(usize) -> H512,
{
    let rows = (full_size / MIX_BYTES as u64) as u32;

    let mut buf = [0u8; 40];
    buf[..32].copy_from_slice(header_hash.as_bytes());
    LittleEndian::write_u64(&mut buf[32..], nonce);
    let seed = keccak_512(&buf);
    let seed_head = LittleEndian::read_u32(&seed);

    let mut mix = [0u32; MIX_WORDS];
    for (i, w) in mix.iter_mut().enumerate() {
        *w = LittleEndian::read_u32(&seed[i % HASH_WORDS * WORD_BYTES..]);
    }

    let mut temp = [0u32; MIX_WORDS];
    for i in 0..ACCESSES {
        let parent = fnv(i as u32 ^ seed_head, mix[i % MIX_WORDS]) % rows;
        for j in 0..MIX_BYTES / HASH_BYTES {
            let element = lookup(2 * parent as usize + j);
            for (k, w) in temp[j * HASH_WORDS..(j + 1) * HASH_WORDS]
                .iter_mut()
                .enumerate()
            {
                *w = LittleEndian::read_u32(&element.as_bytes()[k * WORD_BYTES..]);
            }
        }
        fnv_mix(&mut mix, &temp);
    }

    // Compress adjacent words pairwise, 128 bytes down to 32.
    let mut digest = [0u8; 32];
    for i in 0..MIX_WORDS / 4 {
        let w = fnv(
            fnv(fnv(mix[4 * i], mix[4 * i + 1]), mix[4 * i + 2]),
            mix[4 * i + 3],
        );
        LittleEndian::write_u32(&mut digest[i * WORD_BYTES..], w);
    }
    let mix_hash = H256::from(digest);

    let mut hasher = Keccak256::new();
    hasher.update(seed);
    hasher.update(digest);
    let result = H256::from_slice(hasher.finalize().as_slice());

    (mix_hash, result)
}

/// [`hashimoto`] for a light client: elements are recomputed from the cache.
pub fn hashimoto_light(
    header_hash: H256,
    nonce: u64,
    full_size: u64,
    cache: &[u8],
) -> (H256, H256) {
    hashimoto(header_hash, nonce, full_size, |i| {
        calc_dataset_item(cache, i)
    })
}

/// [`hashimoto`] for a full client: elements are read out of the
/// materialized dataset.
pub fn hashimoto_full(header_hash: H256, nonce: u64, dataset: &[u8]) -> (H256, H256) {
    hashimoto(header_hash, nonce, dataset.len() as u64, |i| {
        let mut node = [0u8; HASH_BYTES];
        node.copy_from_slice(&dataset[i * HASH_BYTES..][..HASH_BYTES]);
        H512::from(node)
    })
}

/// Boundary a result hash must stay under for the given difficulty.
pub fn difficulty_to_target(difficulty: U256) -> U256 {
    if difficulty <= U256::one() {
        U256::max_value()
    } else {
        U256::max_value() / difficulty
    }
}

/// Scan nonces from `start_nonce` until one seals the header under
/// `difficulty`. Returns the winning nonce together with its mix hash and
/// result.
pub fn mine(
    header_hash: H256,
    dataset: &[u8],
    start_nonce: u64,
    difficulty: U256,
) -> (u64, H256, H256) {
    let target = difficulty_to_target(difficulty);
    let mut nonce = start_nonce;
    loop {
        let (mix_hash, result) = hashimoto_full(header_hash, nonce, dataset);
        if U256::from_big_endian(result.as_bytes()) <= target {
            return (nonce, mix_hash, result);
        }
        nonce = nonce.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv_reference_pairs() {
        assert_eq!(fnv(0, 0), 0);
        assert_eq!(fnv(1, 0), FNV_PRIME);
        assert_eq!(fnv(1, 1), FNV_PRIME ^ 1);
        assert_eq!(fnv(0xffff_ffff, 0), 0xffff_ffff_u32.wrapping_mul(FNV_PRIME));
    }

    #[test]
    fn seedhash_constant_within_an_epoch() {
        assert_eq!(get_seedhash(0), H256::zero());
        assert_eq!(get_seedhash(EPOCH_LENGTH - 1), H256::zero());
        assert_ne!(get_seedhash(EPOCH_LENGTH), H256::zero());
        assert_eq!(
            get_seedhash(EPOCH_LENGTH),
            get_seedhash(2 * EPOCH_LENGTH - 1)
        );
    }

    #[test]
    fn sizes_never_shrink() {
        let mut last_cache = 0;
        let mut last_full = 0;
        for epoch in 0..8 {
            let cache = get_cache_size(epoch * EPOCH_LENGTH).unwrap();
            let full = get_full_size(epoch * EPOCH_LENGTH).unwrap();
            assert!(cache >= last_cache);
            assert!(full >= last_full);
            assert_eq!(cache % HASH_BYTES as u64, 0);
            assert_eq!(full % MIX_BYTES as u64, 0);
            last_cache = cache;
            last_full = full;
        }
    }
}
