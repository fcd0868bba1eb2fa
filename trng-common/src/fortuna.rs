//! Fortuna CSPRNG: 32 entropy pools, SHA-256 key chaining, AES-256 in
//! counter mode.
//!
//! The generator is deliberately deterministic between reseeds: output is
//! AES-256 over a big-endian counter block under the current key. Callers
//! serialize access behind their own mutex; `generate` mutates state because
//! it advances the counter.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use aes::cipher::{BlockEncrypt, KeyInit};
use aes::{Aes256, Block};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Minimum seed length in bytes; also the AES key length.
pub const MIN_SEED_LEN: usize = 32;
pub const NUM_POOLS: usize = 32;
/// Cap per pool; oldest bytes are evicted on overflow.
pub const MAX_POOL_LEN: usize = 1024;
/// A generator that has not been reseeded for this long is unhealthy.
pub const MAX_RESEED_AGE: Duration = Duration::from_secs(24 * 60 * 60);

const BLOCK_SIZE: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FortunaError {
    #[error("seed too short: {got} bytes, need at least {MIN_SEED_LEN}")]
    SeedTooShort { got: usize },
    #[error("reseed requires at least one seed")]
    NoSeeds,
    #[error("no pool contributed to the reseed")]
    NoPoolReady,
    #[error("amplify requires a non-empty seed and a positive output size")]
    EmptyAmplify,
}

#[derive(Debug)]
pub struct Fortuna {
    key: [u8; MIN_SEED_LEN],
    cipher: Aes256,
    counter: u128,
    pools: Vec<VecDeque<u8>>,
    reseed_count: u64,
    last_reseed: Instant,
}

impl Fortuna {
    /// Build a generator from an initial seed of at least 32 bytes. The key
    /// is the first 32 bytes of the seed; the counter starts at zero and the
    /// pools start empty.
    pub fn new(seed: &[u8]) -> Result<Self, FortunaError> {
        if seed.len() < MIN_SEED_LEN {
            return Err(FortunaError::SeedTooShort { got: seed.len() });
        }
        let mut key = [0u8; MIN_SEED_LEN];
        key.copy_from_slice(&seed[..MIN_SEED_LEN]);
        Ok(Self {
            cipher: Aes256::new(&key.into()),
            key,
            counter: 0,
            pools: (0..NUM_POOLS).map(|_| VecDeque::new()).collect(),
            reseed_count: 0,
            last_reseed: Instant::now(),
        })
    }

    /// Append an entropy event to pool `source % 32`, evicting the oldest
    /// bytes once the pool exceeds its cap.
    pub fn add_event(&mut self, source: u8, value: &[u8]) {
        let pool = &mut self.pools[source as usize % NUM_POOLS];
        pool.extend(value.iter().copied());
        while pool.len() > MAX_POOL_LEN {
            pool.pop_front();
        }
    }

    /// Install a new key derived as `SHA-256(K || seeds[0] || seeds[1] || …)`
    /// and bump the reseed counter. The counter `C` is NOT reset; it
    /// continues monotonically into the new key epoch.
    pub fn reseed<S: AsRef<[u8]>>(&mut self, seeds: &[S]) -> Result<(), FortunaError> {
        if seeds.is_empty() {
            return Err(FortunaError::NoSeeds);
        }
        let mut hasher = Sha256::new();
        hasher.update(self.key);
        for seed in seeds {
            hasher.update(seed.as_ref());
        }
        self.key = hasher.finalize().into();
        self.cipher = Aes256::new(&self.key.into());
        self.reseed_count += 1;
        self.last_reseed = Instant::now();
        Ok(())
    }

    /// Reseed from the entropy pools. Pool `i` contributes to reseed `k` iff
    /// bit `i` of `k` is set, where `k` is the counter value this reseed will
    /// install (`reseed_count + 1`; the embedded `reseed` call performs the
    /// single increment). Contributing pools are drained.
    pub fn reseed_from_pools(&mut self) -> Result<(), FortunaError> {
        let k = self.reseed_count + 1;
        let mut aggregated = Vec::new();
        for (i, pool) in self.pools.iter_mut().enumerate() {
            if k >> i & 1 == 1 && !pool.is_empty() {
                aggregated.extend(pool.iter().copied());
                pool.clear();
            }
        }
        if aggregated.is_empty() {
            return Err(FortunaError::NoPoolReady);
        }
        self.reseed(&[aggregated])
    }

    /// Produce `n` pseudo-random bytes: encrypt successive counter blocks
    /// (the counter as 16 big-endian bytes) and truncate to `n`.
    pub fn generate(&mut self, n: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(n.div_ceil(BLOCK_SIZE) * BLOCK_SIZE);
        while out.len() < n {
            let mut block = Block::from(self.counter.to_be_bytes());
            self.cipher.encrypt_block(&mut block);
            out.extend_from_slice(&block);
            self.counter += 1;
        }
        out.truncate(n);
        out
    }

    /// Amplify a seed into `n` bytes: distribute its 32-byte chunks to the
    /// pools round-robin, reseed from the pools, then generate.
    pub fn amplify(&mut self, seed: &[u8], n: usize) -> Result<Vec<u8>, FortunaError> {
        if seed.is_empty() || n == 0 {
            return Err(FortunaError::EmptyAmplify);
        }
        for (i, chunk) in seed.chunks(MIN_SEED_LEN).enumerate() {
            let pool = &mut self.pools[i % NUM_POOLS];
            pool.extend(chunk.iter().copied());
            while pool.len() > MAX_POOL_LEN {
                pool.pop_front();
            }
        }
        self.reseed_from_pools()?;
        Ok(self.generate(n))
    }

    pub fn reseed_count(&self) -> u64 {
        self.reseed_count
    }

    pub fn seconds_since_reseed(&self) -> u64 {
        self.last_reseed.elapsed().as_secs()
    }

    /// Unhealthy once no reseed has happened for 24 hours.
    pub fn is_healthy(&self) -> bool {
        self.last_reseed.elapsed() <= MAX_RESEED_AGE
    }

    pub fn pool_fill(&self) -> Vec<usize> {
        self.pools.iter().map(|p| p.len()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zero_seeded() -> Fortuna {
        Fortuna::new(&[0u8; 32]).unwrap()
    }

    #[test]
    fn short_seed_is_rejected() {
        assert_eq!(
            Fortuna::new(&[0u8; 31]).unwrap_err(),
            FortunaError::SeedTooShort { got: 31 }
        );
        assert!(Fortuna::new(&[0u8; 32]).is_ok());
    }

    #[test]
    fn zero_seed_first_block_matches_aes256_vector() {
        // AES-256 of the all-zero block under the all-zero key.
        let mut f = zero_seeded();
        let out = f.generate(16);
        assert_eq!(hex::encode(&out), "dc95c078a2408989ad48a21492842087");
    }

    #[test]
    fn generate_is_deterministic_and_counter_advances() {
        let mut a = zero_seeded();
        let mut b = zero_seeded();
        let first_a = a.generate(40);
        let first_b = b.generate(40);
        assert_eq!(first_a, first_b);
        // same state, next call must differ (counter moved on)
        assert_ne!(a.generate(40), first_a);
    }

    #[test]
    fn reseed_rotates_the_key_stream() {
        let mut a = zero_seeded();
        let mut b = zero_seeded();
        b.reseed(&[vec![0xAAu8; 32]]).unwrap();
        assert_ne!(a.generate(32), b.generate(32));
        assert_eq!(b.reseed_count(), 1);
    }

    #[test]
    fn reseed_with_no_seeds_fails() {
        let mut f = zero_seeded();
        let none: Vec<Vec<u8>> = Vec::new();
        assert_eq!(f.reseed(&none).unwrap_err(), FortunaError::NoSeeds);
    }

    #[test]
    fn pool_selection_follows_reseed_parity() {
        let mut f = zero_seeded();
        f.add_event(0, &[1, 2, 3]);
        f.add_event(1, &[4, 5, 6]);
        // k = 1 selects pool 0 only
        f.reseed_from_pools().unwrap();
        assert_eq!(f.pool_fill()[0], 0);
        assert_eq!(f.pool_fill()[1], 3);
        // k = 2 selects pool 1
        f.reseed_from_pools().unwrap();
        assert_eq!(f.pool_fill()[1], 0);
        // all contributing pools empty now
        assert_eq!(f.reseed_from_pools().unwrap_err(), FortunaError::NoPoolReady);
        assert_eq!(f.reseed_count(), 2);
    }

    #[test]
    fn pools_cap_at_max_len() {
        let mut f = zero_seeded();
        f.add_event(7, &vec![0xEE; MAX_POOL_LEN + 100]);
        assert_eq!(f.pool_fill()[7], MAX_POOL_LEN);
    }

    #[test]
    fn amplify_produces_requested_length() {
        let mut f = zero_seeded();
        let out = f.amplify(&[0x42; 64], 100).unwrap();
        assert_eq!(out.len(), 100);
        assert_eq!(f.reseed_count(), 1);
    }

    #[test]
    fn amplify_rejects_empty_input() {
        let mut f = zero_seeded();
        assert_eq!(f.amplify(&[], 16).unwrap_err(), FortunaError::EmptyAmplify);
        assert_eq!(
            f.amplify(&[1, 2, 3], 0).unwrap_err(),
            FortunaError::EmptyAmplify
        );
    }

    #[test]
    fn event_routing_wraps_over_32_pools() {
        let mut f = zero_seeded();
        f.add_event(33, &[9]);
        assert_eq!(f.pool_fill()[1], 1);
    }

    #[test]
    fn fresh_generator_is_healthy() {
        let f = zero_seeded();
        assert!(f.is_healthy());
        assert_eq!(f.seconds_since_reseed(), 0);
    }
}
