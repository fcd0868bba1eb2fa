use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Aggregator counters, updated from the polling hot path; all fields are
/// atomic so `/status` and `/health` read them without locks.
pub struct Metrics {
    pub trng_polls: AtomicU64,
    pub trng_poll_errors: AtomicU64,
    pub fortuna_polls: AtomicU64,
    pub fortuna_poll_errors: AtomicU64,
    pub reseeds: AtomicU64,
    pub reseed_errors: AtomicU64,
    pub virtio_seeds: AtomicU64,
    pub virtio_seed_errors: AtomicU64,
    // unix seconds of the last success; 0 means never
    last_trng_success: AtomicU64,
    last_fortuna_success: AtomicU64,
    last_reseed_success: AtomicU64,
    pub start_time: SystemTime,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            trng_polls: AtomicU64::new(0),
            trng_poll_errors: AtomicU64::new(0),
            fortuna_polls: AtomicU64::new(0),
            fortuna_poll_errors: AtomicU64::new(0),
            reseeds: AtomicU64::new(0),
            reseed_errors: AtomicU64::new(0),
            virtio_seeds: AtomicU64::new(0),
            virtio_seed_errors: AtomicU64::new(0),
            last_trng_success: AtomicU64::new(0),
            last_fortuna_success: AtomicU64::new(0),
            last_reseed_success: AtomicU64::new(0),
            start_time: SystemTime::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().map(|d| d.as_secs()).unwrap_or(0)
    }

    pub fn mark_trng_success(&self) {
        self.last_trng_success.store(unix_now(), Ordering::Relaxed);
    }

    pub fn mark_fortuna_success(&self) {
        self.last_fortuna_success.store(unix_now(), Ordering::Relaxed);
    }

    pub fn mark_reseed_success(&self) {
        self.last_reseed_success.store(unix_now(), Ordering::Relaxed);
    }

    /// Seconds since the last successful TRNG poll; `None` if never.
    pub fn trng_success_age(&self) -> Option<u64> {
        age_of(self.last_trng_success.load(Ordering::Relaxed))
    }

    pub fn fortuna_success_age(&self) -> Option<u64> {
        age_of(self.last_fortuna_success.load(Ordering::Relaxed))
    }

    pub fn reseed_success_age(&self) -> Option<u64> {
        age_of(self.last_reseed_success.load(Ordering::Relaxed))
    }
}

fn age_of(stamp: u64) -> Option<u64> {
    if stamp == 0 {
        None
    } else {
        Some(unix_now().saturating_sub(stamp))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_ages_start_unknown_and_track_marks() {
        let m = Metrics::new();
        assert_eq!(m.trng_success_age(), None);
        m.mark_trng_success();
        assert!(m.trng_success_age().unwrap() <= 1);
    }
}
