//! Online statistical quality indicators for the raw TRNG byte stream.
//!
//! Three always-on monitors in the spirit of the NIST SP 800-90B health
//! tests: Monobit frequency, Repetition Count, and Adaptive Proportion.
//! They never reject data; the aggregator serves their counters through
//! `/status` and operators alert on them.

use std::sync::Mutex;

use serde::Serialize;

pub const DEFAULT_REPETITION_CUTOFF: u32 = 35;
pub const DEFAULT_APT_WINDOW: usize = 512;
pub const APT_WINDOW_MIN: usize = 256;
pub const APT_WINDOW_MAX: usize = 2048;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MonobitReport {
    pub zeros: u64,
    pub ones: u64,
    pub total: u64,
    /// `ones / total`; 0.5 is ideal. 0 until any data arrives.
    pub average: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RepetitionReport {
    pub current_run: u32,
    pub cutoff: u32,
    pub failures: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AdaptiveProportionReport {
    pub window_size: usize,
    pub cutoff: u32,
    pub bias_count: u64,
    pub samples: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QualityReport {
    pub monobit: MonobitReport,
    pub repetition: RepetitionReport,
    pub adaptive_proportion: AdaptiveProportionReport,
}

struct Monobit {
    zeros: u64,
    ones: u64,
    total: u64,
}

struct RepetitionCount {
    last: Option<u8>,
    run: u32,
    cutoff: u32,
    failures: u64,
}

struct AdaptiveProportion {
    window: Vec<u8>,
    size: usize,
    cutoff: u32,
    write_idx: usize,
    bias: u64,
    samples: u64,
}

struct Inner {
    monobit: Monobit,
    repetition: RepetitionCount,
    apt: AdaptiveProportion,
}

/// All three monitors behind a single lock; `record` updates them together
/// and `report` snapshots them together.
pub struct QualityMonitor {
    inner: Mutex<Inner>,
}

/// `⌊W/2⌋ + ⌊3·√(W/4)⌋` per the Adaptive Proportion Test.
fn apt_cutoff(window: usize) -> u32 {
    (window as u32 / 2) + (3.0 * (window as f64 / 4.0).sqrt()) as u32
}

impl QualityMonitor {
    /// `apt_window` is clamped to `[256, 2048]`.
    pub fn new(apt_window: usize) -> Self {
        let size = apt_window.clamp(APT_WINDOW_MIN, APT_WINDOW_MAX);
        Self {
            inner: Mutex::new(Inner {
                monobit: Monobit {
                    zeros: 0,
                    ones: 0,
                    total: 0,
                },
                repetition: RepetitionCount {
                    last: None,
                    run: 0,
                    cutoff: DEFAULT_REPETITION_CUTOFF,
                    failures: 0,
                },
                apt: AdaptiveProportion {
                    window: Vec::with_capacity(size),
                    size,
                    cutoff: apt_cutoff(size),
                    write_idx: 0,
                    bias: 0,
                    samples: 0,
                },
            }),
        }
    }

    pub fn record(&self, bytes: &[u8]) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for &b in bytes {
            inner.monobit.feed(b);
            inner.repetition.feed(b);
            inner.apt.feed(b);
        }
    }

    pub fn report(&self) -> QualityReport {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let average = if inner.monobit.total > 0 {
            inner.monobit.ones as f64 / inner.monobit.total as f64
        } else {
            0.0
        };
        QualityReport {
            monobit: MonobitReport {
                zeros: inner.monobit.zeros,
                ones: inner.monobit.ones,
                total: inner.monobit.total,
                average,
            },
            repetition: RepetitionReport {
                current_run: inner.repetition.run,
                cutoff: inner.repetition.cutoff,
                failures: inner.repetition.failures,
            },
            adaptive_proportion: AdaptiveProportionReport {
                window_size: inner.apt.size,
                cutoff: inner.apt.cutoff,
                bias_count: inner.apt.bias,
                samples: inner.apt.samples,
            },
        }
    }
}

impl Monobit {
    fn feed(&mut self, b: u8) {
        self.total += 8;
        let ones = b.count_ones() as u64;
        self.ones += ones;
        self.zeros += 8 - ones;
    }
}

impl RepetitionCount {
    fn feed(&mut self, b: u8) {
        if self.last == Some(b) {
            self.run += 1;
        } else {
            self.last = Some(b);
            self.run = 1;
        }
        if self.run > self.cutoff {
            self.failures += 1;
            self.run = 1;
        }
    }
}

impl AdaptiveProportion {
    fn feed(&mut self, b: u8) {
        self.samples += 1;
        if self.window.len() < self.size {
            self.window.push(b);
            return;
        }
        let count = self.window.iter().filter(|&&w| w == b).count() as u32;
        if count > self.cutoff {
            self.bias += 1;
        }
        self.window[self.write_idx] = b;
        self.write_idx = (self.write_idx + 1) % self.size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monobit_accounts_every_bit() {
        let m = QualityMonitor::new(DEFAULT_APT_WINDOW);
        m.record(&[0x00, 0xFF, 0x0F]);
        let r = m.report().monobit;
        assert_eq!(r.total, 24);
        assert_eq!(r.ones, 12);
        assert_eq!(r.zeros, 12);
        assert_eq!(r.zeros + r.ones, r.total);
        assert!((r.average - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn monobit_average_is_zero_before_data() {
        let m = QualityMonitor::new(DEFAULT_APT_WINDOW);
        assert_eq!(m.report().monobit.average, 0.0);
    }

    #[test]
    fn short_identical_run_counts_without_failure() {
        let m = QualityMonitor::new(DEFAULT_APT_WINDOW);
        m.record(&[0x5A; 10]);
        let r = m.report().repetition;
        assert_eq!(r.current_run, 10);
        assert_eq!(r.failures, 0);
    }

    #[test]
    fn repetition_failures_follow_cutoff_formula() {
        // failures == floor((N - 1) / cutoff) for N identical bytes
        let n = 106u32;
        let m = QualityMonitor::new(DEFAULT_APT_WINDOW);
        m.record(&vec![0x77u8; n as usize]);
        let r = m.report().repetition;
        assert_eq!(r.failures as u32, (n - 1) / DEFAULT_REPETITION_CUTOFF);
        assert_eq!(r.failures, 3);
    }

    #[test]
    fn run_resets_on_value_change() {
        let m = QualityMonitor::new(DEFAULT_APT_WINDOW);
        m.record(&[1, 1, 1, 2]);
        assert_eq!(m.report().repetition.current_run, 1);
    }

    #[test]
    fn apt_window_is_clamped() {
        assert_eq!(QualityMonitor::new(10).report().adaptive_proportion.window_size, 256);
        assert_eq!(
            QualityMonitor::new(1 << 20).report().adaptive_proportion.window_size,
            2048
        );
        assert_eq!(QualityMonitor::new(512).report().adaptive_proportion.window_size, 512);
    }

    #[test]
    fn apt_cutoff_matches_formula_for_default_window() {
        // 512/2 + floor(3 * sqrt(128)) = 256 + 33
        assert_eq!(apt_cutoff(512), 289);
    }

    #[test]
    fn constant_stream_trips_bias_once_window_filled() {
        let m = QualityMonitor::new(512);
        m.record(&vec![0x42u8; 513]);
        let r = m.report().adaptive_proportion;
        assert!(r.bias_count >= 1, "window filled at 512, byte 513 must trip");
        assert_eq!(r.samples, 513);
    }

    #[test]
    fn apt_counts_only_while_filling() {
        let m = QualityMonitor::new(256);
        m.record(&vec![0x42u8; 256]);
        let r = m.report().adaptive_proportion;
        assert_eq!(r.bias_count, 0);
        assert_eq!(r.samples, 256);
    }
}
