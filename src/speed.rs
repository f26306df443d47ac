// src/speed.rs

use tokio::time::{Duration, Instant};

use crate::models::{Speed, SpeedUnit};

const KIB: f64 = 1024.0;
const MIB: f64 = 1024.0 * 1024.0;

/// Measures throughput of the current transfer attempt.
#[derive(Debug, Clone, Copy)]
pub struct SpeedMeter {
    started: Instant,
}

impl Default for SpeedMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeedMeter {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    /// Resets the reference point. Called once per physical attempt, including resumes.
    pub fn start(&mut self) {
        self.started = Instant::now();
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Rate of `bytes_since_start` over the time elapsed since [`start`](Self::start).
    pub fn sample(&self, bytes_since_start: u64) -> Speed {
        speed_for(bytes_since_start, self.elapsed().as_millis() as u64)
    }
}

/// `bytes * 1000 / elapsed_ms`, scaled to B/s, KB/s or MB/s. Zero elapsed time yields 0 B/s.
pub fn speed_for(bytes: u64, elapsed_ms: u64) -> Speed {
    if elapsed_ms == 0 {
        return Speed::default();
    }
    let rate = bytes as f64 * 1000.0 / elapsed_ms as f64;
    if rate < KIB {
        Speed {
            value: rate,
            unit: SpeedUnit::BytesPerSec,
        }
    } else if rate < MIB {
        Speed {
            value: rate / KIB,
            unit: SpeedUnit::KiloBytesPerSec,
        }
    } else {
        Speed {
            value: rate / MIB,
            unit: SpeedUnit::MegaBytesPerSec,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_boundaries_are_exact() {
        assert_eq!(speed_for(1023, 1000).unit, SpeedUnit::BytesPerSec);
        let kib = speed_for(1024, 1000);
        assert_eq!(kib.unit, SpeedUnit::KiloBytesPerSec);
        assert_eq!(kib.value, 1.0);
        assert_eq!(speed_for(1024 * 1024 - 1, 1000).unit, SpeedUnit::KiloBytesPerSec);
        let mib = speed_for(1024 * 1024, 1000);
        assert_eq!(mib.unit, SpeedUnit::MegaBytesPerSec);
        assert_eq!(mib.value, 1.0);
    }

    #[test]
    fn zero_elapsed_is_zero_rate() {
        assert_eq!(speed_for(4096, 0), Speed::default());
    }

    #[test]
    fn monotonic_in_bytes() {
        let to_bps = |s: Speed| match s.unit {
            SpeedUnit::BytesPerSec => s.value,
            SpeedUnit::KiloBytesPerSec => s.value * KIB,
            SpeedUnit::MegaBytesPerSec => s.value * MIB,
        };
        let mut last = 0.0;
        for bytes in (0..5_000_000u64).step_by(48_611) {
            let bps = to_bps(speed_for(bytes, 750));
            assert!(bps >= last);
            last = bps;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sample_uses_time_since_start() {
        let mut meter = SpeedMeter::new();
        tokio::time::advance(Duration::from_secs(10)).await;
        meter.start();
        tokio::time::advance(Duration::from_secs(2)).await;
        let speed = meter.sample(2048);
        assert_eq!(speed.unit, SpeedUnit::KiloBytesPerSec);
        assert_eq!(speed.value, 1.0);
    }
}
