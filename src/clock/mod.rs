use std::time::{Duration, SystemTime};

use tokio::time::Instant;

/// Current wall-clock time as fractional seconds since the Unix epoch.
///
/// This is the timestamp format carried in datagrams and reports; latency
/// is measured as the difference of two of these across machines.
pub fn unix_now_seconds() -> f64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs_f64()
}

/// Absolute tick schedule for the agent's sample loop.
///
/// Deadlines are derived from the sample index, not from the previous
/// wakeup, so per-tick scheduling jitter does not accumulate into drift.
#[derive(Debug, Clone, Copy)]
pub struct SampleClock {
    start: Instant,
    sample_rate_hz: f64,
}

impl SampleClock {
    /// Create a schedule starting now with the given sample rate.
    pub fn new(sample_rate_hz: f64) -> Self {
        Self {
            start: Instant::now(),
            sample_rate_hz,
        }
    }

    /// Deadline of the n-th sample.
    pub fn deadline(&self, n: u64) -> Instant {
        self.start + Duration::from_secs_f64(n as f64 / self.sample_rate_hz)
    }

    /// Seconds elapsed since the schedule started.
    pub fn elapsed_seconds(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_now_is_recent() {
        // Any plausible runtime is after 2020 and before year ~2100.
        let now = unix_now_seconds();
        assert!(now > 1_577_836_800.0);
        assert!(now < 4_102_444_800.0);
    }

    #[test]
    fn test_deadlines_are_evenly_spaced() {
        let clock = SampleClock::new(20.0);
        let d0 = clock.deadline(0);
        let d1 = clock.deadline(1);
        let d10 = clock.deadline(10);

        assert_eq!(d1 - d0, Duration::from_millis(50));
        assert_eq!(d10 - d0, Duration::from_millis(500));
    }

    #[test]
    fn test_deadline_does_not_drift() {
        // The 1000th deadline equals start + 1000 periods exactly, rather
        // than the sum of 1000 rounded sleeps.
        let clock = SampleClock::new(20.0);
        assert_eq!(
            clock.deadline(1000) - clock.deadline(0),
            Duration::from_secs(50),
        );
    }
}
