//! Per-server ingest state owned by the rack controller.

use std::collections::VecDeque;

/// Wave ring capacity: at least two seconds of samples at the nominal
/// 20 Hz rate, rounded up to a power of two for clean FFT lengths.
pub const WAVE_BUFFER_CAPACITY: usize = 128;

/// Rolling state for one server, created lazily on its first datagram and
/// kept for the process lifetime.
#[derive(Debug)]
pub struct ServerState {
    /// Carrier frequency this server is expected to transmit.
    pub expected_freq_hz: f64,

    /// Last W samples as (sample, seconds since controller start).
    wave_buffer: VecDeque<(f64, f64)>,

    pub first_seq: Option<u64>,
    pub last_seq: Option<u64>,
    pub packets_received: u64,
    pub packets_lost: u64,

    /// Outputs of the most recent analysis pass, absent until the buffer
    /// first fills past the FFT minimum.
    pub last_spectral_error: Option<f64>,
    pub last_snr_db: Option<f64>,

    // Per-analysis-window accumulators, reset by take_window_stats.
    window_packets: u64,
    window_latency_sum_ms: f64,
    window_latency_max_ms: f64,
}

/// Arrival statistics accumulated since the previous analysis pass.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WindowStats {
    pub packets: u64,
    pub latency_mean_ms: f64,
    pub latency_max_ms: f64,
}

impl ServerState {
    pub fn new(expected_freq_hz: f64) -> Self {
        Self {
            expected_freq_hz,
            wave_buffer: VecDeque::with_capacity(WAVE_BUFFER_CAPACITY),
            first_seq: None,
            last_seq: None,
            packets_received: 0,
            packets_lost: 0,
            last_spectral_error: None,
            last_snr_db: None,
            window_packets: 0,
            window_latency_sum_ms: 0.0,
            window_latency_max_ms: 0.0,
        }
    }

    /// Record one accepted datagram. Returns the number of losses credited
    /// by this arrival's sequence gap (zero for in-order, reordered, or
    /// reset arrivals).
    pub fn record(&mut self, seq: u64, wave_sample: f64, relative_time: f64, latency_ms: f64) -> u64 {
        let lost = match self.last_seq {
            // A decrease is a sender reset or late reordered arrival;
            // neither credits loss nor replays the gap.
            Some(last) if seq > last.saturating_add(1) => seq - last - 1,
            _ => 0,
        };
        self.packets_lost += lost;

        if self.first_seq.is_none() {
            self.first_seq = Some(seq);
        }
        self.last_seq = Some(self.last_seq.map_or(seq, |last| last.max(seq)));
        self.packets_received += 1;

        if self.wave_buffer.len() == WAVE_BUFFER_CAPACITY {
            self.wave_buffer.pop_front();
        }
        self.wave_buffer.push_back((wave_sample, relative_time));

        self.window_packets += 1;
        self.window_latency_sum_ms += latency_ms;
        if latency_ms > self.window_latency_max_ms {
            self.window_latency_max_ms = latency_ms;
        }

        lost
    }

    /// Copy of the buffered samples in arrival order. The relative
    /// timestamps are dropped: the FFT treats the buffer as a uniform grid
    /// at the nominal sample rate.
    pub fn samples(&self) -> Vec<f64> {
        self.wave_buffer.iter().map(|&(s, _)| s).collect()
    }

    pub fn buffered(&self) -> usize {
        self.wave_buffer.len()
    }

    /// Fraction of expected datagrams lost so far.
    pub fn loss_rate(&self) -> f64 {
        let expected = self.packets_received + self.packets_lost;
        if expected == 0 {
            0.0
        } else {
            self.packets_lost as f64 / expected as f64
        }
    }

    /// Read and reset the per-window arrival statistics.
    pub fn take_window_stats(&mut self) -> WindowStats {
        let stats = WindowStats {
            packets: self.window_packets,
            latency_mean_ms: if self.window_packets == 0 {
                0.0
            } else {
                self.window_latency_sum_ms / self.window_packets as f64
            },
            latency_max_ms: self.window_latency_max_ms,
        };

        self.window_packets = 0;
        self.window_latency_sum_ms = 0.0;
        self.window_latency_max_ms = 0.0;

        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> ServerState {
        ServerState::new(1.15)
    }

    #[test]
    fn test_in_order_stream_no_loss() {
        let mut s = state();
        for seq in 0..5 {
            assert_eq!(s.record(seq, 0.0, seq as f64 * 0.05, 1.0), 0);
        }
        assert_eq!(s.packets_received, 5);
        assert_eq!(s.packets_lost, 0);
        assert_eq!(s.first_seq, Some(0));
        assert_eq!(s.last_seq, Some(4));
    }

    #[test]
    fn test_sequence_gap_credits_loss() {
        // Seqs 0,1,2,5,6: the jump from 2 to 5 loses 3 and 4.
        let mut s = state();
        for seq in [0, 1, 2, 5, 6] {
            s.record(seq, 0.0, 0.0, 1.0);
        }
        assert_eq!(s.packets_received, 5);
        assert_eq!(s.packets_lost, 2);
    }

    #[test]
    fn test_out_of_order_arrival_does_not_decrement() {
        // Seqs 0,1,3,2,4: the gap at 3 credits one loss; 2 arriving late
        // neither decrements nor re-credits.
        let mut s = state();
        let credited: Vec<u64> = [0, 1, 3, 2, 4]
            .into_iter()
            .map(|seq| s.record(seq, 0.0, 0.0, 1.0))
            .collect();
        assert_eq!(credited, vec![0, 0, 1, 0, 0]);
        assert_eq!(s.packets_received, 5);
        assert_eq!(s.packets_lost, 1);
        assert_eq!(s.last_seq, Some(4));
    }

    #[test]
    fn test_sequence_reset_is_a_non_event() {
        let mut s = state();
        for seq in [100, 101, 102, 0, 1] {
            s.record(seq, 0.0, 0.0, 1.0);
        }
        assert_eq!(s.packets_lost, 0);
        // last_seq only moves forward.
        assert_eq!(s.last_seq, Some(102));
    }

    #[test]
    fn test_accounting_identity_on_in_order_streams() {
        // received + lost == last - first + 1 for any in-order gappy stream.
        let mut s = state();
        for seq in [3, 4, 7, 8, 20, 21] {
            s.record(seq, 0.0, 0.0, 1.0);
        }
        let first = s.first_seq.unwrap();
        let last = s.last_seq.unwrap();
        assert_eq!(s.packets_received + s.packets_lost, last - first + 1);
    }

    #[test]
    fn test_wave_buffer_is_bounded() {
        let mut s = state();
        for seq in 0..(WAVE_BUFFER_CAPACITY as u64 * 3) {
            s.record(seq, (seq as f64).sin(), seq as f64 * 0.05, 1.0);
            assert!(s.buffered() <= WAVE_BUFFER_CAPACITY);
        }
        assert_eq!(s.buffered(), WAVE_BUFFER_CAPACITY);

        // The ring keeps the newest samples.
        let samples = s.samples();
        assert_eq!(samples.len(), WAVE_BUFFER_CAPACITY);
        let newest_seq = WAVE_BUFFER_CAPACITY as u64 * 3 - 1;
        assert_eq!(*samples.last().unwrap(), (newest_seq as f64).sin());
    }

    #[test]
    fn test_loss_rate() {
        let mut s = state();
        for seq in [0, 1, 2, 5, 6] {
            s.record(seq, 0.0, 0.0, 1.0);
        }
        assert!((s.loss_rate() - 2.0 / 7.0).abs() < 1e-12);
    }

    #[test]
    fn test_window_stats_reset() {
        let mut s = state();
        s.record(0, 0.0, 0.0, 10.0);
        s.record(1, 0.0, 0.05, 30.0);

        let stats = s.take_window_stats();
        assert_eq!(stats.packets, 2);
        assert!((stats.latency_mean_ms - 20.0).abs() < 1e-12);
        assert_eq!(stats.latency_max_ms, 30.0);

        assert_eq!(s.take_window_stats(), WindowStats::default());
    }
}
