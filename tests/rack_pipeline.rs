//! Blackbox scenarios for the rack ingest/analysis pipeline, driven
//! through the controller's public API with encoded datagrams.

use std::f64::consts::PI;
use std::sync::Arc;
use std::time::Duration;

use netwatch::clock;
use netwatch::config::RackConfig;
use netwatch::export::metrics::Metrics;
use netwatch::proto::SampleDatagram;
use netwatch::rack::RackController;

const SAMPLE_RATE: f64 = 20.0;

fn rack_controller(rack_id: u32) -> (Arc<RackController>, Arc<Metrics>) {
    let metrics = Arc::new(Metrics::new(0).unwrap());
    let cfg = RackConfig {
        rack_id,
        udp_listen_port: 0,
        metrics_port: 0,
        dc_host: "localhost".to_string(),
        dc_port: 9990,
        sample_rate_hz: SAMPLE_RATE,
        analysis_interval: Duration::from_secs(5),
    };
    (
        Arc::new(RackController::new(cfg, Arc::clone(&metrics))),
        metrics,
    )
}

fn datagram(rack_id: u32, server_id: u32, seq: u64, wave_sample: f64) -> Vec<u8> {
    SampleDatagram {
        rack_id,
        server_id,
        seq,
        // A few milliseconds in flight, so measured latency stays positive.
        sent_ts: clock::unix_now_seconds() - 0.005,
        wave_sample,
    }
    .encode()
}

fn carrier_sample(freq: f64, n: u64) -> f64 {
    (2.0 * PI * freq * n as f64 / SAMPLE_RATE).sin()
}

/// Deterministic uniform pseudo-noise in [-1, 1] (xorshift64*).
fn noise_sample(state: &mut u64) -> f64 {
    *state ^= *state >> 12;
    *state ^= *state << 25;
    *state ^= *state >> 27;
    let bits = state.wrapping_mul(0x2545f4914f6cdd1d);
    (bits >> 11) as f64 / (1u64 << 53) as f64 * 2.0 - 1.0
}

#[test]
fn test_clean_channel() {
    // Agent rack=0 server=3 transmits its 1.15 Hz carrier losslessly.
    let (rack, metrics) = rack_controller(0);

    for seq in 0..200 {
        rack.ingest(&datagram(0, 3, seq, carrier_sample(1.15, seq)));
    }

    let report = rack.run_analysis_pass();

    let labels = ["0", "3"];
    assert_eq!(
        metrics.packets_received.with_label_values(&labels).get(),
        200.0,
    );
    assert_eq!(metrics.packets_lost.with_label_values(&labels).get(), 0.0);
    assert!(metrics.spectral_error.with_label_values(&labels).get() < 0.1);
    assert!(metrics.snr_db.with_label_values(&labels).get() > 15.0);
    assert!(report.health_score >= 0.9);
    assert_eq!(report.server_count, 1);
}

#[test]
fn test_sequence_gap() {
    let (rack, metrics) = rack_controller(0);

    for seq in [0u64, 1, 2, 5, 6] {
        rack.ingest(&datagram(0, 1, seq, carrier_sample(1.05, seq)));
    }

    let labels = ["0", "1"];
    assert_eq!(
        metrics.packets_received.with_label_values(&labels).get(),
        5.0,
    );
    assert_eq!(metrics.packets_lost.with_label_values(&labels).get(), 2.0);
}

#[test]
fn test_out_of_order_arrival() {
    let (rack, metrics) = rack_controller(0);

    for seq in [0u64, 1, 3, 2, 4] {
        rack.ingest(&datagram(0, 1, seq, carrier_sample(1.05, seq)));
    }

    let labels = ["0", "1"];
    assert_eq!(
        metrics.packets_received.with_label_values(&labels).get(),
        5.0,
    );
    // The gap at 3 credited one loss; 2 arriving late does not decrement.
    assert_eq!(metrics.packets_lost.with_label_values(&labels).get(), 1.0);
}

#[test]
fn test_wrong_rack_dropped() {
    let (rack, metrics) = rack_controller(0);

    rack.ingest(&datagram(1, 0, 0, 0.5));

    assert_eq!(rack.server_count(), 0);
    assert_eq!(metrics.cross_rack_drops.get(), 1.0);
    let text = metrics.render().unwrap();
    assert!(!text.contains("server_id="));
}

#[test]
fn test_malformed_datagram_counted_and_dropped() {
    let (rack, metrics) = rack_controller(0);

    rack.ingest(b"definitely not json");
    rack.ingest(br#"{"rack_id":0,"server_id":0,"seq":0,"sent_ts":1.0,"wave_sample":9.0}"#);

    assert_eq!(rack.server_count(), 0);
    assert_eq!(metrics.decode_errors.get(), 2.0);
}

#[test]
fn test_starvation_reports_healthy() {
    let (rack, metrics) = rack_controller(0);

    let report = rack.run_analysis_pass();

    assert_eq!(report.health_score, 1.0);
    assert_eq!(report.server_count, 0);

    // No per-server gauges exist for servers never heard from.
    let text = metrics.render().unwrap();
    assert!(!text.contains("server_id="));
}

#[test]
fn test_noisy_server_among_clean_ones() {
    // Server 1 transmits noise; servers 0 and 2 stay on their carriers.
    let (rack, metrics) = rack_controller(0);

    let mut rng = 0x9e3779b97f4a7c15u64;
    for seq in 0..200 {
        rack.ingest(&datagram(0, 0, seq, carrier_sample(1.0, seq)));
        rack.ingest(&datagram(0, 1, seq, noise_sample(&mut rng)));
        rack.ingest(&datagram(0, 2, seq, carrier_sample(1.1, seq)));
    }

    let report = rack.run_analysis_pass();

    let noisy = metrics.spectral_error.with_label_values(&["0", "1"]).get();
    assert!(noisy > 0.7, "noisy server error = {noisy}");

    for server in ["0", "2"] {
        let clean = metrics
            .spectral_error
            .with_label_values(&["0", server])
            .get();
        assert!(clean < 0.1, "server {server} error = {clean}");
    }

    // Health is one minus the mean error across the three servers.
    let mean = (noisy
        + metrics.spectral_error.with_label_values(&["0", "0"]).get()
        + metrics.spectral_error.with_label_values(&["0", "2"]).get())
        / 3.0;
    assert!((report.health_score - (1.0 - mean)).abs() < 1e-9);
    assert!((0.0..=1.0).contains(&report.health_score));
}

#[test]
fn test_short_buffer_skips_gauges() {
    // Fewer samples than the FFT minimum: counters move, gauges do not.
    let (rack, metrics) = rack_controller(0);

    for seq in 0..10 {
        rack.ingest(&datagram(0, 4, seq, carrier_sample(1.2, seq)));
    }

    let report = rack.run_analysis_pass();

    assert_eq!(report.health_score, 1.0);
    assert_eq!(
        metrics.packets_received.with_label_values(&["0", "4"]).get(),
        10.0,
    );

    let text = metrics.render().unwrap();
    assert!(!text.contains("netwatch_server_spectral_error{"));
}

#[test]
fn test_dropped_datagrams_raise_spectral_error() {
    // Dropping every 10th datagram must read worse than lossless.
    let (clean_rack, clean_metrics) = rack_controller(0);
    let (lossy_rack, lossy_metrics) = rack_controller(0);

    for seq in 0..200u64 {
        clean_rack.ingest(&datagram(0, 0, seq, carrier_sample(1.0, seq)));
        if seq % 10 != 0 {
            lossy_rack.ingest(&datagram(0, 0, seq, carrier_sample(1.0, seq)));
        }
    }

    clean_rack.run_analysis_pass();
    lossy_rack.run_analysis_pass();

    let clean = clean_metrics
        .spectral_error
        .with_label_values(&["0", "0"])
        .get();
    let lossy = lossy_metrics
        .spectral_error
        .with_label_values(&["0", "0"])
        .get();
    assert!(lossy > clean, "lossy {lossy} <= clean {clean}");

    assert!(
        lossy_metrics.packets_lost.with_label_values(&["0", "0"]).get() > 0.0,
    );
}
