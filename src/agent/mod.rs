//! Server agent: a phase-locked sine-wave source.
//!
//! Emits one UDP datagram per sample at the configured rate toward its
//! rack controller. The carrier is intentionally lossy: send failures are
//! dropped, never retried, because a retried sample would arrive at the
//! wrong phase and falsify the spectral picture downstream.

use std::f64::consts::PI;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{self, SampleClock};
use crate::config::AgentConfig;
use crate::proto::SampleDatagram;

/// L0 component: one agent per monitored server.
pub struct ServerAgent {
    cfg: AgentConfig,
    freq_hz: f64,
}

impl ServerAgent {
    /// Creates a new agent; the carrier frequency is derived once here.
    pub fn new(cfg: AgentConfig) -> Self {
        let freq_hz = cfg.carrier_freq_hz();
        Self { cfg, freq_hz }
    }

    /// Runs the sample loop until cancelled.
    ///
    /// Returns an error only for unrecoverable setup failures (unresolvable
    /// target address, no local socket); transient send failures are logged
    /// and dropped.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let target = format!("{}:{}", self.cfg.controller_host, self.cfg.controller_port);

        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("binding agent UDP socket")?;
        socket
            .connect(&target)
            .await
            .with_context(|| format!("resolving rack controller {target}"))?;

        info!(
            rack_id = self.cfg.rack_id,
            server_id = self.cfg.server_id,
            target = %target,
            freq_hz = self.freq_hz,
            sample_rate_hz = self.cfg.sample_rate_hz,
            "server agent started",
        );

        let ticks = SampleClock::new(self.cfg.sample_rate_hz);

        // Sample phase is anchored to the index n, not to wall time, so the
        // transmitted waveform stays a clean sinusoid even if the sender
        // clock drifts.
        let mut n: u64 = 0;
        let mut seq: u64 = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(sent = seq, "server agent stopping");
                    return Ok(());
                }
                _ = tokio::time::sleep_until(ticks.deadline(n)) => {
                    let t = n as f64 / self.cfg.sample_rate_hz;
                    let datagram = SampleDatagram {
                        rack_id: self.cfg.rack_id,
                        server_id: self.cfg.server_id,
                        seq,
                        sent_ts: clock::unix_now_seconds(),
                        wave_sample: self.sample_at(t),
                    };

                    match socket.send(&datagram.encode()).await {
                        Ok(_) => {
                            if seq % 100 == 0 {
                                debug!(seq, t, wave = datagram.wave_sample, "sent sample");
                            }
                        }
                        Err(e) => {
                            // Lossy by design: drop and move on.
                            debug!(seq, error = %e, "sample send failed, dropping");
                        }
                    }

                    n += 1;
                    seq += 1;

                    if n % 10_000 == 0 && ticks.elapsed_seconds() > 0.0 {
                        let actual_rate = n as f64 / ticks.elapsed_seconds();
                        if (actual_rate - self.cfg.sample_rate_hz).abs()
                            > 0.1 * self.cfg.sample_rate_hz
                        {
                            warn!(
                                actual_rate,
                                nominal = self.cfg.sample_rate_hz,
                                "sample loop falling behind schedule",
                            );
                        }
                    }
                }
            }
        }
    }

    /// Carrier value at time t: `A * sin(2π f t)`.
    fn sample_at(&self, t: f64) -> f64 {
        self.cfg.amplitude * (2.0 * PI * self.freq_hz * t).sin()
    }
}
