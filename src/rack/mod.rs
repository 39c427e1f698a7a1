//! Rack controller: terminates UDP from the rack's servers, runs the
//! periodic spectral analysis pass, and reports rack health to the DC
//! controller.

pub mod reporter;
pub mod state;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock;
use crate::config::RackConfig;
use crate::export::metrics::Metrics;
use crate::proto::{RackReport, SampleDatagram};
use crate::signal;

use self::reporter::DcReporter;
use self::state::ServerState;

/// How long shutdown waits for the ingest task to drain.
const DRAIN_DEADLINE: Duration = Duration::from_secs(1);

/// L1 component: one controller per rack.
///
/// The per-server record is the unit of mutual exclusion; the outer map is
/// write-locked only to insert a newly seen server.
pub struct RackController {
    cfg: RackConfig,
    metrics: Arc<Metrics>,
    servers: RwLock<HashMap<u32, Arc<Mutex<ServerState>>>>,
    started: Instant,
    /// Foreign rack ids already logged, one warn line per offender.
    logged_foreign: Mutex<HashSet<u32>>,
}

impl RackController {
    pub fn new(cfg: RackConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            cfg,
            metrics,
            servers: RwLock::new(HashMap::new()),
            started: Instant::now(),
            logged_foreign: Mutex::new(HashSet::new()),
        }
    }

    /// Runs the UDP ingest loop and the periodic analysis/report loop until
    /// cancelled. Returns an error only if the UDP bind fails.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let bind_addr = format!("0.0.0.0:{}", self.cfg.udp_listen_port);
        let socket = UdpSocket::bind(&bind_addr)
            .await
            .with_context(|| format!("binding UDP listener on {bind_addr}"))?;

        info!(
            rack_id = self.cfg.rack_id,
            addr = %bind_addr,
            analysis_interval = ?self.cfg.analysis_interval,
            "rack controller started",
        );

        let ingest_task = {
            let controller = Arc::clone(&self);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 2048];
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        recv = socket.recv_from(&mut buf) => match recv {
                            Ok((len, _addr)) => controller.ingest(&buf[..len]),
                            Err(e) => {
                                warn!(error = %e, "UDP receive failed");
                            }
                        }
                    }
                }
            })
        };

        let mut reporter = DcReporter::new(&self.cfg.dc_host, self.cfg.dc_port);

        let mut ticker = tokio::time::interval(self.cfg.analysis_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Consume the immediate first tick; the first pass should see a
        // full interval of samples.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.run_analysis_pass();
                    match reporter.report(&report).await {
                        Ok(true) => self.metrics.reports_sent.inc(),
                        Ok(false) => self.metrics.report_send_errors.inc(),
                        Err(e) => {
                            warn!(error = %e, "DC reporter failed");
                            self.metrics.report_send_errors.inc();
                        }
                    }
                }
            }
        }

        if tokio::time::timeout(DRAIN_DEADLINE, ingest_task).await.is_err() {
            debug!("ingest task did not drain before deadline");
        }

        info!(rack_id = self.cfg.rack_id, "rack controller stopped");
        Ok(())
    }

    /// Decode and account one inbound datagram.
    pub fn ingest(&self, data: &[u8]) {
        let recv_ts = clock::unix_now_seconds();

        let datagram = match SampleDatagram::decode(data) {
            Ok(d) => d,
            Err(e) => {
                self.metrics.decode_errors.inc();
                debug!(error = %e, "dropping undecodable datagram");
                return;
            }
        };

        // Wrong-rack traffic is a configuration bug on the sender side,
        // not a measurement; drop it without creating state.
        if datagram.rack_id != self.cfg.rack_id {
            if self.logged_foreign.lock().insert(datagram.rack_id) {
                warn!(
                    got_rack_id = datagram.rack_id,
                    our_rack_id = self.cfg.rack_id,
                    "dropping datagrams addressed to another rack",
                );
            }
            self.metrics.cross_rack_drops.inc();
            return;
        }

        let server = self.server_entry(datagram.server_id);

        let relative_time = self.started.elapsed().as_secs_f64();
        let latency_ms = ((recv_ts - datagram.sent_ts) * 1000.0).max(0.0);

        let lost = server
            .lock()
            .record(datagram.seq, datagram.wave_sample, relative_time, latency_ms);

        let rack_label = self.cfg.rack_id.to_string();
        let server_label = datagram.server_id.to_string();
        let labels = [rack_label.as_str(), server_label.as_str()];

        self.metrics.packets_received.with_label_values(&labels).inc();
        if lost > 0 {
            self.metrics
                .packets_lost
                .with_label_values(&labels)
                .inc_by(lost as f64);
        }
        self.metrics
            .latency_ms
            .with_label_values(&labels)
            .observe(latency_ms);

        if datagram.seq % 100 == 0 {
            debug!(
                server_id = datagram.server_id,
                seq = datagram.seq,
                wave = datagram.wave_sample,
                latency_ms,
                "received sample",
            );
        }
    }

    /// One analysis pass: FFT every server with enough buffered samples,
    /// publish gauges, and produce the rack report for the DC controller.
    pub fn run_analysis_pass(&self) -> RackReport {
        let mut entries: Vec<(u32, Arc<Mutex<ServerState>>)> = self
            .servers
            .read()
            .iter()
            .map(|(&id, state)| (id, Arc::clone(state)))
            .collect();
        entries.sort_by_key(|&(id, _)| id);

        let server_count = entries.len();
        let rack_label = self.cfg.rack_id.to_string();
        let mut fresh_errors = Vec::with_capacity(server_count);

        for (server_id, server) in entries {
            // Snapshot under the lock, analyze outside it; samples arriving
            // during the FFT are picked up by the next pass.
            let (samples, expected_freq, received, lost, loss_rate, window) = {
                let mut s = server.lock();
                (
                    s.samples(),
                    s.expected_freq_hz,
                    s.packets_received,
                    s.packets_lost,
                    s.loss_rate(),
                    s.take_window_stats(),
                )
            };

            if samples.len() < signal::MIN_SAMPLES {
                debug!(
                    server_id,
                    buffered = samples.len(),
                    "skipping analysis, not enough samples",
                );
                continue;
            }

            let analysis = signal::analyze(&samples, expected_freq, self.cfg.sample_rate_hz);
            let health = signal::classify(analysis.spectral_error);

            {
                let mut s = server.lock();
                s.last_spectral_error = Some(analysis.spectral_error);
                s.last_snr_db = Some(analysis.snr_db);
            }

            let server_label = server_id.to_string();
            let labels = [rack_label.as_str(), server_label.as_str()];
            self.metrics
                .spectral_error
                .with_label_values(&labels)
                .set(analysis.spectral_error);
            self.metrics
                .snr_db
                .with_label_values(&labels)
                .set(analysis.snr_db);

            let arrival_rate_hz =
                window.packets as f64 / self.cfg.analysis_interval.as_secs_f64();
            info!(
                server_id,
                received,
                lost,
                loss_rate,
                arrival_rate_hz,
                latency_mean_ms = window.latency_mean_ms,
                latency_max_ms = window.latency_max_ms,
                spectral_error = analysis.spectral_error,
                snr_db = analysis.snr_db,
                health = %health,
                "server analysis",
            );

            fresh_errors.push(analysis.spectral_error);
        }

        if fresh_errors.is_empty() {
            debug!(
                rack_id = self.cfg.rack_id,
                server_count, "analysis pass with no fresh data",
            );
        }

        let health_score = signal::rack_health_score(&fresh_errors);
        self.metrics
            .rack_health_score
            .with_label_values(&[rack_label.as_str()])
            .set(health_score);

        info!(
            rack_id = self.cfg.rack_id,
            health_score,
            servers = server_count,
            fresh = fresh_errors.len(),
            "rack health",
        );

        RackReport {
            rack_id: self.cfg.rack_id,
            health_score,
            server_count,
            timestamp: clock::unix_now_seconds(),
        }
    }

    /// Number of servers with state, for tests and diagnostics.
    pub fn server_count(&self) -> usize {
        self.servers.read().len()
    }

    fn server_entry(&self, server_id: u32) -> Arc<Mutex<ServerState>> {
        if let Some(server) = self.servers.read().get(&server_id) {
            return Arc::clone(server);
        }

        let mut servers = self.servers.write();
        let server = servers.entry(server_id).or_insert_with(|| {
            let freq = self.cfg.expected_freq_hz(server_id);
            info!(server_id, expected_freq_hz = freq, "tracking new server");
            Arc::new(Mutex::new(ServerState::new(freq)))
        });
        Arc::clone(server)
    }
}
