//! DC controller: accepts rack health reports over TCP and aggregates them
//! into a datacenter-wide health score.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DcConfig;
use crate::export::metrics::Metrics;
use crate::proto::RackReport;
use crate::signal;

/// Reports older than this are excluded from the DC aggregate. Their last
/// gauge value is left in place; Prometheus staleness handling takes over
/// on the visualization side.
const STALENESS_WINDOW: Duration = Duration::from_secs(30);

/// A rack report plus its local arrival time. Staleness is judged on the
/// arrival clock, not the sender timestamp, so rack clock skew cannot
/// silently exclude a live rack.
#[derive(Debug, Clone)]
struct ReceivedReport {
    report: RackReport,
    received_at: Instant,
}

/// L2 component: one controller per datacenter.
pub struct DcController {
    cfg: DcConfig,
    metrics: Arc<Metrics>,
    reports: Mutex<HashMap<u32, ReceivedReport>>,
}

impl DcController {
    pub fn new(cfg: DcConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            cfg,
            metrics,
            reports: Mutex::new(HashMap::new()),
        }
    }

    /// Runs the report listener and the periodic summary loop until
    /// cancelled. Returns an error only if the TCP listen fails.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let bind_addr = format!("0.0.0.0:{}", self.cfg.listen_port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("binding TCP listener on {bind_addr}"))?;

        info!(
            dc_id = self.cfg.dc_id,
            addr = %bind_addr,
            summary_interval = ?self.cfg.summary_interval,
            "DC controller started",
        );

        {
            let controller = Arc::clone(&self);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        accepted = listener.accept() => match accepted {
                            Ok((stream, peer)) => {
                                debug!(peer = %peer, "rack connection accepted");
                                let controller = Arc::clone(&controller);
                                let cancel = cancel.clone();
                                tokio::spawn(async move {
                                    controller.read_reports(stream, cancel).await;
                                });
                            }
                            Err(e) => {
                                warn!(error = %e, "accept failed");
                            }
                        }
                    }
                }
            });
        }

        let mut ticker = tokio::time::interval(self.cfg.summary_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.log_summary(),
            }
        }

        info!(dc_id = self.cfg.dc_id, "DC controller stopped");
        Ok(())
    }

    /// Read newline-framed report records from one rack connection until
    /// EOF or a transport error. Malformed records are skipped; only the
    /// transport tears the connection down.
    async fn read_reports(&self, stream: TcpStream, cancel: CancellationToken) {
        let peer = stream.peer_addr().ok();
        let mut lines = BufReader::new(stream).lines();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if !line.trim().is_empty() {
                            self.process_report_line(&line);
                        }
                    }
                    Ok(None) => {
                        debug!(peer = ?peer, "rack connection closed");
                        return;
                    }
                    Err(e) => {
                        warn!(peer = ?peer, error = %e, "rack connection read failed");
                        return;
                    }
                }
            }
        }
    }

    /// Parse and apply one report record.
    fn process_report_line(&self, line: &str) {
        let report = match RackReport::decode_line(line) {
            Ok(r) => r,
            Err(e) => {
                self.metrics.report_parse_errors.inc();
                debug!(error = %e, "skipping malformed report record");
                return;
            }
        };

        self.metrics.reports_received.inc();
        self.metrics
            .rack_health_score
            .with_label_values(&[report.rack_id.to_string().as_str()])
            .set(report.health_score);

        info!(
            rack_id = report.rack_id,
            health_score = report.health_score,
            servers = report.server_count,
            "rack report received",
        );

        self.reports.lock().insert(
            report.rack_id,
            ReceivedReport {
                report,
                received_at: Instant::now(),
            },
        );

        self.recompute_score();
    }

    /// Recompute the DC health score from reports inside the staleness
    /// window and republish the gauge.
    fn recompute_score(&self) -> f64 {
        let fresh: Vec<f64> = {
            let reports = self.reports.lock();
            reports
                .values()
                .filter(|r| r.received_at.elapsed() < STALENESS_WINDOW)
                .map(|r| r.report.health_score)
                .collect()
        };

        if fresh.is_empty() {
            debug!(dc_id = self.cfg.dc_id, "no fresh rack reports");
        }

        let score = signal::dc_health_score(&fresh);
        self.metrics
            .dc_health_score
            .with_label_values(&[self.cfg.dc_id.to_string().as_str()])
            .set(score);
        score
    }

    /// Informational summary line, logged every summary interval.
    fn log_summary(&self) {
        let snapshot: Vec<(u32, RackReport, Duration)> = {
            let reports = self.reports.lock();
            let mut entries: Vec<_> = reports
                .values()
                .map(|r| (r.report.rack_id, r.report.clone(), r.received_at.elapsed()))
                .collect();
            entries.sort_by_key(|&(rack_id, _, _)| rack_id);
            entries
        };

        if snapshot.is_empty() {
            info!(dc_id = self.cfg.dc_id, "no rack reports yet");
            return;
        }

        let racks = snapshot.len();
        for (rack_id, report, age) in snapshot {
            info!(
                rack_id,
                health_score = report.health_score,
                servers = report.server_count,
                age_sec = age.as_secs_f64(),
                "rack status",
            );
        }

        let score = self.recompute_score();
        info!(
            dc_id = self.cfg.dc_id,
            health_score = score,
            status = classify_dc(score),
            racks,
            "DC health",
        );
    }
}

/// Datacenter-level status classification.
fn classify_dc(score: f64) -> &'static str {
    if score >= 0.8 {
        "healthy"
    } else if score >= 0.5 {
        "degraded"
    } else {
        "critical"
    }
}
