use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Latency histogram bucket boundaries in milliseconds.
const LATENCY_BUCKETS_MS: [f64; 9] = [1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0];

/// Prometheus metrics shared by the rack and DC controllers.
///
/// All metrics use the "netwatch" namespace. Health gauges and packet
/// counters are the primary surface; the drop/error counters exist for
/// debugging ingest problems.
pub struct Metrics {
    registry: Registry,
    port: u16,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Per-server spectral error from the latest analysis pass.
    pub spectral_error: GaugeVec,
    /// Per-server SNR in dB from the latest analysis pass.
    pub snr_db: GaugeVec,
    /// Datagrams accepted per server.
    pub packets_received: CounterVec,
    /// Losses inferred from sequence gaps per server.
    pub packets_lost: CounterVec,
    /// One-way datagram latency per server.
    pub latency_ms: HistogramVec,
    /// Rack health score, set by the rack controller and republished by
    /// the DC controller for racks it hears from.
    pub rack_health_score: GaugeVec,
    /// Datacenter health score.
    pub dc_health_score: GaugeVec,

    /// Inbound records dropped at the decode boundary.
    pub decode_errors: Counter,
    /// Datagrams addressed to a different rack.
    pub cross_rack_drops: Counter,
    /// Reports successfully written to the DC connection.
    pub reports_sent: Counter,
    /// Reports dropped because the DC transport failed.
    pub report_send_errors: Counter,
    /// Reports accepted by the DC controller.
    pub reports_received: Counter,
    /// Report lines skipped as malformed by the DC controller.
    pub report_parse_errors: Counter,
}

impl Metrics {
    /// Creates a new metrics instance with all metrics registered.
    pub fn new(port: u16) -> Result<Self> {
        let registry = Registry::new();

        let spectral_error = GaugeVec::new(
            Opts::new(
                "server_spectral_error",
                "Fraction of spectral power outside the carrier neighborhood (0=clean, 1=noise).",
            )
            .namespace("netwatch"),
            &["rack_id", "server_id"],
        )?;
        let snr_db = GaugeVec::new(
            Opts::new(
                "server_snr_db",
                "Carrier signal-to-noise ratio in dB.",
            )
            .namespace("netwatch"),
            &["rack_id", "server_id"],
        )?;
        let packets_received = CounterVec::new(
            Opts::new(
                "packets_received_total",
                "Total sample datagrams received per server.",
            )
            .namespace("netwatch"),
            &["rack_id", "server_id"],
        )?;
        let packets_lost = CounterVec::new(
            Opts::new(
                "packets_lost_total",
                "Total datagram losses inferred from sequence gaps per server.",
            )
            .namespace("netwatch"),
            &["rack_id", "server_id"],
        )?;
        let latency_ms = HistogramVec::new(
            HistogramOpts::new("latency_ms", "One-way datagram latency in milliseconds.")
                .namespace("netwatch")
                .buckets(LATENCY_BUCKETS_MS.to_vec()),
            &["rack_id", "server_id"],
        )?;
        let rack_health_score = GaugeVec::new(
            Opts::new(
                "rack_health_score",
                "Rack health score (0=failed, 1=healthy).",
            )
            .namespace("netwatch"),
            &["rack_id"],
        )?;
        let dc_health_score = GaugeVec::new(
            Opts::new(
                "dc_health_score",
                "Datacenter health score (0=failed, 1=healthy).",
            )
            .namespace("netwatch"),
            &["dc_id"],
        )?;

        let decode_errors = Counter::with_opts(
            Opts::new(
                "decode_errors_total",
                "Inbound records dropped at the decode boundary.",
            )
            .namespace("netwatch"),
        )?;
        let cross_rack_drops = Counter::with_opts(
            Opts::new(
                "cross_rack_drops_total",
                "Datagrams dropped because they were addressed to a different rack.",
            )
            .namespace("netwatch"),
        )?;
        let reports_sent = Counter::with_opts(
            Opts::new(
                "reports_sent_total",
                "Rack reports successfully written to the DC connection.",
            )
            .namespace("netwatch"),
        )?;
        let report_send_errors = Counter::with_opts(
            Opts::new(
                "report_send_errors_total",
                "Rack reports dropped because the DC transport failed.",
            )
            .namespace("netwatch"),
        )?;
        let reports_received = Counter::with_opts(
            Opts::new(
                "reports_received_total",
                "Rack reports accepted by the DC controller.",
            )
            .namespace("netwatch"),
        )?;
        let report_parse_errors = Counter::with_opts(
            Opts::new(
                "report_parse_errors_total",
                "Report lines skipped as malformed by the DC controller.",
            )
            .namespace("netwatch"),
        )?;

        registry.register(Box::new(spectral_error.clone()))?;
        registry.register(Box::new(snr_db.clone()))?;
        registry.register(Box::new(packets_received.clone()))?;
        registry.register(Box::new(packets_lost.clone()))?;
        registry.register(Box::new(latency_ms.clone()))?;
        registry.register(Box::new(rack_health_score.clone()))?;
        registry.register(Box::new(dc_health_score.clone()))?;
        registry.register(Box::new(decode_errors.clone()))?;
        registry.register(Box::new(cross_rack_drops.clone()))?;
        registry.register(Box::new(reports_sent.clone()))?;
        registry.register(Box::new(report_send_errors.clone()))?;
        registry.register(Box::new(reports_received.clone()))?;
        registry.register(Box::new(report_parse_errors.clone()))?;

        Ok(Self {
            registry,
            port,
            shutdown: parking_lot::Mutex::new(None),
            spectral_error,
            snr_db,
            packets_received,
            packets_lost,
            latency_ms,
            rack_health_score,
            dc_health_score,
            decode_errors,
            cross_rack_drops,
            reports_sent,
            report_send_errors,
            reports_received,
            report_parse_errors,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let bind_addr = format!("0.0.0.0:{}", self.port);

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the metrics server.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }

    /// Renders the registry in Prometheus text exposition format.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .context("encoding metrics")?;

        String::from_utf8(buffer).context("metrics text is not UTF-8")
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names_carry_namespace() {
        let metrics = Metrics::new(0).unwrap();

        metrics
            .spectral_error
            .with_label_values(&["0", "3"])
            .set(0.04);
        metrics
            .packets_received
            .with_label_values(&["0", "3"])
            .inc_by(42.0);
        metrics
            .latency_ms
            .with_label_values(&["0", "3"])
            .observe(12.5);
        metrics.rack_health_score.with_label_values(&["0"]).set(0.96);
        metrics.dc_health_score.with_label_values(&["0"]).set(0.9);

        let text = metrics.render().unwrap();
        assert!(text.contains("netwatch_server_spectral_error"));
        assert!(text.contains("netwatch_packets_received_total"));
        assert!(text.contains("netwatch_latency_ms_bucket"));
        assert!(text.contains("netwatch_rack_health_score"));
        assert!(text.contains("netwatch_dc_health_score"));
        assert!(text.contains(r#"rack_id="0",server_id="3""#));
    }

    #[test]
    fn test_latency_buckets_match_contract() {
        let metrics = Metrics::new(0).unwrap();
        metrics
            .latency_ms
            .with_label_values(&["0", "0"])
            .observe(3.0);

        let text = metrics.render().unwrap();
        for bound in ["1", "5", "10", "25", "50", "100", "250", "500", "1000"] {
            assert!(
                text.contains(&format!(r#"le="{bound}""#)),
                "missing bucket {bound}",
            );
        }
        assert!(text.contains(r#"le="+Inf""#));
    }
}
