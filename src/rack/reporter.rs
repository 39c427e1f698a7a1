//! TCP reporter pushing rack health reports to the DC controller.
//!
//! The reporter is deliberately fire-and-forget: a report that cannot be
//! delivered is dropped, because the next analysis pass produces a fresher
//! one. Only the connection is managed, with capped exponential backoff
//! between reconnect attempts.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::proto::RackReport;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const SEND_TIMEOUT: Duration = Duration::from_secs(2);
const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Connection state machine: Disconnected -> Connecting -> Connected, back
/// to Disconnected on any transport error.
enum Conn {
    Disconnected,
    Connected(TcpStream),
}

pub struct DcReporter {
    addr: String,
    conn: Conn,
    backoff: Duration,
    /// Earliest instant the next connect attempt is allowed.
    retry_at: Option<Instant>,
}

impl DcReporter {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            addr: format!("{host}:{port}"),
            conn: Conn::Disconnected,
            backoff: BACKOFF_START,
            retry_at: None,
        }
    }

    /// Deliver one report, or drop it.
    ///
    /// Returns Ok(true) if the report was written, Ok(false) if it was
    /// dropped (backoff window, connect failure, or send failure). Only
    /// programming errors surface as Err.
    pub async fn report(&mut self, report: &RackReport) -> Result<bool> {
        if matches!(self.conn, Conn::Disconnected) {
            if let Some(retry_at) = self.retry_at {
                if Instant::now() < retry_at {
                    debug!(addr = %self.addr, "DC reconnect backoff active, dropping report");
                    return Ok(false);
                }
            }

            match self.connect().await {
                Ok(stream) => {
                    info!(addr = %self.addr, "connected to DC controller");
                    self.conn = Conn::Connected(stream);
                    self.backoff = BACKOFF_START;
                    self.retry_at = None;
                }
                Err(e) => {
                    warn!(addr = %self.addr, error = %e, "DC connect failed, dropping report");
                    self.schedule_retry();
                    return Ok(false);
                }
            }
        }

        let Conn::Connected(stream) = &mut self.conn else {
            return Ok(false);
        };

        let line = report.encode_line();
        match timeout(SEND_TIMEOUT, stream.write_all(&line)).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(e)) => {
                warn!(addr = %self.addr, error = %e, "DC report send failed, dropping");
                self.conn = Conn::Disconnected;
                self.schedule_retry();
                Ok(false)
            }
            Err(_) => {
                warn!(addr = %self.addr, timeout = ?SEND_TIMEOUT, "DC report send timed out, dropping");
                self.conn = Conn::Disconnected;
                self.schedule_retry();
                Ok(false)
            }
        }
    }

    async fn connect(&self) -> Result<TcpStream> {
        timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.addr))
            .await
            .context("connect timed out")?
            .context("connect failed")
    }

    fn schedule_retry(&mut self) {
        self.retry_at = Some(Instant::now() + jittered(self.backoff, rand::random::<f64>()));
        self.backoff = (self.backoff * 2).min(BACKOFF_CAP);
    }
}

/// Apply +/-20% jitter to a backoff interval. `unit` is a uniform draw in
/// [0, 1), passed in so the scaling stays testable.
fn jittered(base: Duration, unit: f64) -> Duration {
    base.mul_f64(0.8 + 0.4 * unit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut r = DcReporter::new("localhost", 9990);
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(r.backoff);
            r.schedule_retry();
        }
        assert_eq!(
            seen,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(16),
                Duration::from_secs(30),
                Duration::from_secs(30),
            ],
        );
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_secs(10);
        assert_eq!(jittered(base, 0.0), Duration::from_secs(8));
        assert_eq!(jittered(base, 0.5), Duration::from_secs(10));
        assert!(jittered(base, 0.999) < Duration::from_secs(12));
        assert!(jittered(base, 0.999) > Duration::from_secs(11));
    }

    #[tokio::test]
    async fn test_report_dropped_while_backing_off() {
        let mut r = DcReporter::new("localhost", 1);
        r.retry_at = Some(Instant::now() + Duration::from_secs(60));

        let delivered = r
            .report(&RackReport {
                rack_id: 0,
                health_score: 1.0,
                server_count: 0,
                timestamp: 0.0,
            })
            .await
            .unwrap();
        assert!(!delivered);
    }
}
