//! Wire types shared by the three tiers.
//!
//! Agents emit one JSON object per UDP datagram; rack controllers forward
//! one newline-terminated JSON object per report over TCP. Decoding is
//! strict: ill-formed records are rejected here so nothing downstream has
//! to tolerate partial data.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on an encoded sample datagram. The JSON encoding of five
/// numeric fields comfortably fits; anything larger is not ours.
pub const MAX_DATAGRAM_LEN: usize = 256;

/// Errors that can occur while decoding an inbound record.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("datagram too large: {size} bytes")]
    Oversized { size: usize },

    #[error("malformed record: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("non-finite {field}")]
    NonFinite { field: &'static str },

    #[error("wave sample {value} outside [-1, 1]")]
    WaveOutOfRange { value: f64 },
}

/// One sample from a server agent's sinusoidal carrier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleDatagram {
    /// Destination rack; sanity-checked against the receiving controller.
    pub rack_id: u32,

    /// Sender identity within the rack.
    pub server_id: u32,

    /// Monotonically increasing per-sender sequence number. A decrease is
    /// treated as a sender reset, never as loss.
    pub seq: u64,

    /// Sender wall-clock timestamp, seconds since the Unix epoch.
    pub sent_ts: f64,

    /// Carrier sample, amplitude 1.
    pub wave_sample: f64,
}

/// One aggregated health report from a rack controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RackReport {
    pub rack_id: u32,

    /// Rack health in [0, 1]; 1 means no evidence of degradation.
    pub health_score: f64,

    /// Number of servers with state at the time of the report.
    pub server_count: usize,

    /// Report wall-clock timestamp, seconds since the Unix epoch. Used by
    /// the DC controller for staleness exclusion.
    pub timestamp: f64,
}

impl SampleDatagram {
    /// Encode for UDP transmission.
    pub fn encode(&self) -> Vec<u8> {
        // Serialization of a plain numeric struct cannot fail.
        serde_json::to_vec(self).expect("sample datagram serializes")
    }

    /// Decode and validate an inbound datagram.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() > MAX_DATAGRAM_LEN {
            return Err(DecodeError::Oversized { size: data.len() });
        }

        let datagram: Self = serde_json::from_slice(data)?;

        if !datagram.sent_ts.is_finite() {
            return Err(DecodeError::NonFinite { field: "sent_ts" });
        }
        if !datagram.wave_sample.is_finite() {
            return Err(DecodeError::NonFinite {
                field: "wave_sample",
            });
        }
        // Amplitude is fixed at 1; allow a little slack for senders that
        // ride the boundary in floating point.
        if datagram.wave_sample.abs() > 1.0 + 1e-9 {
            return Err(DecodeError::WaveOutOfRange {
                value: datagram.wave_sample,
            });
        }

        Ok(datagram)
    }
}

impl RackReport {
    /// Encode as a newline-terminated record for the TCP report stream.
    pub fn encode_line(&self) -> Vec<u8> {
        let mut line = serde_json::to_vec(self).expect("rack report serializes");
        line.push(b'\n');
        line
    }

    /// Decode one line of the TCP report stream.
    pub fn decode_line(line: &str) -> Result<Self, DecodeError> {
        let report: Self = serde_json::from_str(line)?;

        if !report.health_score.is_finite() {
            return Err(DecodeError::NonFinite {
                field: "health_score",
            });
        }
        if !report.timestamp.is_finite() {
            return Err(DecodeError::NonFinite { field: "timestamp" });
        }

        Ok(report)
    }
}
