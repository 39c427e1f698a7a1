use std::time::Duration;

use thiserror::Error;

/// Errors raised while reading configuration from the environment.
///
/// Configuration failures are terminal: `main` logs them and exits with
/// code 1 before any socket is opened.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable {name}")]
    Missing { name: &'static str },

    #[error("invalid value {value:?} for {name}: expected {expected}")]
    Invalid {
        name: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// Configuration for the server agent (L0 sine-wave source).
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Rack this agent belongs to. Stamped into every datagram.
    pub rack_id: u32,

    /// Server identity, unique within the rack.
    pub server_id: u32,

    /// Rack controller UDP target.
    pub controller_host: String,
    pub controller_port: u16,

    /// Nominal sample rate in Hz. Default: 20.
    pub sample_rate_hz: f64,

    /// Carrier amplitude. Default: 1.0.
    pub amplitude: f64,
}

/// Configuration for the rack controller (L1 UDP ingester/analyzer).
#[derive(Debug, Clone)]
pub struct RackConfig {
    /// Rack identity. Datagrams for other racks are dropped at ingest.
    pub rack_id: u32,

    /// UDP bind port. Default: 9999 + rack_id.
    pub udp_listen_port: u16,

    /// Prometheus scrape port. Default: 8000 + rack_id.
    pub metrics_port: u16,

    /// DC controller TCP target.
    pub dc_host: String,
    pub dc_port: u16,

    /// Nominal sample rate the agents transmit at. Default: 20.
    pub sample_rate_hz: f64,

    /// Period of the FFT analysis/reporting pass. Default: 5s.
    pub analysis_interval: Duration,
}

/// Configuration for the DC controller (L2 report aggregator).
#[derive(Debug, Clone)]
pub struct DcConfig {
    /// Datacenter identity, used as the dc_id metric label. Default: 0.
    pub dc_id: u32,

    /// TCP listen port for rack reports. Default: 9990.
    pub listen_port: u16,

    /// Prometheus scrape port. Default: 8100.
    pub metrics_port: u16,

    /// Period of the informational summary log line. Default: 10s.
    pub summary_interval: Duration,
}

impl AgentConfig {
    /// Read agent configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let cfg = Self {
            rack_id: require_u32("RACK_ID")?,
            server_id: require_u32("SERVER_ID")?,
            controller_host: env_str("RACK_CONTROLLER_HOST", "localhost"),
            controller_port: require_u16("RACK_CONTROLLER_PORT")?,
            sample_rate_hz: env_f64("SAMPLE_RATE_HZ", 20.0)?,
            amplitude: env_f64("AMPLITUDE", 1.0)?,
        };

        if !(cfg.sample_rate_hz > 0.0) {
            return Err(invalid(
                "SAMPLE_RATE_HZ",
                cfg.sample_rate_hz.to_string(),
                "a positive rate in Hz",
            ));
        }

        Ok(cfg)
    }

    /// The unique carrier frequency assigned to this (rack, server) pair.
    pub fn carrier_freq_hz(&self) -> f64 {
        carrier_frequency(self.rack_id, self.server_id)
    }
}

impl RackConfig {
    /// Read rack controller configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let rack_id = require_u32("RACK_ID")?;

        let cfg = Self {
            rack_id,
            udp_listen_port: env_u16("UDP_LISTEN_PORT", default_port(9999, rack_id)?)?,
            metrics_port: env_u16("METRICS_PORT", default_port(8000, rack_id)?)?,
            dc_host: env_str("DC_HOST", "localhost"),
            dc_port: env_u16("DC_PORT", 9990)?,
            sample_rate_hz: env_f64("SAMPLE_RATE_HZ", 20.0)?,
            analysis_interval: env_interval("ANALYSIS_INTERVAL_SEC", 5.0)?,
        };

        if !(cfg.sample_rate_hz > 0.0) {
            return Err(invalid(
                "SAMPLE_RATE_HZ",
                cfg.sample_rate_hz.to_string(),
                "a positive rate in Hz",
            ));
        }

        Ok(cfg)
    }

    /// Expected carrier frequency of a server in this rack.
    pub fn expected_freq_hz(&self, server_id: u32) -> f64 {
        carrier_frequency(self.rack_id, server_id)
    }
}

impl DcConfig {
    /// Read DC controller configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            dc_id: env_u32("DC_ID", 0)?,
            listen_port: env_u16("DC_LISTEN_PORT", 9990)?,
            metrics_port: env_u16("METRICS_PORT", 8100)?,
            summary_interval: env_interval("DC_SUMMARY_INTERVAL_SEC", 10.0)?,
        })
    }
}

/// Carrier assignment: base frequency per rack plus a 0.05 Hz offset per
/// server. Rack 0 starts at 1 Hz, rack 1 at 2 Hz, and so on.
pub fn carrier_frequency(rack_id: u32, server_id: u32) -> f64 {
    1.0 + f64::from(rack_id) + 0.05 * f64::from(server_id)
}

// --- Env readers ---

fn invalid(name: &'static str, value: String, expected: &'static str) -> ConfigError {
    ConfigError::Invalid {
        name,
        value,
        expected,
    }
}

fn env_str(name: &'static str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn require_u32(name: &'static str) -> Result<u32, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| invalid(name, raw, "a non-negative integer")),
        Err(_) => Err(ConfigError::Missing { name }),
    }
}

fn require_u16(name: &'static str) -> Result<u16, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| invalid(name, raw, "a port number")),
        Err(_) => Err(ConfigError::Missing { name }),
    }
}

fn env_u32(name: &'static str, default: u32) -> Result<u32, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| invalid(name, raw, "a non-negative integer")),
        Err(_) => Ok(default),
    }
}

fn env_u16(name: &'static str, default: u16) -> Result<u16, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| invalid(name, raw, "a port number")),
        Err(_) => Ok(default),
    }
}

fn env_f64(name: &'static str, default: f64) -> Result<f64, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(v),
            _ => Err(invalid(name, raw, "a finite number")),
        },
        Err(_) => Ok(default),
    }
}

fn env_interval(name: &'static str, default_secs: f64) -> Result<Duration, ConfigError> {
    let secs = env_f64(name, default_secs)?;
    if secs <= 0.0 {
        return Err(invalid(
            name,
            secs.to_string(),
            "a positive interval in seconds",
        ));
    }
    Ok(Duration::from_secs_f64(secs))
}

/// Rack-derived port defaults (9999 + rack_id for UDP, 8000 + rack_id for
/// metrics). Overflow past u16::MAX is a configuration error.
fn default_port(base: u32, rack_id: u32) -> Result<u16, ConfigError> {
    u16::try_from(base + rack_id).map_err(|_| ConfigError::Invalid {
        name: "RACK_ID",
        value: rack_id.to_string(),
        expected: "a rack id small enough to derive default ports",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_carrier_frequency_assignment() {
        assert_eq!(carrier_frequency(0, 0), 1.0);
        assert_eq!(carrier_frequency(0, 3), 1.15);
        assert_eq!(carrier_frequency(1, 0), 2.0);
        assert!((carrier_frequency(2, 7) - 3.35).abs() < 1e-12);
    }

    #[test]
    fn test_default_port_derivation() {
        assert_eq!(default_port(9999, 0).unwrap(), 9999);
        assert_eq!(default_port(9999, 3).unwrap(), 10002);
        assert_eq!(default_port(8000, 2).unwrap(), 8002);
        assert!(default_port(9999, 100_000).is_err());
    }

    #[test]
    fn test_missing_required_var() {
        // A name no test environment defines.
        let err = require_u32("NETWATCH_TEST_UNSET_VAR").unwrap_err();
        assert!(matches!(err, ConfigError::Missing { .. }));
    }
}
