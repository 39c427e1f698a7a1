//! Spectral health analysis of carrier sample buffers.
//!
//! Each monitored server transmits a pure sine at a known frequency; any
//! transport pathology (loss, jitter, reordering, bursty delay) smears
//! energy out of the carrier bin into the rest of the spectrum. The
//! fraction of power outside the carrier neighborhood is the spectral
//! error, a dimensionless health score in [0, 1].

use rustfft::{num_complex::Complex, FftPlanner};

/// Minimum buffer length for a meaningful FFT pass.
pub const MIN_SAMPLES: usize = 32;

/// Floor applied to noise power before division.
const EPSILON: f64 = 1e-12;

/// Spectral error below this is a healthy carrier.
const THRESHOLD_HEALTHY: f64 = 0.2;

/// Spectral error below this (and above healthy) is a warning.
const THRESHOLD_WARNING: f64 = 0.5;

/// Output of one FFT pass over a server's wave buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpectralAnalysis {
    /// Fraction of spectral power outside the carrier neighborhood, in
    /// [0, 1]. Lower is healthier.
    pub spectral_error: f64,

    /// Signal-to-noise ratio in dB. `-inf` when there is no data.
    pub snr_db: f64,
}

impl SpectralAnalysis {
    /// The "no data yet" result: callers skip metric updates rather than
    /// reporting degraded health.
    pub fn insufficient() -> Self {
        Self {
            spectral_error: 1.0,
            snr_db: f64::NEG_INFINITY,
        }
    }
}

/// Carrier health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Warning,
    Critical,
}

impl Health {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Health {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a spectral error value.
pub fn classify(spectral_error: f64) -> Health {
    if spectral_error < THRESHOLD_HEALTHY {
        Health::Healthy
    } else if spectral_error < THRESHOLD_WARNING {
        Health::Warning
    } else {
        Health::Critical
    }
}

/// Analyze a wave buffer against its expected carrier frequency.
///
/// The samples are treated as a uniform grid at `sample_rate`. Steps: mean
/// removal, Hanning window, real FFT, power spectrum, then a 3-bin carrier
/// neighborhood (target bin ± 1) versus everything else.
pub fn analyze(samples: &[f64], expected_freq: f64, sample_rate: f64) -> SpectralAnalysis {
    let n = samples.len();
    if n < MIN_SAMPLES {
        return SpectralAnalysis::insufficient();
    }

    let mean = samples.iter().sum::<f64>() / n as f64;

    let mut buffer: Vec<Complex<f64>> = samples
        .iter()
        .enumerate()
        .map(|(i, &s)| Complex::new((s - mean) * hanning(i, n), 0.0))
        .collect();

    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(n);
    fft.process(&mut buffer);

    // Real input: the spectrum is fully described by the first n/2 + 1 bins.
    let bins = n / 2 + 1;
    let power: Vec<f64> = buffer[..bins]
        .iter()
        .map(|c| {
            let magnitude = c.norm() / n as f64;
            magnitude * magnitude
        })
        .collect();

    let target = target_bin(expected_freq, sample_rate, n, bins);
    let lo = target.saturating_sub(1);
    let hi = (target + 1).min(bins - 1);

    let signal_power: f64 = power[lo..=hi].iter().sum();
    let total_power: f64 = power.iter().sum();
    let noise_power = (total_power - signal_power).max(0.0);

    let snr_db = 10.0 * (signal_power / noise_power.max(EPSILON)).log10();

    let spectral_error = if total_power < EPSILON {
        // Dead air: maximum error.
        1.0
    } else {
        (noise_power / total_power).clamp(0.0, 1.0)
    };

    SpectralAnalysis {
        spectral_error,
        snr_db,
    }
}

/// Rack health: one minus the mean spectral error across servers with
/// fresh data. An empty slice is no evidence of degradation.
pub fn rack_health_score(spectral_errors: &[f64]) -> f64 {
    if spectral_errors.is_empty() {
        return 1.0;
    }

    let mean = spectral_errors.iter().sum::<f64>() / spectral_errors.len() as f64;
    (1.0 - mean).clamp(0.0, 1.0)
}

/// DC health: mean of fresh rack scores. An empty slice is no evidence of
/// degradation.
pub fn dc_health_score(rack_scores: &[f64]) -> f64 {
    if rack_scores.is_empty() {
        return 1.0;
    }

    let mean = rack_scores.iter().sum::<f64>() / rack_scores.len() as f64;
    mean.clamp(0.0, 1.0)
}

/// Hanning window coefficient: `0.5 * (1 - cos(2π n / (L - 1)))`.
fn hanning(i: usize, len: usize) -> f64 {
    if len < 2 {
        return 1.0;
    }
    0.5 * (1.0 - (2.0 * std::f64::consts::PI * i as f64 / (len - 1) as f64).cos())
}

/// Index of the bin whose center `k * fs / n` is closest to the expected
/// frequency. Equidistant bins resolve to the lower index.
fn target_bin(expected_freq: f64, sample_rate: f64, n: usize, bins: usize) -> usize {
    let bin_width = sample_rate / n as f64;

    let mut best = 0;
    let mut best_dist = f64::INFINITY;
    for k in 0..bins {
        let dist = (k as f64 * bin_width - expected_freq).abs();
        if dist < best_dist {
            best_dist = dist;
            best = k;
        }
    }
    best
}
