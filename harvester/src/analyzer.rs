//! Behavioral pattern classification for metric value sequences.
//!
//! [`analyze_pattern`] is a pure function: no I/O, no clock, identical input
//! always yields identical output. It classifies an ordered value sequence
//! into one of six categories using volatility, adjacent-jump spikes, an
//! ordinary-least-squares trend, and alternating-extrema cycle detection.

use serde::Serialize;
use std::fmt;

/// Sequences shorter than this cannot be classified.
const MIN_SAMPLES: usize = 3;
/// Adjacent change beyond this fraction of the previous value is a large jump.
const SPIKE_RATIO: f64 = 0.15;
/// Spikes per sample beyond this fraction classify the series as spiky.
const SPIKY_FRACTION: f64 = 0.2;
/// Minimum |slope * n / mean| for a trend classification.
const TREND_SLOPE_MIN: f64 = 0.05;
/// Maximum volatility (stddev / mean) for a flat classification.
const FLAT_VOLATILITY_MAX: f64 = 0.10;
/// Minimum alternation count for a sawtooth classification.
const SAWTOOTH_MIN_CYCLES: u32 = 3;
/// Minimum qualifying extrema before cycles are counted at all.
const MIN_EXTREMA: usize = 4;
/// Extrema must deviate from both neighbors by this fraction of the mean.
const EXTREMA_MEAN_FRACTION: f64 = 0.05;
/// Below this coefficient of variation the extrema threshold also considers
/// half a standard deviation.
const LOW_CV: f64 = 0.1;
/// Inter-extrema distances with a higher coefficient of variation are too
/// irregular to count as a cycle.
const PERIOD_CV_MAX: f64 = 0.4;

const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatternType {
    Flat,
    Spiky,
    TrendingUp,
    TrendingDown,
    Sawtooth,
    Unknown,
}

impl PatternType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternType::Flat => "FLAT",
            PatternType::Spiky => "SPIKY",
            PatternType::TrendingUp => "TRENDING_UP",
            PatternType::TrendingDown => "TRENDING_DOWN",
            PatternType::Sawtooth => "SAWTOOTH",
            PatternType::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for PatternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of one value sequence, with the evidence that drove it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatternResult {
    pub pattern: PatternType,
    /// Standard deviation over mean; infinite when the mean is zero but the
    /// values are not.
    pub volatility: f64,
    /// Relative slope: OLS slope scaled by `n / mean`.
    pub trend_slope: f64,
    pub spike_count: usize,
    pub sawtooth_cycles: u32,
    /// Human-readable summary of the decisive evidence.
    pub details: String,
}

/// Classify an ordered sequence of values into a behavioral pattern.
pub fn analyze_pattern(values: &[f64]) -> PatternResult {
    let n = values.len();
    if n < MIN_SAMPLES {
        return PatternResult {
            pattern: PatternType::Unknown,
            volatility: 0.0,
            trend_slope: 0.0,
            spike_count: 0,
            sawtooth_cycles: 0,
            details: format!("insufficient data ({n} samples, need at least {MIN_SAMPLES})"),
        };
    }

    let mean = values.iter().sum::<f64>() / n as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
    let stddev = variance.sqrt();
    let volatility = if stddev < EPSILON {
        0.0
    } else if mean.abs() < EPSILON {
        f64::INFINITY
    } else {
        stddev / mean.abs()
    };

    let spike_count = count_spikes(values);
    let trend_slope = relative_slope(values, mean);
    let sawtooth_cycles = sawtooth_cycles(values, mean, stddev);
    let spike_fraction = spike_count as f64 / n as f64;

    let (pattern, details) = if sawtooth_cycles >= SAWTOOTH_MIN_CYCLES {
        (
            PatternType::Sawtooth,
            format!("{sawtooth_cycles} alternating peak/valley cycles with consistent period"),
        )
    } else if spike_fraction > SPIKY_FRACTION {
        (
            PatternType::Spiky,
            format!(
                "{:.0}% of samples jump more than {:.0}% from the previous value",
                spike_fraction * 100.0,
                SPIKE_RATIO * 100.0
            ),
        )
    } else if trend_slope.abs() >= TREND_SLOPE_MIN {
        let pattern = if trend_slope > 0.0 {
            PatternType::TrendingUp
        } else {
            PatternType::TrendingDown
        };
        (
            pattern,
            format!("relative slope {trend_slope:+.3} over {n} samples"),
        )
    } else if volatility <= FLAT_VOLATILITY_MAX {
        (
            PatternType::Flat,
            format!("volatility {volatility:.3} within flat threshold {FLAT_VOLATILITY_MAX}"),
        )
    } else if spike_count > 0 && spike_count as f64 <= n as f64 / 10.0 {
        (
            PatternType::Spiky,
            format!("{spike_count} isolated spikes in {n} samples"),
        )
    } else {
        (
            PatternType::Unknown,
            format!(
                "no dominant pattern (volatility {volatility:.3}, slope {trend_slope:+.3}, spikes {spike_count})"
            ),
        )
    };

    PatternResult {
        pattern,
        volatility,
        trend_slope,
        spike_count,
        sawtooth_cycles,
        details,
    }
}

/// Count adjacent pairs whose change exceeds [`SPIKE_RATIO`] of the previous
/// value and reverses direction. Pairs touching a near-zero value are
/// skipped (the ratio is meaningless there), and monotone runs do not count:
/// a steep ramp is a trend, not a spike train.
fn count_spikes(values: &[f64]) -> usize {
    let mut count = 0usize;
    let mut prev_direction = 0i8;
    for pair in values.windows(2) {
        let (prev, next) = (pair[0], pair[1]);
        if prev.abs() < EPSILON || next.abs() < EPSILON {
            continue;
        }
        let delta = next - prev;
        let direction = if delta > 0.0 {
            1
        } else if delta < 0.0 {
            -1
        } else {
            0
        };
        let reverses = prev_direction == 0 || (direction != 0 && direction != prev_direction);
        if (delta / prev).abs() > SPIKE_RATIO && reverses {
            count += 1;
        }
        if direction != 0 {
            prev_direction = direction;
        }
    }
    count
}

/// Ordinary least squares over index vs. value, scaled to `slope * n / mean`
/// so thresholds are comparable across magnitudes.
fn relative_slope(values: &[f64], mean: f64) -> f64 {
    let n = values.len() as f64;
    let mean_index = (n - 1.0) / 2.0;
    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (index, &value) in values.iter().enumerate() {
        let dx = index as f64 - mean_index;
        numerator += dx * (value - mean);
        denominator += dx * dx;
    }
    let slope = if denominator < EPSILON {
        0.0
    } else {
        numerator / denominator
    };
    if mean.abs() < EPSILON {
        0.0
    } else {
        slope * n / mean
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExtremumKind {
    Peak,
    Valley,
}

/// Count alternations between qualifying local extrema. Returns 0 unless at
/// least [`MIN_EXTREMA`] extrema alternate peak/valley with a consistent
/// period (inter-extrema distance CV at most [`PERIOD_CV_MAX`]); an
/// inconsistent period is spikiness, not a cycle.
fn sawtooth_cycles(values: &[f64], mean: f64, stddev: f64) -> u32 {
    let n = values.len();
    if n < MIN_EXTREMA + 2 {
        return 0;
    }

    let mut threshold = EXTREMA_MEAN_FRACTION * mean.abs();
    let cv = if mean.abs() < EPSILON {
        f64::INFINITY
    } else {
        stddev / mean.abs()
    };
    if cv < LOW_CV {
        threshold = threshold.max(0.5 * stddev);
    }
    if threshold < EPSILON {
        return 0;
    }

    let mut extrema: Vec<(usize, ExtremumKind, f64)> = Vec::new();
    for i in 1..n - 1 {
        let (left, value, right) = (values[i - 1], values[i], values[i + 1]);
        let kind = if value > left && value > right {
            ExtremumKind::Peak
        } else if value < left && value < right {
            ExtremumKind::Valley
        } else {
            continue;
        };
        if (value - left).abs() <= threshold || (value - right).abs() <= threshold {
            continue;
        }
        match extrema.last() {
            Some(&(_, last_kind, last_value)) if last_kind == kind => {
                // two peaks (or valleys) in a row: keep the more extreme one
                let more_extreme = match kind {
                    ExtremumKind::Peak => value > last_value,
                    ExtremumKind::Valley => value < last_value,
                };
                if more_extreme {
                    extrema.pop();
                    extrema.push((i, kind, value));
                }
            }
            _ => extrema.push((i, kind, value)),
        }
    }

    if extrema.len() < MIN_EXTREMA {
        return 0;
    }

    let distances: Vec<f64> = extrema
        .windows(2)
        .map(|pair| (pair[1].0 - pair[0].0) as f64)
        .collect();
    let distance_mean = distances.iter().sum::<f64>() / distances.len() as f64;
    let distance_variance = distances
        .iter()
        .map(|d| (d - distance_mean).powi(2))
        .sum::<f64>()
        / distances.len() as f64;
    let distance_cv = if distance_mean < EPSILON {
        f64::INFINITY
    } else {
        distance_variance.sqrt() / distance_mean
    };
    if distance_cv > PERIOD_CV_MAX {
        return 0;
    }

    (extrema.len() - 1) as u32
}
