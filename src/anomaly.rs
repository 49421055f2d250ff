//! EWMA-based anomaly detector (§4.5).
//!
//! Five weighted components feed a single 0..100 risk score: call frequency
//! (0.25), time-of-day (0.15), argument novelty (0.30), tool-bigram sequence
//! (0.15), and baseline error rate (0.15). Each baseline statistic is
//! maintained with an exponentially-weighted moving mean/variance (West's
//! online update, the EWMA analogue of Welford's algorithm) so a single pass
//! keeps both numerically stable without storing history. Scoring is gated:
//! with fewer than `WARMUP_SAMPLE_COUNT` observations for a `(tool, host)`
//! pair, the baseline hasn't converged and scoring is skipped rather than
//! risk-flagging cold data.
//!
//! This component only *annotates* a verdict's risk score and risk factors.
//! It never by itself turns an allow into an ask or deny — operators who
//! want enforcement define a rule whose `argument_pattern` or schedule
//! consults the recorded risk factors instead.

use crate::redact::canonical_json;
use crate::store::anomaly::{AnomalyBaseline, WARMUP_SAMPLE_COUNT};
use crate::store::Store;
use crate::types::{RiskFactor, Value};
use chrono::{TimeZone, Utc};
use sha2::{Digest, Sha256};
use std::sync::Arc;

pub const EWMA_ALPHA: f64 = 0.1;

pub const WEIGHT_FREQUENCY: f64 = 0.25;
pub const WEIGHT_TEMPORAL: f64 = 0.15;
pub const WEIGHT_ARGUMENT_NOVELTY: f64 = 0.30;
pub const WEIGHT_SEQUENCE: f64 = 0.15;
pub const WEIGHT_ERROR_RATE: f64 = 0.15;

/// West's online EWMA mean/variance update. Returns `(new_mean, new_var)`.
pub fn ewma_update(mean: f64, variance: f64, observation: f64, alpha: f64) -> (f64, f64) {
    let diff = observation - mean;
    let incr = alpha * diff;
    let new_mean = mean + incr;
    let new_variance = (1.0 - alpha) * (variance + diff * incr);
    (new_mean, new_variance)
}

fn z_score(observation: f64, mean: f64, variance: f64) -> f64 {
    let stddev = variance.sqrt();
    if stddev < 1e-9 {
        0.0
    } else {
        (observation - mean) / stddev
    }
}

/// `min(100, 100 * |z| / 3)`, the common scaling for the frequency and
/// error-rate components: a 3-sigma deviation saturates the score.
fn z_to_score(z: f64) -> f64 {
    (100.0 * z.abs() / 3.0).min(100.0)
}

/// Temporal component thresholds (§4.5): rarer hours score higher, in
/// coarse steps rather than a continuous curve.
fn temporal_probability_to_score(p: f64) -> f64 {
    if p < 0.01 {
        100.0
    } else if p < 0.05 {
        75.0
    } else if p < 0.10 {
        50.0
    } else {
        0.0
    }
}

/// Sequence (bigram) component thresholds (§4.5): an unseen bigram (p=0)
/// scores higher than the temporal component's floor does, since a wholly
/// novel tool transition is rarer evidence than an uncommon hour.
fn sequence_probability_to_score(p: f64) -> f64 {
    if p <= 0.0 {
        100.0
    } else if p < 0.01 {
        75.0
    } else if p < 0.05 {
        50.0
    } else {
        0.0
    }
}

pub fn argument_fingerprint(arguments: &Value) -> String {
    let canonical = canonical_json(arguments);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

fn bigram_key(previous_tool: &str, tool: &str) -> String {
    format!("{previous_tool}->{tool}")
}

fn hour_of(now_ms: i64) -> usize {
    Utc.timestamp_millis_opt(now_ms)
        .single()
        .unwrap_or_else(Utc::now)
        .format("%H")
        .to_string()
        .parse::<usize>()
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
pub struct AnomalyScore {
    pub warm: bool,
    /// 0..100. Weighted sum of the component scores below.
    pub total: f64,
    pub factors: Vec<RiskFactor>,
}

pub struct AnomalyDetector {
    store: Arc<Store>,
}

impl AnomalyDetector {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Scores the upcoming call against the current baseline without
    /// mutating it. Call `record_observation` after the decision is made to
    /// fold the call into the baseline for next time.
    pub async fn score(
        &self,
        tool: &str,
        host: &str,
        previous_tool: Option<&str>,
        arguments: &Value,
        now_ms: i64,
    ) -> Result<AnomalyScore, crate::error::StoreError> {
        let baseline = self
            .store
            .get_anomaly_baseline(tool, host)
            .await?
            .unwrap_or_else(|| AnomalyBaseline::fresh(tool, host, now_ms));

        if !baseline.is_warm() {
            return Ok(AnomalyScore {
                warm: false,
                total: 0.0,
                factors: vec![RiskFactor {
                    factor: "warmup".to_string(),
                    score: 0.0,
                    details: format!(
                        "baseline has {} of {WARMUP_SAMPLE_COUNT} required samples",
                        baseline.sample_count
                    ),
                }],
            });
        }

        let elapsed_seconds = ((now_ms - baseline.last_updated).max(0) as f64) / 1_000.0;
        let observed_rate = if elapsed_seconds > 0.0 {
            1.0 / elapsed_seconds
        } else {
            baseline.frequency_mean.max(1.0)
        };
        let frequency_z = z_score(observed_rate, baseline.frequency_mean, baseline.frequency_stddev.powi(2));
        let frequency_score = z_to_score(frequency_z);

        let hour = hour_of(now_ms);
        let hour_probability = baseline.hourly_distribution[hour];
        let temporal_score = temporal_probability_to_score(hour_probability);

        let fingerprint = argument_fingerprint(arguments);
        let seen_before = baseline.argument_fingerprints.iter().any(|f| f == &fingerprint);
        let argument_score = if seen_before { 0.0 } else { 100.0 };

        let (sequence_score, bigram_probability) = match previous_tool {
            Some(prev) => {
                let key = bigram_key(prev, tool);
                let p = baseline.tool_bigrams.get(&key).copied().unwrap_or(0.0);
                (sequence_probability_to_score(p), p)
            }
            None => (0.0, 1.0),
        };

        // error_rate_mean is itself an EWMA of 0/1 error observations, so it
        // already reads as a rate in [0, 1]; a mean at or above 30% is
        // treated as fully anomalous.
        let error_rate_score = (100.0 * baseline.error_rate_mean / 0.3).clamp(0.0, 100.0);

        let factors = vec![
            RiskFactor {
                factor: "frequency".to_string(),
                score: frequency_score,
                details: format!(
                    "observed rate {observed_rate:.4}/s vs baseline mean {:.4}/s (z={frequency_z:.2})",
                    baseline.frequency_mean
                ),
            },
            RiskFactor {
                factor: "temporal".to_string(),
                score: temporal_score,
                details: format!("hour {hour} has historical probability {hour_probability:.4}"),
            },
            RiskFactor {
                factor: "argument_novelty".to_string(),
                score: argument_score,
                details: if seen_before {
                    "argument shape seen before".to_string()
                } else {
                    "argument shape not in recent history".to_string()
                },
            },
            RiskFactor {
                factor: "sequence".to_string(),
                score: sequence_score,
                details: match previous_tool {
                    Some(prev) => format!("bigram {prev}->{tool} probability {bigram_probability:.4}"),
                    None => "no preceding call in this session".to_string(),
                },
            },
            RiskFactor {
                factor: "error_rate".to_string(),
                score: error_rate_score,
                details: format!("baseline error rate {:.4}", baseline.error_rate_mean),
            },
        ];

        let total = WEIGHT_FREQUENCY * frequency_score
            + WEIGHT_TEMPORAL * temporal_score
            + WEIGHT_ARGUMENT_NOVELTY * argument_score
            + WEIGHT_SEQUENCE * sequence_score
            + WEIGHT_ERROR_RATE * error_rate_score;

        Ok(AnomalyScore {
            warm: true,
            total: total.clamp(0.0, 100.0),
            factors,
        })
    }

    /// Folds one observed call into the `(tool, host)` baseline.
    pub async fn record_observation(
        &self,
        tool: &str,
        host: &str,
        previous_tool: Option<&str>,
        arguments: &Value,
        now_ms: i64,
        is_error: bool,
    ) -> Result<(), crate::error::StoreError> {
        let mut baseline = self
            .store
            .get_anomaly_baseline(tool, host)
            .await?
            .unwrap_or_else(|| AnomalyBaseline::fresh(tool, host, now_ms));

        if baseline.sample_count > 0 {
            let elapsed_seconds = ((now_ms - baseline.last_updated).max(0) as f64) / 1_000.0;
            let observed_rate = if elapsed_seconds > 0.0 { 1.0 / elapsed_seconds } else { baseline.frequency_mean };
            let variance = baseline.frequency_stddev.powi(2);
            let (mean, var) = ewma_update(baseline.frequency_mean, variance, observed_rate, EWMA_ALPHA);
            baseline.frequency_mean = mean;
            baseline.frequency_stddev = var.max(0.0).sqrt();
        }

        let hour = hour_of(now_ms);
        baseline.observe_hour(hour, baseline.sample_count);

        baseline.push_fingerprint(argument_fingerprint(arguments));

        if let Some(prev) = previous_tool {
            let key = bigram_key(prev, tool);
            let prior = baseline.tool_bigrams.get(&key).copied().unwrap_or(0.0);
            let updated = EWMA_ALPHA * 1.0 + (1.0 - EWMA_ALPHA) * prior;
            baseline.tool_bigrams.insert(key, updated);
        }

        let error_observation = if is_error { 1.0 } else { 0.0 };
        let error_variance = baseline.error_rate_stddev.powi(2);
        let (err_mean, err_var) =
            ewma_update(baseline.error_rate_mean, error_variance, error_observation, EWMA_ALPHA);
        baseline.error_rate_mean = err_mean;
        baseline.error_rate_stddev = err_var.max(0.0).sqrt();

        baseline.last_updated = now_ms;
        baseline.sample_count += 1;

        self.store.put_anomaly_baseline(&baseline).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ewma_update_moves_mean_toward_observation() {
        let (mean, _var) = ewma_update(10.0, 1.0, 20.0, 0.1);
        assert!(mean > 10.0 && mean < 20.0);
        assert!((mean - 11.0).abs() < 1e-9);
    }

    #[test]
    fn temporal_probability_matches_threshold_table() {
        assert_eq!(temporal_probability_to_score(0.0), 100.0);
        assert_eq!(temporal_probability_to_score(0.02), 75.0);
        assert_eq!(temporal_probability_to_score(0.07), 50.0);
        assert_eq!(temporal_probability_to_score(0.2), 0.0);
    }

    #[test]
    fn sequence_probability_matches_threshold_table() {
        assert_eq!(sequence_probability_to_score(0.0), 100.0);
        assert_eq!(sequence_probability_to_score(0.005), 75.0);
        assert_eq!(sequence_probability_to_score(0.02), 50.0);
        assert_eq!(sequence_probability_to_score(0.2), 0.0);
    }

    #[tokio::test]
    async fn cold_baseline_skips_scoring() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let detector = AnomalyDetector::new(store);
        let score = detector
            .score("tool", "host", None, &Value::empty_map(), 0)
            .await
            .unwrap();
        assert!(!score.warm);
        assert_eq!(score.total, 0.0);
    }

    #[tokio::test]
    async fn warm_baseline_flags_novel_arguments() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let detector = AnomalyDetector::new(store);

        for i in 0..12 {
            detector
                .record_observation(
                    "tool",
                    "host",
                    Some("prev"),
                    &Value::String(format!("arg-{i}")),
                    i as i64 * 1_000,
                    false,
                )
                .await
                .unwrap();
        }

        let score = detector
            .score(
                "tool",
                "host",
                Some("prev"),
                &Value::String("never-seen-before".to_string()),
                12_000,
            )
            .await
            .unwrap();
        assert!(score.warm);
        let arg_factor = score
            .factors
            .iter()
            .find(|f| f.factor == "argument_novelty")
            .unwrap();
        assert_eq!(arg_factor.score, 100.0);
        assert!(score.total > 0.0 && score.total <= 100.0);
    }

    #[tokio::test]
    async fn repeated_argument_shape_is_not_novel() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let detector = AnomalyDetector::new(store);

        for i in 0..15 {
            detector
                .record_observation(
                    "tool",
                    "host",
                    None,
                    &Value::String("same-shape".to_string()),
                    i as i64 * 1_000,
                    false,
                )
                .await
                .unwrap();
        }

        let score = detector
            .score("tool", "host", None, &Value::String("same-shape".to_string()), 15_000)
            .await
            .unwrap();
        let arg_factor = score
            .factors
            .iter()
            .find(|f| f.factor == "argument_novelty")
            .unwrap();
        assert_eq!(arg_factor.score, 0.0);
    }
}
