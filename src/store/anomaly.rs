//! Anomaly baseline persistence (§4.5), one row per `(tool, host)`.
//!
//! The row stores everything the EWMA scorer needs to resume across
//! restarts: running mean/stddev for call frequency and error rate, the
//! hourly call-time probability distribution, a FIFO of recent argument
//! fingerprints (bounded at 1000), and EWMA-smoothed tool bigram
//! frequencies.

use super::Store;
use crate::error::StoreError;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const MAX_ARGUMENT_FINGERPRINTS: usize = 1000;
pub const WARMUP_SAMPLE_COUNT: u64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyBaseline {
    pub tool: String,
    pub host: String,
    pub frequency_mean: f64,
    pub frequency_stddev: f64,
    /// Probability of a call landing in each of the 24 hour-of-day
    /// buckets; sums to at most 1.0.
    pub hourly_distribution: [f64; 24],
    /// Most recent argument-shape fingerprints, oldest first, capped at
    /// `MAX_ARGUMENT_FINGERPRINTS`.
    pub argument_fingerprints: Vec<String>,
    /// EWMA-smoothed frequency per observed `(previous_tool, tool)` bigram.
    pub tool_bigrams: HashMap<String, f64>,
    pub error_rate_mean: f64,
    pub error_rate_stddev: f64,
    pub last_updated: i64,
    pub sample_count: u64,
}

impl AnomalyBaseline {
    pub fn fresh(tool: &str, host: &str, now_ms: i64) -> Self {
        AnomalyBaseline {
            tool: tool.to_string(),
            host: host.to_string(),
            frequency_mean: 0.0,
            frequency_stddev: 0.0,
            hourly_distribution: [0.0; 24],
            argument_fingerprints: Vec::new(),
            tool_bigrams: HashMap::new(),
            error_rate_mean: 0.0,
            error_rate_stddev: 0.0,
            last_updated: now_ms,
            sample_count: 0,
        }
    }

    /// Pushes a fingerprint, evicting the oldest once the FIFO is full.
    pub fn push_fingerprint(&mut self, fingerprint: String) {
        if self.argument_fingerprints.len() >= MAX_ARGUMENT_FINGERPRINTS {
            self.argument_fingerprints.remove(0);
        }
        self.argument_fingerprints.push(fingerprint);
    }

    pub fn is_warm(&self) -> bool {
        self.sample_count >= WARMUP_SAMPLE_COUNT
    }

    /// Folds observed hour `h` into the running probability distribution:
    /// `(old * n + onehot(h)) / (n + 1)`.
    pub fn observe_hour(&mut self, hour: usize, prior_sample_count: u64) {
        let n = prior_sample_count as f64;
        for (i, p) in self.hourly_distribution.iter_mut().enumerate() {
            let onehot = if i == hour { 1.0 } else { 0.0 };
            *p = (*p * n + onehot) / (n + 1.0);
        }
    }
}

impl Store {
    pub async fn get_anomaly_baseline(
        &self,
        tool: &str,
        host: &str,
    ) -> Result<Option<AnomalyBaseline>, StoreError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT frequency_mean, frequency_stddev, hourly_distribution_json,
                    argument_fingerprints_json, tool_bigrams_json, error_rate_mean,
                    error_rate_stddev, last_updated, sample_count
                 FROM anomaly_baselines WHERE tool = ?1 AND host = ?2",
                params![tool, host],
                |row| {
                    Ok((
                        row.get::<_, f64>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, f64>(5)?,
                        row.get::<_, f64>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, i64>(8)?,
                    ))
                },
            )
            .optional()?;

        let Some((
            frequency_mean,
            frequency_stddev,
            hourly_json,
            fingerprints_json,
            bigrams_json,
            error_rate_mean,
            error_rate_stddev,
            last_updated,
            sample_count,
        )) = row
        else {
            return Ok(None);
        };

        let hourly_vec: Vec<f64> = serde_json::from_str(&hourly_json)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let mut hourly_distribution = [0.0f64; 24];
        for (i, v) in hourly_vec.into_iter().take(24).enumerate() {
            hourly_distribution[i] = v;
        }

        Ok(Some(AnomalyBaseline {
            tool: tool.to_string(),
            host: host.to_string(),
            frequency_mean,
            frequency_stddev,
            hourly_distribution,
            argument_fingerprints: serde_json::from_str(&fingerprints_json)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            tool_bigrams: serde_json::from_str(&bigrams_json)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            error_rate_mean,
            error_rate_stddev,
            last_updated,
            sample_count: sample_count as u64,
        }))
    }

    pub async fn put_anomaly_baseline(&self, baseline: &AnomalyBaseline) -> Result<(), StoreError> {
        let hourly_json = serde_json::to_string(&baseline.hourly_distribution[..])
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let fingerprints_json = serde_json::to_string(&baseline.argument_fingerprints)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let bigrams_json = serde_json::to_string(&baseline.tool_bigrams)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO anomaly_baselines (tool, host, frequency_mean, frequency_stddev,
                hourly_distribution_json, argument_fingerprints_json, tool_bigrams_json,
                error_rate_mean, error_rate_stddev, last_updated, sample_count)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)
             ON CONFLICT(tool, host) DO UPDATE SET
                frequency_mean=excluded.frequency_mean, frequency_stddev=excluded.frequency_stddev,
                hourly_distribution_json=excluded.hourly_distribution_json,
                argument_fingerprints_json=excluded.argument_fingerprints_json,
                tool_bigrams_json=excluded.tool_bigrams_json,
                error_rate_mean=excluded.error_rate_mean, error_rate_stddev=excluded.error_rate_stddev,
                last_updated=excluded.last_updated, sample_count=excluded.sample_count",
            params![
                baseline.tool,
                baseline.host,
                baseline.frequency_mean,
                baseline.frequency_stddev,
                hourly_json,
                fingerprints_json,
                bigrams_json,
                baseline.error_rate_mean,
                baseline.error_rate_stddev,
                baseline.last_updated,
                baseline.sample_count as i64,
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_pair_returns_none() {
        let store = Store::open_in_memory().unwrap();
        assert!(store
            .get_anomaly_baseline("tool", "host")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn put_then_get_round_trips_all_fields() {
        let store = Store::open_in_memory().unwrap();
        let mut baseline = AnomalyBaseline::fresh("tool", "host", 1_000);
        baseline.frequency_mean = 4.2;
        baseline.sample_count = 12;
        baseline.observe_hour(3, 0);
        baseline.push_fingerprint("abc123".to_string());
        baseline.tool_bigrams.insert("read->write".to_string(), 0.5);

        store.put_anomaly_baseline(&baseline).await.unwrap();
        let fetched = store
            .get_anomaly_baseline("tool", "host")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(fetched.frequency_mean, 4.2);
        assert_eq!(fetched.sample_count, 12);
        assert_eq!(fetched.hourly_distribution[3], 1.0);
        assert_eq!(fetched.argument_fingerprints, vec!["abc123".to_string()]);
        assert_eq!(fetched.tool_bigrams.get("read->write"), Some(&0.5));
        assert!(fetched.is_warm());
    }

    #[test]
    fn fingerprint_fifo_evicts_oldest_past_capacity() {
        let mut baseline = AnomalyBaseline::fresh("t", "h", 0);
        for i in 0..MAX_ARGUMENT_FINGERPRINTS + 10 {
            baseline.push_fingerprint(format!("fp-{i}"));
        }
        assert_eq!(baseline.argument_fingerprints.len(), MAX_ARGUMENT_FINGERPRINTS);
        assert_eq!(baseline.argument_fingerprints[0], "fp-10");
    }

    #[test]
    fn warmup_gates_on_sample_count() {
        let mut baseline = AnomalyBaseline::fresh("t", "h", 0);
        baseline.sample_count = 9;
        assert!(!baseline.is_warm());
        baseline.sample_count = 10;
        assert!(baseline.is_warm());
    }

    #[test]
    fn observe_hour_converges_to_a_probability_distribution() {
        let mut baseline = AnomalyBaseline::fresh("t", "h", 0);
        let mut n = 0u64;
        for _ in 0..9 {
            baseline.observe_hour(5, n);
            n += 1;
        }
        assert!((baseline.hourly_distribution[5] - 1.0).abs() < 1e-9);
        baseline.observe_hour(6, n);
        assert!(baseline.hourly_distribution[5] > 0.0 && baseline.hourly_distribution[5] < 1.0);
    }
}
