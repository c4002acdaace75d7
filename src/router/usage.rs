//! Cost and latency accounting for routed LLM calls.
//!
//! Every attempt — including failed fallbacks — is recorded in an
//! in-memory log, appendable to a JSONL export. The running summary
//! exposes total cost, savings against a pure-API baseline, and per-tier
//! counts. A daily budget cap aborts api_fallback calls once exceeded,
//! with alerts at configurable percentages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use tracing::warn;

use crate::error::{Error, Result};
use crate::router::provider::RouteTier;

/// One recorded call attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub timestamp: DateTime<Utc>,
    pub tier: RouteTier,
    pub model: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
    pub latency_ms: u64,
    pub quality: Option<f64>,
    /// Tier this call fell back from, when it was a retry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_from: Option<RouteTier>,
    pub success: bool,
}

/// Per-tier aggregate counts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TierStats {
    pub calls: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
}

/// Running summary across all recorded calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSummary {
    pub total_calls: u64,
    pub total_cost: f64,
    /// Estimated cost had every call gone to the API tier.
    pub pure_api_baseline: f64,
    pub savings: f64,
    pub by_tier: HashMap<String, TierStats>,
}

/// Thread-safe usage accumulator with a daily spend ceiling.
pub struct UsageLog {
    records: Mutex<Vec<UsageRecord>>,
    daily_budget_usd: f64,
    /// Reference per-1k-token API price used for the savings baseline.
    baseline_cost_per_1k: f64,
    alert_thresholds: Vec<f64>,
    alerts_fired: Mutex<Vec<f64>>,
}

impl UsageLog {
    pub fn new(daily_budget_usd: f64) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            daily_budget_usd,
            baseline_cost_per_1k: 0.009,
            alert_thresholds: vec![0.5, 0.8, 1.0],
            alerts_fired: Mutex::new(Vec::new()),
        }
    }

    pub fn with_baseline_cost_per_1k(mut self, cost: f64) -> Self {
        self.baseline_cost_per_1k = cost;
        self
    }

    pub fn with_alert_thresholds(mut self, thresholds: Vec<f64>) -> Self {
        self.alert_thresholds = thresholds;
        self
    }

    /// Record one attempt and fire any newly crossed budget alerts.
    pub fn record(&self, record: UsageRecord) {
        let spent_today = {
            let mut records = self.records.lock().expect("usage log lock");
            records.push(record);
            Self::spent_since(&records, Utc::now().date_naive())
        };

        if self.daily_budget_usd > 0.0 {
            let fraction = spent_today / self.daily_budget_usd;
            let mut fired = self.alerts_fired.lock().expect("alert lock");
            for threshold in &self.alert_thresholds {
                if fraction >= *threshold && !fired.contains(threshold) {
                    warn!(
                        spent = spent_today,
                        budget = self.daily_budget_usd,
                        threshold = threshold * 100.0,
                        "daily LLM budget alert"
                    );
                    fired.push(*threshold);
                }
            }
        }
    }

    fn spent_since(records: &[UsageRecord], day: chrono::NaiveDate) -> f64 {
        records
            .iter()
            .filter(|r| r.timestamp.date_naive() == day)
            .map(|r| r.cost)
            .sum()
    }

    /// Whether an api_fallback call may still be made today.
    pub fn api_budget_available(&self) -> bool {
        if self.daily_budget_usd <= 0.0 {
            return true;
        }
        let records = self.records.lock().expect("usage log lock");
        Self::spent_since(&records, Utc::now().date_naive()) < self.daily_budget_usd
    }

    /// Aggregate summary.
    pub fn summary(&self) -> UsageSummary {
        let records = self.records.lock().expect("usage log lock");

        let mut by_tier: HashMap<String, TierStats> = HashMap::new();
        let mut total_cost = 0.0;
        let mut baseline = 0.0;

        for record in records.iter() {
            let stats = by_tier.entry(record.tier.to_string()).or_default();
            stats.calls += 1;
            stats.tokens_in += record.tokens_in;
            stats.tokens_out += record.tokens_out;
            stats.cost += record.cost;

            total_cost += record.cost;
            baseline +=
                (record.tokens_in + record.tokens_out) as f64 / 1000.0 * self.baseline_cost_per_1k;
        }

        UsageSummary {
            total_calls: records.len() as u64,
            total_cost,
            pure_api_baseline: baseline,
            savings: baseline - total_cost,
            by_tier,
        }
    }

    /// Count of recorded attempts for one tier.
    pub fn tier_calls(&self, tier: RouteTier) -> u64 {
        let records = self.records.lock().expect("usage log lock");
        records.iter().filter(|r| r.tier == tier).count() as u64
    }

    /// Snapshot of all records, oldest first.
    pub fn records(&self) -> Vec<UsageRecord> {
        self.records.lock().expect("usage log lock").clone()
    }

    /// Append all records to a JSONL file.
    pub fn export_jsonl(&self, path: &Path) -> Result<u64> {
        let records = self.records.lock().expect("usage log lock");
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| Error::Config(format!("usage export '{}': {}", path.display(), e)))?;
        for record in records.iter() {
            let line = serde_json::to_string(record)?;
            writeln!(file, "{}", line)
                .map_err(|e| Error::Config(format!("usage export write: {}", e)))?;
        }
        Ok(records.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(tier: RouteTier, cost: f64) -> UsageRecord {
        UsageRecord {
            timestamp: Utc::now(),
            tier,
            model: "m".to_string(),
            tokens_in: 1000,
            tokens_out: 1000,
            cost,
            latency_ms: 50,
            quality: Some(0.9),
            fallback_from: None,
            success: true,
        }
    }

    #[test]
    fn test_summary_counts_and_savings() {
        let log = UsageLog::new(10.0).with_baseline_cost_per_1k(0.01);
        log.record(record(RouteTier::LocalFast, 0.0));
        log.record(record(RouteTier::LocalQuality, 0.0));
        log.record(record(RouteTier::ApiFallback, 0.02));

        let summary = log.summary();
        assert_eq!(summary.total_calls, 3);
        assert!((summary.total_cost - 0.02).abs() < 1e-9);
        // Baseline: 3 calls x 2000 tokens x $0.01/1k = $0.06
        assert!((summary.pure_api_baseline - 0.06).abs() < 1e-9);
        assert!((summary.savings - 0.04).abs() < 1e-9);
        assert_eq!(summary.by_tier.get("local_fast").unwrap().calls, 1);
    }

    #[test]
    fn test_daily_budget_gate() {
        let log = UsageLog::new(0.05);
        assert!(log.api_budget_available());

        log.record(record(RouteTier::ApiFallback, 0.06));
        assert!(!log.api_budget_available());
    }

    #[test]
    fn test_zero_budget_means_uncapped() {
        let log = UsageLog::new(0.0);
        log.record(record(RouteTier::ApiFallback, 100.0));
        assert!(log.api_budget_available());
    }

    #[test]
    fn test_export_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.jsonl");

        let log = UsageLog::new(10.0);
        log.record(record(RouteTier::LocalFast, 0.0));
        log.record(record(RouteTier::ApiFallback, 0.01));

        let exported = log.export_jsonl(&path).unwrap();
        assert_eq!(exported, 2);

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        let first: UsageRecord = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(first.tier, RouteTier::LocalFast);
    }
}
