use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use super::percentile;

#[derive(Debug, Clone, Deserialize)]
pub struct LatencyConfig {
    /// Executions slower than this log a warning, in milliseconds.
    #[serde(default = "default_warn_threshold_ms")]
    pub warn_threshold_ms: u64,
    /// Executions slower than this log an error, in milliseconds.
    #[serde(default = "default_critical_threshold_ms")]
    pub critical_threshold_ms: u64,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_warn_threshold_ms() -> u64 {
    1000
}

fn default_critical_threshold_ms() -> u64 {
    5000
}

fn default_history_limit() -> usize {
    10_000
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            warn_threshold_ms: default_warn_threshold_ms(),
            critical_threshold_ms: default_critical_threshold_ms(),
            history_limit: default_history_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencyRecord {
    pub timestamp: DateTime<Utc>,
    pub order_id: String,
    pub symbol: String,
    pub broker: String,
    pub operation: String,
    pub latency_ms: u64,
    pub success: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BrokerLatency {
    pub count: u64,
    pub avg_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencyStats {
    pub count: u64,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: u64,
    pub over_warn: u64,
    pub over_critical: u64,
    pub by_broker: HashMap<String, BrokerLatency>,
}

#[derive(Default)]
struct LatencyBook {
    records: VecDeque<LatencyRecord>,
    by_broker: HashMap<String, BrokerAccumulator>,
    total_count: u64,
    total_sum_ms: u64,
    max_ms: u64,
    over_warn: u64,
    over_critical: u64,
}

#[derive(Default)]
struct BrokerAccumulator {
    count: u64,
    sum_ms: u64,
    min_ms: u64,
    max_ms: u64,
    failures: u64,
}

/// Execution latency tracker with per-broker aggregates and threshold
/// alerting.
pub struct LatencyTracker {
    config: LatencyConfig,
    book: RwLock<LatencyBook>,
}

impl LatencyTracker {
    pub fn new(config: LatencyConfig) -> Self {
        Self {
            config,
            book: RwLock::new(LatencyBook::default()),
        }
    }

    pub async fn record(
        &self,
        order_id: &str,
        symbol: &str,
        broker: &str,
        operation: &str,
        latency_ms: u64,
        success: bool,
    ) {
        if latency_ms >= self.config.critical_threshold_ms {
            error!(order_id, broker, latency_ms, "critical execution latency");
        } else if latency_ms >= self.config.warn_threshold_ms {
            warn!(order_id, broker, latency_ms, "slow execution");
        } else {
            debug!(order_id, broker, latency_ms, operation, "latency recorded");
        }

        let record = LatencyRecord {
            timestamp: Utc::now(),
            order_id: order_id.to_string(),
            symbol: symbol.to_string(),
            broker: broker.to_string(),
            operation: operation.to_string(),
            latency_ms,
            success,
        };

        let mut book = self.book.write().await;
        book.records.push_back(record);
        while book.records.len() > self.config.history_limit {
            book.records.pop_front();
        }
        book.total_count += 1;
        book.total_sum_ms += latency_ms;
        if latency_ms > book.max_ms {
            book.max_ms = latency_ms;
        }
        if latency_ms >= self.config.critical_threshold_ms {
            book.over_critical += 1;
        }
        if latency_ms >= self.config.warn_threshold_ms {
            book.over_warn += 1;
        }

        let acc = book.by_broker.entry(broker.to_string()).or_default();
        if acc.count == 0 || latency_ms < acc.min_ms {
            acc.min_ms = latency_ms;
        }
        if latency_ms > acc.max_ms {
            acc.max_ms = latency_ms;
        }
        acc.count += 1;
        acc.sum_ms += latency_ms;
        if !success {
            acc.failures += 1;
        }
    }

    pub async fn stats(&self) -> LatencyStats {
        let book = self.book.read().await;
        let mut samples: Vec<f64> = book.records.iter().map(|r| r.latency_ms as f64).collect();
        samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let by_broker = book
            .by_broker
            .iter()
            .map(|(broker, acc)| {
                (
                    broker.clone(),
                    BrokerLatency {
                        count: acc.count,
                        avg_ms: if acc.count > 0 {
                            acc.sum_ms as f64 / acc.count as f64
                        } else {
                            0.0
                        },
                        min_ms: acc.min_ms,
                        max_ms: acc.max_ms,
                        failures: acc.failures,
                    },
                )
            })
            .collect();
        LatencyStats {
            count: book.total_count,
            avg_ms: if book.total_count > 0 {
                book.total_sum_ms as f64 / book.total_count as f64
            } else {
                0.0
            },
            p50_ms: percentile(&samples, 50.0),
            p95_ms: percentile(&samples, 95.0),
            p99_ms: percentile(&samples, 99.0),
            max_ms: book.max_ms,
            over_warn: book.over_warn,
            over_critical: book.over_critical,
            by_broker,
        }
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new(LatencyConfig::default())
    }
}
