use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::domain::{OrderKind, OrderSide};

#[derive(Debug, Clone, Deserialize)]
pub struct DedupConfig {
    /// How long a fingerprint blocks identical resubmission, in seconds.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Minimum spacing between any two orders on one symbol, in seconds.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Fingerprints kept before pruning kicks in.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

fn default_window_secs() -> u64 {
    300
}

fn default_cooldown_secs() -> u64 {
    10
}

fn default_max_entries() -> usize {
    10_000
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            cooldown_secs: default_cooldown_secs(),
            max_entries: default_max_entries(),
        }
    }
}

/// Why an order was flagged as a duplicate
#[derive(Debug, Clone, Serialize)]
pub enum DuplicateReason {
    FingerprintSeen { age_secs: i64 },
    CooldownActive { elapsed_secs: i64, cooldown_secs: u64 },
}

impl std::fmt::Display for DuplicateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DuplicateReason::FingerprintSeen { age_secs } => {
                write!(f, "identical order submitted {age_secs}s ago")
            }
            DuplicateReason::CooldownActive {
                elapsed_secs,
                cooldown_secs,
            } => write!(
                f,
                "symbol cooldown active: {elapsed_secs}s of {cooldown_secs}s elapsed"
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DedupStats {
    pub tracked_fingerprints: usize,
    pub symbols_in_cooldown: usize,
    pub checks: u64,
    pub duplicates_blocked: u64,
}

/// Duplicate-order guard.
///
/// An order's identity is the SHA-256 of its normalized parameters. The
/// guard is a reservation store: `check_and_reserve` atomically claims a
/// fingerprint, so of two identical concurrent submissions exactly one
/// passes. Reservations are released if a later gate rejects the order,
/// and confirmed by `record_sent` once execution was attempted.
pub struct DuplicateGuard {
    config: DedupConfig,
    seen: DashMap<String, DateTime<Utc>>,
    last_sent: DashMap<String, DateTime<Utc>>,
    checks: AtomicU64,
    blocked: AtomicU64,
}

impl DuplicateGuard {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            seen: DashMap::new(),
            last_sent: DashMap::new(),
            checks: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
        }
    }

    /// Canonical order identity: normalized fields joined and hashed.
    /// Decimal normalization makes `1.50` and `1.5` the same order.
    pub fn fingerprint(
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
        kind: OrderKind,
    ) -> String {
        let canonical = format!(
            "{}|{}|{}|{}|{}",
            symbol.trim().to_uppercase(),
            side,
            quantity.normalize(),
            price.normalize(),
            kind
        );
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Claim a fingerprint for submission. Returns the blocking reason if
    /// the symbol is cooling down or the fingerprint is already live.
    pub fn check_and_reserve(&self, symbol: &str, fingerprint: &str) -> Option<DuplicateReason> {
        self.checks.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();

        if let Some(last) = self.last_sent.get(symbol) {
            let elapsed_ms = now.signed_duration_since(*last).num_milliseconds();
            if elapsed_ms >= 0 && (elapsed_ms as u128) < self.config.cooldown_secs as u128 * 1000 {
                self.blocked.fetch_add(1, Ordering::Relaxed);
                return Some(DuplicateReason::CooldownActive {
                    elapsed_secs: elapsed_ms / 1000,
                    cooldown_secs: self.config.cooldown_secs,
                });
            }
        }

        if self.seen.len() > self.config.max_entries {
            self.prune(now);
        }

        let window_ms = self.config.window_secs as i64 * 1000;
        match self.seen.entry(fingerprint.to_string()) {
            Entry::Occupied(mut occupied) => {
                let age_ms = now.signed_duration_since(*occupied.get()).num_milliseconds();
                if age_ms < window_ms {
                    self.blocked.fetch_add(1, Ordering::Relaxed);
                    warn!(symbol, age_secs = age_ms / 1000, "duplicate order blocked");
                    return Some(DuplicateReason::FingerprintSeen {
                        age_secs: age_ms / 1000,
                    });
                }
                // Stale entry: this submission takes over the slot.
                occupied.insert(now);
                None
            }
            Entry::Vacant(vacant) => {
                vacant.insert(now);
                None
            }
        }
    }

    /// Drop a reservation after a downstream gate rejected the order, so
    /// an immediate corrected retry is not punished.
    pub fn release(&self, fingerprint: &str) {
        self.seen.remove(fingerprint);
    }

    /// Confirm that execution was attempted: refresh the fingerprint to
    /// the send time and start the symbol cooldown.
    pub fn record_sent(&self, symbol: &str, fingerprint: &str) {
        let now = Utc::now();
        self.seen.insert(fingerprint.to_string(), now);
        self.last_sent.insert(symbol.to_string(), now);
        debug!(symbol, "order fingerprint recorded");
    }

    pub fn stats(&self) -> DedupStats {
        let now = Utc::now();
        let cooldown_ms = self.config.cooldown_secs as i64 * 1000;
        let symbols_in_cooldown = self
            .last_sent
            .iter()
            .filter(|entry| now.signed_duration_since(*entry.value()).num_milliseconds() < cooldown_ms)
            .count();
        DedupStats {
            tracked_fingerprints: self.seen.len(),
            symbols_in_cooldown,
            checks: self.checks.load(Ordering::Relaxed),
            duplicates_blocked: self.blocked.load(Ordering::Relaxed),
        }
    }

    /// Forget everything. Meant for day-boundary resets.
    pub fn reset(&self) {
        self.seen.clear();
        self.last_sent.clear();
    }

    fn prune(&self, now: DateTime<Utc>) {
        let window_ms = self.config.window_secs as i64 * 1000;
        self.seen
            .retain(|_, seen_at| now.signed_duration_since(*seen_at).num_milliseconds() < window_ms);
        let cooldown_ms = self.config.cooldown_secs as i64 * 1000;
        self.last_sent
            .retain(|_, sent_at| now.signed_duration_since(*sent_at).num_milliseconds() < cooldown_ms);
    }
}

impl Default for DuplicateGuard {
    fn default() -> Self {
        Self::new(DedupConfig::default())
    }
}
