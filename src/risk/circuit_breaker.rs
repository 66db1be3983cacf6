//! Trading circuit breaker.
//!
//! One-way halt switch for the execution pipeline: any of the configured
//! trip conditions moves it to `Open` (or `Locked` for the kill switch),
//! emergency actions run inside the trip critical section, and every trip
//! leaves an immutable audit event behind.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{BreakerError, Result};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CircuitState {
    /// Normal operation, orders admitted
    Closed,
    /// Reserved for limited-admission recovery; never entered automatically
    HalfOpen,
    /// Tripped, orders rejected until reset
    Open,
    /// Kill switch engaged; only an admin unlock clears it
    Locked,
}

impl CircuitState {
    fn as_u8(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
            CircuitState::Locked => 3,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => CircuitState::Closed,
            1 => CircuitState::HalfOpen,
            2 => CircuitState::Open,
            _ => CircuitState::Locked,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::Locked => write!(f, "LOCKED"),
        }
    }
}

/// Why the breaker tripped
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TripReason {
    DailyLoss { loss_pct: f64 },
    Drawdown { drawdown_pct: f64 },
    ExecutionFailures { count: u32 },
    LatencySpike { latency_ms: u64 },
    DataFeedFailure { detail: String },
    ManualKill { reason: String },
}

impl std::fmt::Display for TripReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TripReason::DailyLoss { loss_pct } => {
                write!(f, "daily loss {loss_pct:.2}%")
            }
            TripReason::Drawdown { drawdown_pct } => {
                write!(f, "drawdown {drawdown_pct:.2}%")
            }
            TripReason::ExecutionFailures { count } => {
                write!(f, "{count} consecutive execution failures")
            }
            TripReason::LatencySpike { latency_ms } => {
                write!(f, "execution latency {latency_ms}ms")
            }
            TripReason::DataFeedFailure { detail } => {
                write!(f, "data feed failure: {detail}")
            }
            TripReason::ManualKill { reason } => write!(f, "kill switch: {reason}"),
        }
    }
}

/// Immutable audit record of one trip
#[derive(Debug, Clone, Serialize)]
pub struct TripEvent {
    pub timestamp: DateTime<Utc>,
    pub reason: TripReason,
    pub state_from: CircuitState,
    pub state_to: CircuitState,
    pub equity: Decimal,
    pub orders_cancelled: u32,
    pub positions_closed: u32,
    pub alert_sent: bool,
}

/// Emergency unwind hooks, fired when the breaker trips.
///
/// Implementations talk to the outside world (cancel at the venue, page
/// someone); each hook is fault-isolated, so one failing never stops the
/// others or the trip itself.
#[async_trait]
pub trait EmergencyActions: Send + Sync {
    /// Returns the number of orders cancelled.
    async fn cancel_all_orders(&self) -> Result<u32>;

    /// Returns the number of positions closed.
    async fn close_all_positions(&self) -> Result<u32>;

    async fn send_alert(&self, title: &str, detail: &str) -> Result<()>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Daily loss percent (vs the day's starting equity) that trips.
    #[serde(default = "default_max_daily_loss_pct")]
    pub max_daily_loss_pct: f64,
    /// Drawdown percent (vs peak equity) that trips.
    #[serde(default = "default_max_drawdown_pct")]
    pub max_drawdown_pct: f64,
    /// Consecutive execution failures that trip.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Single-execution latency that trips, in milliseconds.
    #[serde(default = "default_max_latency_ms")]
    pub max_latency_ms: u64,
    /// Admin credential accepted by `unlock`.
    #[serde(default = "default_unlock_token")]
    pub unlock_token: String,
    /// Trip events retained for audit.
    #[serde(default = "default_trip_history_limit")]
    pub trip_history_limit: usize,
}

fn default_max_daily_loss_pct() -> f64 {
    5.0
}

fn default_max_drawdown_pct() -> f64 {
    20.0
}

fn default_max_consecutive_failures() -> u32 {
    5
}

fn default_max_latency_ms() -> u64 {
    5000
}

fn default_unlock_token() -> String {
    "admin".to_string()
}

fn default_trip_history_limit() -> usize {
    100
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_daily_loss_pct: default_max_daily_loss_pct(),
            max_drawdown_pct: default_max_drawdown_pct(),
            max_consecutive_failures: default_max_consecutive_failures(),
            max_latency_ms: default_max_latency_ms(),
            unlock_token: default_unlock_token(),
            trip_history_limit: default_trip_history_limit(),
        }
    }
}

/// Snapshot for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub daily_pnl: Decimal,
    pub daily_loss_pct: f64,
    pub current_equity: Decimal,
    pub peak_equity: Decimal,
    pub drawdown_pct: f64,
    pub total_trips: u64,
    pub tripped_at: Option<DateTime<Utc>>,
    pub last_trip: Option<TripEvent>,
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    daily_pnl: Decimal,
    daily_start_equity: Decimal,
    current_equity: Decimal,
    peak_equity: Decimal,
    tripped_at: Option<DateTime<Utc>>,
    last_trip: Option<TripEvent>,
    trip_history: Vec<TripEvent>,
}

type TripObserver = Box<dyn Fn(&TripEvent) + Send + Sync>;
type ResetObserver = Box<dyn Fn(&str) + Send + Sync>;

/// System-wide trading halt switch.
///
/// Admission (`allows_orders`) reads an atomic mirror of the state, so the
/// hot path and the retry loop never touch the mutex. Transitions,
/// condition checks and emergency dispatch all run under one lock, which
/// makes a trip atomic: no order admitted after the state flips can race
/// the unwind.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: AtomicU8,
    inner: Mutex<BreakerInner>,
    actions: StdRwLock<Option<Arc<dyn EmergencyActions>>>,
    observers: StdRwLock<Vec<TripObserver>>,
    reset_observers: StdRwLock<Vec<ResetObserver>>,
    total_trips: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(CircuitState::Closed.as_u8()),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                daily_pnl: Decimal::ZERO,
                daily_start_equity: Decimal::ZERO,
                current_equity: Decimal::ZERO,
                peak_equity: Decimal::ZERO,
                tripped_at: None,
                last_trip: None,
                trip_history: Vec::new(),
            }),
            actions: StdRwLock::new(None),
            observers: StdRwLock::new(Vec::new()),
            reset_observers: StdRwLock::new(Vec::new()),
            total_trips: AtomicU64::new(0),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    /// Wire the emergency unwind hooks. Intended to be called once at
    /// startup, before trading begins.
    pub fn register_emergency_actions(&self, actions: Arc<dyn EmergencyActions>) {
        *self.actions.write().expect("actions lock poisoned") = Some(actions);
    }

    /// Register a trip observer. Observers run inside the trip critical
    /// section and must return quickly without calling back into the
    /// breaker; a panicking observer is contained and logged.
    pub fn on_trip<F>(&self, observer: F)
    where
        F: Fn(&TripEvent) + Send + Sync + 'static,
    {
        self.observers
            .write()
            .expect("observers lock poisoned")
            .push(Box::new(observer));
    }

    /// Register a reset observer, called with the reset reason after the
    /// breaker returns to `Closed`. Same rules as trip observers.
    pub fn on_reset<F>(&self, observer: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.reset_observers
            .write()
            .expect("observers lock poisoned")
            .push(Box::new(observer));
    }

    /// Current state, from the lock-free mirror.
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Admission predicate for new orders and retry attempts.
    pub fn allows_orders(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    /// Seed the equity baselines at session start.
    pub async fn initialize_equity(&self, equity: Decimal) {
        let mut inner = self.inner.lock().await;
        inner.daily_start_equity = equity;
        inner.current_equity = equity;
        if equity > inner.peak_equity {
            inner.peak_equity = equity;
        }
        info!(equity = %equity, "circuit breaker equity initialized");
    }

    /// Record a completed trade and re-evaluate the equity conditions.
    pub async fn record_trade_result(&self, pnl: Decimal, equity: Decimal) {
        let mut inner = self.inner.lock().await;
        inner.daily_pnl += pnl;
        inner.current_equity = equity;
        if equity > inner.peak_equity {
            inner.peak_equity = equity;
        }

        let loss_pct = daily_loss_pct(inner.daily_start_equity, equity);
        if loss_pct >= self.config.max_daily_loss_pct {
            self.trip_locked(&mut inner, TripReason::DailyLoss { loss_pct }, false)
                .await;
            return;
        }

        let dd_pct = drawdown_pct(inner.peak_equity, equity);
        if dd_pct >= self.config.max_drawdown_pct {
            self.trip_locked(&mut inner, TripReason::Drawdown { drawdown_pct: dd_pct }, false)
                .await;
        }
    }

    /// Record a failed live execution.
    pub async fn record_execution_failure(&self, detail: &str) {
        let mut inner = self.inner.lock().await;
        inner.consecutive_failures += 1;
        let count = inner.consecutive_failures;
        warn!(count, detail, "execution failure recorded");
        if count >= self.config.max_consecutive_failures {
            self.trip_locked(&mut inner, TripReason::ExecutionFailures { count }, false)
                .await;
        }
    }

    /// Record a successful execution; clears the failure streak.
    pub async fn record_execution_success(&self) {
        let mut inner = self.inner.lock().await;
        inner.consecutive_failures = 0;
    }

    /// Report one execution's latency.
    pub async fn record_latency(&self, latency_ms: u64) {
        if latency_ms < self.config.max_latency_ms {
            return;
        }
        let mut inner = self.inner.lock().await;
        self.trip_locked(&mut inner, TripReason::LatencySpike { latency_ms }, false)
            .await;
    }

    /// Report a market-data outage detected upstream.
    pub async fn record_data_feed_failure(&self, detail: impl Into<String>) {
        let mut inner = self.inner.lock().await;
        self.trip_locked(
            &mut inner,
            TripReason::DataFeedFailure {
                detail: detail.into(),
            },
            false,
        )
        .await;
    }

    /// Engage the kill switch: trip straight to `Locked`.
    pub async fn kill_switch(&self, reason: impl Into<String>) {
        let mut inner = self.inner.lock().await;
        self.trip_locked(
            &mut inner,
            TripReason::ManualKill {
                reason: reason.into(),
            },
            true,
        )
        .await;
    }

    /// Manual reset back to `Closed`. Refused while locked.
    pub async fn reset(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state == CircuitState::Locked {
            let reason = inner
                .last_trip
                .as_ref()
                .map(|t| t.reason.to_string())
                .unwrap_or_else(|| "kill switch".to_string());
            return Err(BreakerError::Locked { reason }.into());
        }
        inner.state = CircuitState::Closed;
        self.state
            .store(CircuitState::Closed.as_u8(), Ordering::SeqCst);
        inner.consecutive_failures = 0;
        inner.tripped_at = None;
        info!("circuit breaker reset to CLOSED");
        self.notify_reset("manual reset");
        Ok(())
    }

    /// Clear a locked breaker with the admin credential.
    pub async fn unlock(&self, token: &str) -> Result<()> {
        if token != self.config.unlock_token {
            warn!("circuit breaker unlock refused: bad token");
            return Err(BreakerError::InvalidUnlockToken.into());
        }
        let mut inner = self.inner.lock().await;
        inner.state = CircuitState::Closed;
        self.state
            .store(CircuitState::Closed.as_u8(), Ordering::SeqCst);
        inner.consecutive_failures = 0;
        inner.tripped_at = None;
        warn!("circuit breaker unlocked by admin");
        Ok(())
    }

    /// Start-of-day bookkeeping: zero the daily PnL and rebase the daily
    /// loss condition on current equity.
    pub async fn reset_daily_pnl(&self) {
        let mut inner = self.inner.lock().await;
        inner.daily_pnl = Decimal::ZERO;
        inner.daily_start_equity = inner.current_equity;
        debug!("daily PnL reset");
    }

    pub async fn status(&self) -> BreakerStatus {
        let inner = self.inner.lock().await;
        BreakerStatus {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            daily_pnl: inner.daily_pnl,
            daily_loss_pct: daily_loss_pct(inner.daily_start_equity, inner.current_equity),
            current_equity: inner.current_equity,
            peak_equity: inner.peak_equity,
            drawdown_pct: drawdown_pct(inner.peak_equity, inner.current_equity),
            total_trips: self.total_trips.load(Ordering::SeqCst),
            tripped_at: inner.tripped_at,
            last_trip: inner.last_trip.clone(),
        }
    }

    /// Full audit trail, oldest first.
    pub async fn trip_history(&self) -> Vec<TripEvent> {
        self.inner.lock().await.trip_history.clone()
    }

    /// Trip from an externally detected condition.
    pub async fn trip(&self, reason: TripReason) {
        let mut inner = self.inner.lock().await;
        self.trip_locked(&mut inner, reason, false).await;
    }

    /// The one place state flips. Caller holds the inner lock, so the
    /// transition, the emergency unwind and the audit append are a single
    /// atomic step with respect to every other breaker call.
    async fn trip_locked(&self, inner: &mut BreakerInner, reason: TripReason, lock: bool) {
        let target = if lock {
            CircuitState::Locked
        } else {
            CircuitState::Open
        };
        match inner.state {
            CircuitState::Locked => {
                debug!(%reason, "breaker already LOCKED, ignoring trip");
                return;
            }
            CircuitState::Open if !lock => {
                debug!(%reason, "breaker already OPEN, ignoring trip");
                return;
            }
            _ => {}
        }

        let state_from = inner.state;
        inner.state = target;
        self.state.store(target.as_u8(), Ordering::SeqCst);
        inner.tripped_at = Some(Utc::now());
        warn!(from = %state_from, to = %target, %reason, "circuit breaker TRIPPED");

        let (orders_cancelled, positions_closed, alert_sent) =
            self.run_emergency_actions(&reason).await;

        let event = TripEvent {
            timestamp: Utc::now(),
            reason,
            state_from,
            state_to: target,
            equity: inner.current_equity,
            orders_cancelled,
            positions_closed,
            alert_sent,
        };
        inner.trip_history.push(event.clone());
        if inner.trip_history.len() > self.config.trip_history_limit {
            let excess = inner.trip_history.len() - self.config.trip_history_limit;
            inner.trip_history.drain(..excess);
        }
        inner.last_trip = Some(event.clone());
        self.total_trips.fetch_add(1, Ordering::SeqCst);

        let observers = self.observers.read().expect("observers lock poisoned");
        for observer in observers.iter() {
            if catch_unwind(AssertUnwindSafe(|| observer(&event))).is_err() {
                error!("trip observer panicked");
            }
        }
    }

    fn notify_reset(&self, reason: &str) {
        let observers = self
            .reset_observers
            .read()
            .expect("observers lock poisoned");
        for observer in observers.iter() {
            if catch_unwind(AssertUnwindSafe(|| observer(reason))).is_err() {
                error!("reset observer panicked");
            }
        }
    }

    /// Run the unwind hooks, isolating each fault.
    async fn run_emergency_actions(&self, reason: &TripReason) -> (u32, u32, bool) {
        let actions = self
            .actions
            .read()
            .expect("actions lock poisoned")
            .clone();
        let Some(actions) = actions else {
            return (0, 0, false);
        };

        let orders_cancelled = match actions.cancel_all_orders().await {
            Ok(count) => {
                info!(count, "emergency cancel completed");
                count
            }
            Err(err) => {
                error!(%err, "emergency cancel failed");
                0
            }
        };
        let positions_closed = match actions.close_all_positions().await {
            Ok(count) => {
                info!(count, "emergency close completed");
                count
            }
            Err(err) => {
                error!(%err, "emergency close failed");
                0
            }
        };
        let alert_sent = match actions
            .send_alert("Circuit breaker tripped", &reason.to_string())
            .await
        {
            Ok(()) => true,
            Err(err) => {
                error!(%err, "emergency alert failed");
                false
            }
        };
        (orders_cancelled, positions_closed, alert_sent)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn daily_loss_pct(start: Decimal, current: Decimal) -> f64 {
    if start <= Decimal::ZERO || current >= start {
        return 0.0;
    }
    ((start - current) / start * Decimal::from(100))
        .to_f64()
        .unwrap_or(0.0)
}

fn drawdown_pct(peak: Decimal, current: Decimal) -> f64 {
    if peak <= Decimal::ZERO || current >= peak {
        return 0.0;
    }
    ((peak - current) / peak * Decimal::from(100))
        .to_f64()
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::atomic::AtomicU32;

    struct CountingActions {
        cancels: AtomicU32,
        closes: AtomicU32,
        alerts: AtomicU32,
        fail_cancel: bool,
    }

    impl CountingActions {
        fn new() -> Self {
            Self {
                cancels: AtomicU32::new(0),
                closes: AtomicU32::new(0),
                alerts: AtomicU32::new(0),
                fail_cancel: false,
            }
        }

        fn failing_cancel() -> Self {
            Self {
                fail_cancel: true,
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl EmergencyActions for CountingActions {
        async fn cancel_all_orders(&self) -> Result<u32> {
            if self.fail_cancel {
                return Err(crate::error::BreakwaterError::Internal(
                    "cancel endpoint down".to_string(),
                ));
            }
            self.cancels.fetch_add(1, Ordering::SeqCst);
            Ok(3)
        }

        async fn close_all_positions(&self) -> Result<u32> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(2)
        }

        async fn send_alert(&self, _title: &str, _detail: &str) -> Result<()> {
            self.alerts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn initial_state_allows_orders() {
        let cb = CircuitBreaker::with_defaults();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allows_orders());
    }

    #[tokio::test]
    async fn trips_on_consecutive_failures() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            max_consecutive_failures: 3,
            ..CircuitBreakerConfig::default()
        });

        cb.record_execution_failure("timeout").await;
        cb.record_execution_failure("timeout").await;
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_execution_failure("timeout").await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allows_orders());
    }

    #[tokio::test]
    async fn success_resets_failure_streak() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            max_consecutive_failures: 3,
            ..CircuitBreakerConfig::default()
        });

        cb.record_execution_failure("e1").await;
        cb.record_execution_failure("e2").await;
        cb.record_execution_success().await;
        cb.record_execution_failure("e3").await;
        cb.record_execution_failure("e4").await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn trips_on_daily_loss() {
        let cb = CircuitBreaker::with_defaults();
        cb.initialize_equity(dec!(100000)).await;

        cb.record_trade_result(dec!(-2000), dec!(98000)).await;
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_trade_result(dec!(-4000), dec!(94000)).await;
        assert_eq!(cb.state(), CircuitState::Open);
        let status = cb.status().await;
        assert!(matches!(
            status.last_trip.unwrap().reason,
            TripReason::DailyLoss { .. }
        ));
    }

    #[tokio::test]
    async fn trips_on_drawdown_from_peak() {
        // Daily loss limit set high so only the drawdown condition can fire.
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            max_daily_loss_pct: 50.0,
            max_drawdown_pct: 10.0,
            ..CircuitBreakerConfig::default()
        });
        cb.initialize_equity(dec!(100000)).await;
        cb.record_trade_result(dec!(30000), dec!(130000)).await;
        assert_eq!(cb.state(), CircuitState::Closed);

        // 11.5% off the 130k peak, still above the day's starting equity.
        cb.record_trade_result(dec!(-15000), dec!(115000)).await;
        assert_eq!(cb.state(), CircuitState::Open);
        let status = cb.status().await;
        assert!(matches!(
            status.last_trip.unwrap().reason,
            TripReason::Drawdown { .. }
        ));
    }

    #[tokio::test]
    async fn latency_over_threshold_trips() {
        let cb = CircuitBreaker::with_defaults();
        cb.record_latency(4999).await;
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_latency(5001).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn kill_switch_locks_until_admin_unlock() {
        let cb = CircuitBreaker::with_defaults();
        cb.kill_switch("fat finger").await;
        assert_eq!(cb.state(), CircuitState::Locked);

        let err = cb.reset().await.expect_err("reset must refuse while locked");
        assert!(err.to_string().contains("locked"));
        assert_eq!(cb.state(), CircuitState::Locked);

        assert!(cb.unlock("wrong").await.is_err());
        assert_eq!(cb.state(), CircuitState::Locked);

        cb.unlock("admin").await.expect("correct token unlocks");
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allows_orders());
    }

    #[tokio::test]
    async fn emergency_actions_fire_exactly_once() {
        let cb = CircuitBreaker::with_defaults();
        let actions = Arc::new(CountingActions::new());
        cb.register_emergency_actions(actions.clone());

        cb.kill_switch("halt").await;
        // Second kill while locked is ignored.
        cb.kill_switch("halt again").await;
        cb.record_latency(10_000).await;

        assert_eq!(actions.cancels.load(Ordering::SeqCst), 1);
        assert_eq!(actions.closes.load(Ordering::SeqCst), 1);
        assert_eq!(actions.alerts.load(Ordering::SeqCst), 1);

        let history = cb.trip_history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].orders_cancelled, 3);
        assert_eq!(history[0].positions_closed, 2);
        assert!(history[0].alert_sent);
    }

    #[tokio::test]
    async fn failing_hook_does_not_stop_the_trip() {
        let cb = CircuitBreaker::with_defaults();
        let actions = Arc::new(CountingActions::failing_cancel());
        cb.register_emergency_actions(actions.clone());

        cb.trip(TripReason::DataFeedFailure {
            detail: "ws dropped".to_string(),
        })
        .await;

        assert_eq!(cb.state(), CircuitState::Open);
        // Close and alert still ran.
        assert_eq!(actions.closes.load(Ordering::SeqCst), 1);
        assert_eq!(actions.alerts.load(Ordering::SeqCst), 1);
        let history = cb.trip_history().await;
        assert_eq!(history[0].orders_cancelled, 0);
        assert_eq!(history[0].positions_closed, 2);
    }

    #[tokio::test]
    async fn observers_see_each_trip() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            max_consecutive_failures: 1,
            ..CircuitBreakerConfig::default()
        });
        let seen = Arc::new(AtomicU32::new(0));
        let seen_clone = seen.clone();
        cb.on_trip(move |event| {
            assert!(matches!(event.reason, TripReason::ExecutionFailures { .. }));
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        cb.record_execution_failure("boom").await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_observer_does_not_block_the_trip() {
        let cb = CircuitBreaker::with_defaults();
        let after = Arc::new(AtomicU32::new(0));
        let after_clone = after.clone();
        cb.on_trip(|_| panic!("observer bug"));
        cb.on_trip(move |_| {
            after_clone.fetch_add(1, Ordering::SeqCst);
        });

        cb.kill_switch("halt").await;
        assert_eq!(cb.state(), CircuitState::Locked);
        assert_eq!(after.load(Ordering::SeqCst), 1, "later observers still run");
    }

    #[tokio::test]
    async fn reset_reopens_after_plain_trip() {
        let cb = CircuitBreaker::with_defaults();
        let resets = Arc::new(AtomicU32::new(0));
        let resets_clone = resets.clone();
        cb.on_reset(move |reason| {
            assert_eq!(reason, "manual reset");
            resets_clone.fetch_add(1, Ordering::SeqCst);
        });

        cb.record_data_feed_failure("stale quotes").await;
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset().await.expect("open breaker resets");
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(resets.load(Ordering::SeqCst), 1);
        // History survives the reset.
        assert_eq!(cb.trip_history().await.len(), 1);
    }
}
