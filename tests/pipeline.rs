use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use breakwater::execution::dedup::DedupConfig;
use breakwater::execution::retry::RetryPolicy;
use breakwater::risk::DrawdownSeverity;
use breakwater::{
    ArmError, BreakerError, BreakwaterError, BrokerAck, BrokerConnector, BrokerError,
    CircuitState, EmergencyActions, ExecutionPath, ModeConfig, OrderInstruction, OrderRequest,
    OrderRouter, OrderSide, OrderStatus, PaperConfig, PipelineConfig, Result, TradingMode,
    TripReason,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("breakwater=debug")
        .with_test_writer()
        .try_init();
}

/// Instant paper fills, no symbol cooldown, single-attempt retries, and no
/// paper seasoning requirement, so tests run in milliseconds.
fn fast_config() -> PipelineConfig {
    PipelineConfig {
        paper: PaperConfig::instant(),
        dedup: DedupConfig {
            cooldown_secs: 0,
            ..DedupConfig::default()
        },
        retry: RetryPolicy {
            max_attempts: 1,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            jitter: 0.0,
            ..RetryPolicy::default()
        },
        mode: ModeConfig {
            min_paper_days: 0,
            ..ModeConfig::default()
        },
        ..PipelineConfig::default()
    }
}

fn market_buy(quantity: Decimal, price: Decimal) -> OrderRequest {
    OrderRequest::market("BTC/USDT", OrderSide::Buy, quantity, price).with_balance(dec!(100000))
}

async fn arm_live(router: &OrderRouter) {
    let mode = router.mode_controller();
    mode.mark_walk_forward_passed().await;
    mode.mark_circuit_breaker_ready().await;
    mode.arm_live("CONFIRM-LIVE-TRADING", None)
        .await
        .expect("arming should succeed once every prerequisite is met");
}

/// Connector that refuses every order with a transient wire error.
struct RefusingConnector {
    calls: AtomicU32,
}

impl RefusingConnector {
    fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl BrokerConnector for RefusingConnector {
    async fn create_order(
        &self,
        _instruction: &OrderInstruction,
    ) -> std::result::Result<BrokerAck, BrokerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(BrokerError::Connection("connection refused".to_string()))
    }
}

/// Connector that times out a fixed number of times, then fills at the
/// requested price.
struct FlakyConnector {
    calls: AtomicU32,
    failures_before_success: u32,
}

impl FlakyConnector {
    fn new(failures_before_success: u32) -> Self {
        Self {
            calls: AtomicU32::new(0),
            failures_before_success,
        }
    }
}

#[async_trait]
impl BrokerConnector for FlakyConnector {
    async fn create_order(
        &self,
        instruction: &OrderInstruction,
    ) -> std::result::Result<BrokerAck, BrokerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures_before_success {
            return Err(BrokerError::Timeout { elapsed_ms: 1 });
        }
        Ok(BrokerAck {
            broker_order_id: format!("live-{call}"),
            price: instruction.price,
            filled_quantity: instruction.quantity,
        })
    }
}

#[derive(Default)]
struct RecordingActions {
    cancels: AtomicU32,
    closes: AtomicU32,
    alerts: AtomicU32,
}

#[async_trait]
impl EmergencyActions for RecordingActions {
    async fn cancel_all_orders(&self) -> Result<u32> {
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

/// A paper order passes every gate and fills exactly as requested.
#[tokio::test]
async fn paper_order_flows_through_every_gate() {
    init_tracing();
    let router = OrderRouter::new(fast_config());

    let ticket = router.submit_order(market_buy(dec!(0.5), dec!(20000))).await;

    assert_eq!(ticket.status, OrderStatus::Filled);
    assert_eq!(ticket.path, Some(ExecutionPath::Simulated));
    assert_eq!(ticket.broker, "paper");
    assert_eq!(ticket.fill_price, Some(dec!(20000)));
    assert_eq!(ticket.filled_quantity, dec!(0.5));
    assert!(
        ticket.estimated_slippage_bps.is_some(),
        "pre-estimate should be recorded on the ticket"
    );
    assert_eq!(ticket.slippage_bps, Some(0.0));
    assert!(ticket.latency_ms.is_some());

    let decision = ticket.pre_trade.expect("decision should be attached");
    assert!(decision.approved);
    assert_eq!(decision.risk_score, 0.0);

    let stats = router.get_execution_stats().await;
    assert_eq!(stats.total_orders, 1);
    assert_eq!(stats.filled, 1);
    assert_eq!(stats.fill_rate_pct, 100.0);
    assert_eq!(stats.latency.count, 1);
}

/// A 12% drawdown quarters the order before the pre-trade check sees it.
#[tokio::test]
async fn drawdown_scales_quantity_before_execution() {
    init_tracing();
    let router = OrderRouter::new(fast_config());
    let drawdown = router.drawdown();
    drawdown.observe_equity(dec!(100000)).await;
    drawdown.observe_equity(dec!(88000)).await;

    let ticket = router.submit_order(market_buy(dec!(10), dec!(1000))).await;

    assert_eq!(ticket.status, OrderStatus::Filled);
    assert_eq!(ticket.requested_quantity, dec!(10));
    assert_eq!(ticket.quantity, dec!(2.5));
    assert_eq!(ticket.filled_quantity, dec!(2.5));

    let decision = ticket.pre_trade.expect("decision should be attached");
    assert!(decision.approved);
    assert!(
        !decision.warnings.is_empty(),
        "reduced sizing should surface as a warning"
    );

    let stats = router.get_execution_stats().await;
    assert_eq!(stats.drawdown.severity, DrawdownSeverity::Caution);
    assert_eq!(stats.drawdown.multiplier, dec!(0.25));
}

/// Past the lock threshold the pipeline rejects instead of sending dust.
#[tokio::test]
async fn locked_drawdown_rejects_orders() {
    init_tracing();
    let router = OrderRouter::new(fast_config());
    let drawdown = router.drawdown();
    drawdown.observe_equity(dec!(100000)).await;
    drawdown.observe_equity(dec!(75000)).await;

    let ticket = router.submit_order(market_buy(dec!(1), dec!(100))).await;

    assert_eq!(ticket.status, OrderStatus::Rejected);
    assert!(ticket
        .rejection_reason
        .as_deref()
        .unwrap()
        .contains("drawdown"));

    // The reserved fingerprint must be released on rejection.
    let stats = router.get_execution_stats().await;
    assert_eq!(stats.dedup.tracked_fingerprints, 0);
}

/// Five straight live failures trip the breaker; the sixth order is
/// rejected without ever reaching the connector.
#[tokio::test]
async fn consecutive_live_failures_trip_the_breaker() {
    init_tracing();
    let router = OrderRouter::new(fast_config());
    arm_live(&router).await;
    let connector = Arc::new(RefusingConnector::new());
    router.register_connector("binance", connector.clone()).await;

    for i in 1..=5u32 {
        let request = market_buy(Decimal::from(i), dec!(100)).with_broker("binance");
        let ticket = router.submit_order(request).await;
        assert_eq!(ticket.status, OrderStatus::Failed, "order {i} should fail");
        assert_eq!(ticket.path, Some(ExecutionPath::Live));
        assert!(ticket.error.as_deref().unwrap().contains("retries exhausted"));
    }

    let breaker = router.circuit_breaker();
    assert_eq!(breaker.state(), CircuitState::Open);
    let status = breaker.status().await;
    assert_eq!(status.consecutive_failures, 5);
    assert_eq!(status.total_trips, 1);

    let blocked = router
        .submit_order(market_buy(dec!(6), dec!(100)).with_broker("binance"))
        .await;
    assert_eq!(blocked.status, OrderStatus::Rejected);
    assert!(blocked
        .rejection_reason
        .as_deref()
        .unwrap()
        .contains("circuit breaker is OPEN"));
    assert_eq!(
        connector.calls.load(Ordering::SeqCst),
        5,
        "the blocked order must not touch the connector"
    );
}

/// The kill switch fires the emergency hooks once and stays locked until
/// the admin token reopens trading.
#[tokio::test]
async fn kill_switch_requires_admin_unlock() {
    init_tracing();
    let router = OrderRouter::new(fast_config());
    let actions = Arc::new(RecordingActions::default());
    let breaker = router.circuit_breaker();
    breaker.register_emergency_actions(actions.clone());

    breaker.kill_switch("manual risk halt").await;
    assert_eq!(breaker.state(), CircuitState::Locked);
    assert_eq!(actions.cancels.load(Ordering::SeqCst), 1);
    assert_eq!(actions.closes.load(Ordering::SeqCst), 1);
    assert_eq!(actions.alerts.load(Ordering::SeqCst), 1);

    let blocked = router.submit_order(market_buy(dec!(1), dec!(100))).await;
    assert_eq!(blocked.status, OrderStatus::Rejected);

    // Plain reset is refused while locked.
    let refused = breaker.reset().await.unwrap_err();
    assert!(matches!(
        refused,
        BreakwaterError::Breaker(BreakerError::Locked { .. })
    ));

    let bad_token = breaker.unlock("nope").await.unwrap_err();
    assert!(matches!(
        bad_token,
        BreakwaterError::Breaker(BreakerError::InvalidUnlockToken)
    ));

    breaker.unlock("admin").await.expect("admin token unlocks");
    assert_eq!(breaker.state(), CircuitState::Closed);

    let ticket = router.submit_order(market_buy(dec!(2), dec!(100))).await;
    assert_eq!(ticket.status, OrderStatus::Filled);

    // Hooks fired exactly once, for the single trip.
    assert_eq!(actions.cancels.load(Ordering::SeqCst), 1);
    let history = breaker.trip_history().await;
    assert_eq!(history.len(), 1);
    let event = &history[0];
    assert!(matches!(event.reason, TripReason::ManualKill { .. }));
    assert_eq!(event.orders_cancelled, 3);
    assert_eq!(event.positions_closed, 2);
    assert!(event.alert_sent);
}

/// An identical resubmission inside the window is blocked; a different
/// size on the same symbol goes through.
#[tokio::test]
async fn duplicate_suppression_blocks_identical_orders() {
    init_tracing();
    let router = OrderRouter::new(fast_config());

    let first = router.submit_order(market_buy(dec!(1), dec!(100))).await;
    assert_eq!(first.status, OrderStatus::Filled);

    let twin = router.submit_order(market_buy(dec!(1), dec!(100))).await;
    assert_eq!(twin.status, OrderStatus::Rejected);
    assert!(twin.rejection_reason.as_deref().unwrap().contains("duplicate"));

    let resized = router.submit_order(market_buy(dec!(2), dec!(100))).await;
    assert_eq!(resized.status, OrderStatus::Filled);

    let stats = router.get_execution_stats().await;
    assert_eq!(stats.dedup.duplicates_blocked, 1);
}

/// Transient venue errors are retried with backoff until the order lands.
#[tokio::test]
async fn transient_failures_retry_until_the_order_lands() {
    init_tracing();
    let mut config = fast_config();
    config.retry.max_attempts = 3;
    let router = OrderRouter::new(config);
    arm_live(&router).await;
    let connector = Arc::new(FlakyConnector::new(2));
    router.register_connector("binance", connector.clone()).await;

    let ticket = router
        .submit_order(market_buy(dec!(1), dec!(100)).with_broker("binance"))
        .await;

    assert_eq!(ticket.status, OrderStatus::Filled);
    assert_eq!(ticket.path, Some(ExecutionPath::Live));
    assert_eq!(ticket.retry_count, 3);
    assert_eq!(connector.calls.load(Ordering::SeqCst), 3);

    // The eventual success cleared the failure streak.
    let status = router.circuit_breaker().status().await;
    assert_eq!(status.consecutive_failures, 0);
}

/// Without the armed mode, live-broker traffic runs through the simulator.
#[tokio::test]
async fn live_dry_mode_keeps_orders_in_simulation() {
    init_tracing();
    let router = OrderRouter::new(fast_config());
    router.mode_controller().set_live_dry().await;
    let connector = Arc::new(FlakyConnector::new(0));
    router.register_connector("binance", connector.clone()).await;

    let ticket = router
        .submit_order(market_buy(dec!(1), dec!(100)).with_broker("binance"))
        .await;

    assert_eq!(ticket.status, OrderStatus::Filled);
    assert_eq!(ticket.path, Some(ExecutionPath::Simulated));
    assert_eq!(connector.calls.load(Ordering::SeqCst), 0);

    let stats = router.get_execution_stats().await;
    assert_eq!(stats.mode, TradingMode::LiveDry);
}

/// Naming a live broker with no registered connector fails the order as a
/// configuration defect and releases its fingerprint for resubmission.
#[tokio::test]
async fn missing_connector_fails_the_order() {
    init_tracing();
    let router = OrderRouter::new(fast_config());

    let ticket = router
        .submit_order(market_buy(dec!(1), dec!(100)).with_broker("kraken"))
        .await;

    assert_eq!(ticket.status, OrderStatus::Failed);
    assert!(ticket
        .error
        .as_deref()
        .unwrap()
        .contains("no connector registered"));
    assert!(ticket.path.is_none(), "execution never started");

    let stats = router.get_execution_stats().await;
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.dedup.tracked_fingerprints, 0);

    // The identical order goes through once the connector is wired; with
    // the mode not armed it runs on the simulated path.
    router
        .register_connector("kraken", Arc::new(FlakyConnector::new(0)))
        .await;
    let retried = router
        .submit_order(market_buy(dec!(1), dec!(100)).with_broker("kraken"))
        .await;
    assert_eq!(retried.status, OrderStatus::Filled);
    assert_eq!(retried.path, Some(ExecutionPath::Simulated));
}

/// Arming prerequisites are checked in a fixed order and the capital
/// limit clamps to the configured ceiling.
#[tokio::test]
async fn arming_walks_the_prerequisite_ladder() {
    init_tracing();
    let router = OrderRouter::new(fast_config());
    let mode = router.mode_controller();

    assert_eq!(
        mode.arm_live("wrong-key", None).await,
        Err(ArmError::ConfirmationMismatch)
    );
    assert_eq!(
        mode.arm_live("CONFIRM-LIVE-TRADING", None).await,
        Err(ArmError::WalkForwardNotValidated)
    );
    mode.mark_walk_forward_passed().await;
    assert_eq!(
        mode.arm_live("CONFIRM-LIVE-TRADING", None).await,
        Err(ArmError::CircuitBreakerNotReady)
    );
    mode.mark_circuit_breaker_ready().await;

    mode.arm_live("CONFIRM-LIVE-TRADING", Some(dec!(50000)))
        .await
        .expect("all prerequisites met");
    assert_eq!(mode.mode(), TradingMode::LiveArmed);

    let status = mode.status().await;
    assert_eq!(status.live_capital_limit, Some(dec!(10000)));

    mode.disarm().await;
    assert_eq!(mode.mode(), TradingMode::LiveDry);
}

/// Orders above the per-order balance cap are resized down, not rejected.
#[tokio::test]
async fn oversized_order_is_resized_to_the_cap() {
    init_tracing();
    let router = OrderRouter::new(fast_config());

    let request = OrderRequest::market("BTC/USDT", OrderSide::Buy, dec!(1), dec!(4000))
        .with_balance(dec!(10000));
    let ticket = router.submit_order(request).await;

    // Cap is 25% of the 10k balance, so 2500 of value at 4000 a coin.
    assert_eq!(ticket.status, OrderStatus::Filled);
    assert_eq!(ticket.quantity, dec!(0.625));
    assert_eq!(ticket.filled_quantity, dec!(0.625));

    let decision = ticket.pre_trade.expect("decision should be attached");
    assert_eq!(decision.adjusted_quantity, Some(dec!(0.625)));
    assert!(!decision.warnings.is_empty());
    assert_eq!(decision.risk_score, 20.0);
}

/// Fill and reject callbacks fire on settled tickets, and a panicking
/// callback never takes the pipeline down.
#[tokio::test]
async fn callbacks_fire_and_panics_are_contained() {
    init_tracing();
    let router = OrderRouter::new(fast_config());

    let fills = Arc::new(AtomicU32::new(0));
    let rejections = Arc::new(AtomicU32::new(0));
    let fill_count = fills.clone();
    let reject_count = rejections.clone();
    router.register_callbacks(
        Some(Arc::new(move |_| {
            fill_count.fetch_add(1, Ordering::SeqCst);
        })),
        Some(Arc::new(move |_| {
            reject_count.fetch_add(1, Ordering::SeqCst);
        })),
    );

    let filled = router.submit_order(market_buy(dec!(1), dec!(100))).await;
    assert_eq!(filled.status, OrderStatus::Filled);
    assert_eq!(fills.load(Ordering::SeqCst), 1);
    assert_eq!(rejections.load(Ordering::SeqCst), 0);

    let twin = router.submit_order(market_buy(dec!(1), dec!(100))).await;
    assert_eq!(twin.status, OrderStatus::Rejected);
    assert_eq!(rejections.load(Ordering::SeqCst), 1);

    router.register_callbacks(Some(Arc::new(|_| panic!("observer bug"))), None);
    let ticket = router.submit_order(market_buy(dec!(2), dec!(100))).await;
    assert_eq!(
        ticket.status,
        OrderStatus::Filled,
        "a panicking callback must not affect the order"
    );
}
