//! The order pipeline: fixed-order risk gates in front of execution,
//! short-circuiting on the first rejection.
//!
//! `submit_order` is the only sanctioned way to place an order. Gates run
//! sequentially within one call; concurrent calls rely on the duplicate
//! guard and the order book being independently thread-safe.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerConnector, OrderInstruction, PaperConnector};
use crate::config::PipelineConfig;
use crate::domain::{
    ExecutionPath, OrderRequest, OrderStatus, OrderTicket, PositionSnapshot, PAPER_BROKER,
};
use crate::execution::dedup::{DedupStats, DuplicateGuard};
use crate::execution::latency::{LatencyStats, LatencyTracker};
use crate::execution::retry::{RetryEngine, RetryFailure};
use crate::execution::slippage::{MarketConditions, SlippageModel, SlippageStats};
use crate::mode::{ModeController, TradingMode};
use crate::risk::{
    BreakerStatus, CircuitBreaker, DrawdownProtector, DrawdownState, PreTradeCheck,
    PreTradeInputs, StandardPreTradeCheck,
};

pub type OrderCallback = Arc<dyn Fn(&OrderTicket) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_fill: Option<OrderCallback>,
    on_reject: Option<OrderCallback>,
}

/// Cross-component execution summary for dashboards and the journal
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionStats {
    pub total_orders: usize,
    pub filled: usize,
    pub partially_filled: usize,
    pub rejected: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub open: usize,
    pub fill_rate_pct: f64,
    pub avg_slippage_bps: f64,
    pub avg_latency_ms: f64,
    pub mode: TradingMode,
    pub circuit_breaker: BreakerStatus,
    pub drawdown: DrawdownState,
    pub slippage: SlippageStats,
    pub latency: LatencyStats,
    pub dedup: DedupStats,
}

pub struct OrderRouter {
    circuit_breaker: Arc<CircuitBreaker>,
    drawdown: Arc<DrawdownProtector>,
    dedup: Arc<DuplicateGuard>,
    slippage: Arc<SlippageModel>,
    latency: Arc<LatencyTracker>,
    mode: Arc<ModeController>,
    retry: RetryEngine,
    pretrade: Arc<dyn PreTradeCheck>,
    paper: PaperConnector,
    connectors: RwLock<HashMap<String, Arc<dyn BrokerConnector>>>,
    orders: DashMap<String, OrderTicket>,
    positions: DashMap<String, PositionSnapshot>,
    callbacks: std::sync::RwLock<Callbacks>,
}

impl OrderRouter {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            circuit_breaker: Arc::new(CircuitBreaker::new(config.circuit_breaker)),
            drawdown: Arc::new(DrawdownProtector::new(config.drawdown)),
            dedup: Arc::new(DuplicateGuard::new(config.dedup)),
            slippage: Arc::new(SlippageModel::new(config.slippage)),
            latency: Arc::new(LatencyTracker::new(config.latency)),
            mode: Arc::new(ModeController::new(config.mode)),
            retry: RetryEngine::new(config.retry),
            pretrade: Arc::new(StandardPreTradeCheck::new(config.pretrade)),
            paper: PaperConnector::new(config.paper),
            connectors: RwLock::new(HashMap::new()),
            orders: DashMap::new(),
            positions: DashMap::new(),
            callbacks: std::sync::RwLock::new(Callbacks::default()),
        }
    }

    /// Swap in a desk-specific risk rule set.
    pub fn with_pretrade_check(mut self, check: Arc<dyn PreTradeCheck>) -> Self {
        self.pretrade = check;
        self
    }

    pub fn circuit_breaker(&self) -> Arc<CircuitBreaker> {
        self.circuit_breaker.clone()
    }

    pub fn drawdown(&self) -> Arc<DrawdownProtector> {
        self.drawdown.clone()
    }

    pub fn mode_controller(&self) -> Arc<ModeController> {
        self.mode.clone()
    }

    pub fn slippage_model(&self) -> Arc<SlippageModel> {
        self.slippage.clone()
    }

    pub fn latency_tracker(&self) -> Arc<LatencyTracker> {
        self.latency.clone()
    }

    pub fn duplicate_guard(&self) -> Arc<DuplicateGuard> {
        self.dedup.clone()
    }

    pub async fn register_connector(
        &self,
        name: impl Into<String>,
        connector: Arc<dyn BrokerConnector>,
    ) {
        let name = name.into();
        info!(broker = %name, "broker connector registered");
        self.connectors.write().await.insert(name, connector);
    }

    pub fn register_callbacks(
        &self,
        on_fill: Option<OrderCallback>,
        on_reject: Option<OrderCallback>,
    ) {
        let mut callbacks = self.callbacks.write().expect("callbacks lock poisoned");
        callbacks.on_fill = on_fill;
        callbacks.on_reject = on_reject;
    }

    /// Run one order through the full gate sequence and execute it.
    ///
    /// Never returns an error: every outcome, including configuration
    /// defects, comes back as a terminal-status ticket.
    pub async fn submit_order(&self, request: OrderRequest) -> OrderTicket {
        let mut ticket = OrderTicket::from_request(&request);
        info!(
            order_id = %ticket.id,
            symbol = %ticket.symbol,
            side = %ticket.side,
            kind = %ticket.kind,
            quantity = %ticket.quantity,
            broker = %ticket.broker,
            signal = ticket.signal_source.as_deref().unwrap_or("-"),
            "order pipeline start"
        );

        // Gate 1: circuit breaker admission.
        if !self.circuit_breaker.allows_orders() {
            let state = self.circuit_breaker.state();
            ticket.mark_rejected(format!("circuit breaker is {state}"));
            return self.finish_rejected(ticket);
        }

        // Gate 2: duplicate fingerprint, reserved up front so concurrent
        // twins cannot both pass.
        let fingerprint = DuplicateGuard::fingerprint(
            &ticket.symbol,
            ticket.side,
            ticket.quantity,
            ticket.price,
            ticket.kind,
        );
        ticket.fingerprint = Some(fingerprint.clone());
        if let Some(reason) = self.dedup.check_and_reserve(&ticket.symbol, &fingerprint) {
            ticket.mark_rejected(format!("duplicate order: {reason}"));
            return self.finish_rejected(ticket);
        }

        // Gate 3: drawdown scaling. A zero multiplier rejects outright
        // rather than submitting a zero-quantity order.
        let multiplier = self.drawdown.position_size_multiplier().await;
        if multiplier <= Decimal::ZERO {
            self.dedup.release(&fingerprint);
            ticket.mark_rejected("drawdown protection has locked trading");
            return self.finish_rejected(ticket);
        }
        if multiplier < Decimal::ONE {
            ticket.scale_quantity(multiplier);
            info!(
                order_id = %ticket.id,
                requested = %ticket.requested_quantity,
                scaled = %ticket.quantity,
                %multiplier,
                "quantity scaled by drawdown protection"
            );
        }

        // Gate 4: pre-trade risk check on the scaled order.
        let inputs = PreTradeInputs {
            symbol: ticket.symbol.clone(),
            side: ticket.side,
            quantity: ticket.quantity,
            price: ticket.price,
            stop_loss: ticket.stop_loss,
            take_profit: ticket.take_profit,
            leverage: ticket.leverage,
            account_balance: request.balance,
            open_positions: self.positions(),
            drawdown_multiplier: multiplier,
            breaker_ok: true,
        };
        let decision = self.pretrade.check(&inputs);
        ticket.pre_trade = Some(decision.clone());
        if !decision.approved {
            self.dedup.release(&fingerprint);
            ticket.mark_rejected(format!(
                "pre-trade check failed: {}",
                decision.rejections.join("; ")
            ));
            return self.finish_rejected(ticket);
        }
        if let Some(adjusted) = decision.adjusted_quantity {
            ticket.quantity = adjusted;
        }

        // Step 5: slippage pre-estimate. Bookkeeping only, never blocks.
        let estimate = self.slippage.estimate(
            ticket.price,
            ticket.side,
            ticket.quantity,
            &MarketConditions::default(),
        );
        ticket.estimated_slippage_bps = Some(estimate.bps);
        debug!(
            order_id = %ticket.id,
            estimated_bps = estimate.bps,
            expected_fill = %estimate.expected_fill_price,
            "slippage pre-estimate"
        );

        // Step 6: execution.
        let connector = self.connectors.read().await.get(&ticket.broker).cloned();
        let live_broker = ticket.broker != PAPER_BROKER;
        if live_broker && connector.is_none() {
            // Configuration defect, not a market rejection.
            self.dedup.release(&fingerprint);
            ticket.mark_failed(format!(
                "no connector registered for broker {}",
                ticket.broker
            ));
            error!(order_id = %ticket.id, broker = %ticket.broker, "connector missing");
            self.orders.insert(ticket.id.clone(), ticket.clone());
            return ticket;
        }

        let started = Instant::now();
        match connector {
            Some(connector) if live_broker && self.mode.is_live_armed() => {
                self.execute_live(&mut ticket, connector).await;
            }
            _ => {
                if live_broker {
                    info!(
                        order_id = %ticket.id,
                        mode = %self.mode.mode(),
                        "live trading not armed, demoting to simulated execution"
                    );
                }
                self.execute_simulated(&mut ticket).await;
            }
        }
        let elapsed_ms = started.elapsed().as_millis() as u64;

        // Steps 7 and 8: post-trade bookkeeping.
        self.settle(ticket, &fingerprint, elapsed_ms).await
    }

    async fn execute_simulated(&self, ticket: &mut OrderTicket) {
        ticket.mark_submitted(ExecutionPath::Simulated);
        match self.paper.create_order(&instruction_for(ticket)).await {
            Ok(ack) => {
                ticket.mark_filled(Some(ack.broker_order_id), ack.price, ack.filled_quantity);
            }
            Err(err) => {
                ticket.mark_failed(format!("simulated execution failed: {err}"));
            }
        }
    }

    async fn execute_live(&self, ticket: &mut OrderTicket, connector: Arc<dyn BrokerConnector>) {
        ticket.mark_submitted(ExecutionPath::Live);
        let instruction = instruction_for(ticket);
        let breaker = self.circuit_breaker.clone();
        let outcome = self
            .retry
            .run(
                "create_order",
                || breaker.allows_orders(),
                || {
                    let connector = connector.clone();
                    let instruction = instruction.clone();
                    async move { connector.create_order(&instruction).await }
                },
            )
            .await;
        ticket.retry_count = outcome.attempts;

        match outcome.result {
            Ok(ack) => {
                self.circuit_breaker.record_execution_success().await;
                ticket.mark_filled(Some(ack.broker_order_id), ack.price, ack.filled_quantity);
            }
            Err(RetryFailure::Aborted { attempts }) => {
                // The breaker closed the gate mid-sequence. That is not this
                // order's fault, so the failure counter is left alone.
                ticket.mark_failed(format!(
                    "aborted by circuit breaker after {attempts} attempt(s)"
                ));
            }
            Err(failure @ (RetryFailure::Fatal { .. } | RetryFailure::Exhausted { .. })) => {
                let detail = failure.to_string();
                self.circuit_breaker.record_execution_failure(&detail).await;
                ticket.mark_failed(detail);
            }
        }
    }

    /// Latency, realized slippage, fingerprint confirmation, storage and
    /// callbacks for an order that reached the execution stage.
    async fn settle(
        &self,
        mut ticket: OrderTicket,
        fingerprint: &str,
        elapsed_ms: u64,
    ) -> OrderTicket {
        ticket.latency_ms = Some(elapsed_ms);
        let filled = matches!(
            ticket.status,
            OrderStatus::Filled | OrderStatus::PartiallyFilled
        );

        self.latency
            .record(
                &ticket.id,
                &ticket.symbol,
                &ticket.broker,
                "submit",
                elapsed_ms,
                filled,
            )
            .await;
        self.circuit_breaker.record_latency(elapsed_ms).await;

        if let Some(fill_price) = ticket.fill_price.filter(|_| filled) {
            ticket.slippage_bps = self
                .slippage
                .record_actual(
                    &ticket.id,
                    &ticket.symbol,
                    ticket.side,
                    ticket.price,
                    fill_price,
                )
                .await;
        }

        self.dedup.record_sent(&ticket.symbol, fingerprint);
        self.orders.insert(ticket.id.clone(), ticket.clone());

        if filled {
            self.notify_fill(&ticket);
        }

        info!(
            order_id = %ticket.id,
            status = ?ticket.status,
            path = ?ticket.path,
            fill_price = %ticket.fill_price.unwrap_or_default(),
            filled_quantity = %ticket.filled_quantity,
            slippage_bps = ticket.slippage_bps.unwrap_or_default(),
            latency_ms = elapsed_ms,
            retries = ticket.retry_count,
            "order pipeline end"
        );
        ticket
    }

    fn finish_rejected(&self, ticket: OrderTicket) -> OrderTicket {
        warn!(
            order_id = %ticket.id,
            symbol = %ticket.symbol,
            reason = ticket.rejection_reason.as_deref().unwrap_or("unspecified"),
            "order rejected"
        );
        self.orders.insert(ticket.id.clone(), ticket.clone());
        self.notify_reject(&ticket);
        ticket
    }

    fn notify_fill(&self, ticket: &OrderTicket) {
        let callback = self
            .callbacks
            .read()
            .expect("callbacks lock poisoned")
            .on_fill
            .clone();
        if let Some(callback) = callback {
            if catch_unwind(AssertUnwindSafe(|| callback(ticket))).is_err() {
                error!(order_id = %ticket.id, "on_fill callback panicked");
            }
        }
    }

    fn notify_reject(&self, ticket: &OrderTicket) {
        let callback = self
            .callbacks
            .read()
            .expect("callbacks lock poisoned")
            .on_reject
            .clone();
        if let Some(callback) = callback {
            if catch_unwind(AssertUnwindSafe(|| callback(ticket))).is_err() {
                error!(order_id = %ticket.id, "on_reject callback panicked");
            }
        }
    }

    /// Cancel a ticket that has not completed. Only Pending and Submitted
    /// orders may cancel; partial fills must settle.
    pub fn cancel_order(&self, order_id: &str) -> bool {
        let Some(mut entry) = self.orders.get_mut(order_id) else {
            warn!(order_id, "cancel requested for unknown order");
            return false;
        };
        if !matches!(
            entry.status,
            OrderStatus::Pending | OrderStatus::Submitted
        ) {
            warn!(order_id, status = ?entry.status, "cancel refused");
            return false;
        }
        entry.mark_cancelled();
        info!(order_id, "order cancelled");
        true
    }

    pub fn order(&self, order_id: &str) -> Option<OrderTicket> {
        self.orders.get(order_id).map(|entry| entry.clone())
    }

    pub fn orders(&self) -> Vec<OrderTicket> {
        self.orders.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn open_order_count(&self) -> usize {
        self.orders
            .iter()
            .filter(|entry| entry.status.is_active())
            .count()
    }

    /// Positions are maintained by the caller after it observes fills;
    /// the router only reads them for risk checks.
    pub fn update_position(&self, symbol: impl Into<String>, snapshot: PositionSnapshot) {
        self.positions.insert(symbol.into(), snapshot);
    }

    pub fn remove_position(&self, symbol: &str) {
        self.positions.remove(symbol);
    }

    pub fn positions(&self) -> Vec<PositionSnapshot> {
        self.positions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub async fn get_execution_stats(&self) -> ExecutionStats {
        let tickets = self.orders();
        let total_orders = tickets.len();
        let mut filled = 0;
        let mut partially_filled = 0;
        let mut rejected = 0;
        let mut failed = 0;
        let mut cancelled = 0;
        let mut open = 0;
        let mut slippage_sum = 0.0;
        let mut slippage_count = 0usize;
        let mut latency_sum = 0.0;
        let mut latency_count = 0usize;

        for ticket in &tickets {
            match ticket.status {
                OrderStatus::Filled => filled += 1,
                OrderStatus::PartiallyFilled => partially_filled += 1,
                OrderStatus::Rejected => rejected += 1,
                OrderStatus::Failed => failed += 1,
                OrderStatus::Cancelled => cancelled += 1,
                OrderStatus::Pending | OrderStatus::Submitted => open += 1,
            }
            if matches!(
                ticket.status,
                OrderStatus::Filled | OrderStatus::PartiallyFilled
            ) {
                if let Some(bps) = ticket.slippage_bps {
                    slippage_sum += bps;
                    slippage_count += 1;
                }
                if let Some(ms) = ticket.latency_ms {
                    latency_sum += ms as f64;
                    latency_count += 1;
                }
            }
        }

        ExecutionStats {
            total_orders,
            filled,
            partially_filled,
            rejected,
            failed,
            cancelled,
            open,
            fill_rate_pct: filled as f64 / total_orders.max(1) as f64 * 100.0,
            avg_slippage_bps: slippage_sum / slippage_count.max(1) as f64,
            avg_latency_ms: latency_sum / latency_count.max(1) as f64,
            mode: self.mode.mode(),
            circuit_breaker: self.circuit_breaker.status().await,
            drawdown: self.drawdown.status().await,
            slippage: self.slippage.stats().await,
            latency: self.latency.stats().await,
            dedup: self.dedup.stats(),
        }
    }
}

fn instruction_for(ticket: &OrderTicket) -> OrderInstruction {
    OrderInstruction {
        symbol: ticket.symbol.clone(),
        side: ticket.side,
        kind: ticket.kind,
        quantity: ticket.quantity,
        price: ticket.price,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerAck;
    use crate::config::PipelineConfig;
    use crate::domain::OrderSide;
    use crate::error::BrokerError;
    use crate::execution::dedup::DedupConfig;
    use crate::execution::retry::RetryPolicy;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingConnector {
        calls: AtomicU32,
    }

    impl CountingConnector {
        fn new() -> Self {
            Self {
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl BrokerConnector for CountingConnector {
        async fn create_order(
            &self,
            instruction: &OrderInstruction,
        ) -> std::result::Result<BrokerAck, BrokerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(BrokerAck {
                broker_order_id: "live-1".to_string(),
                price: instruction.price,
                filled_quantity: instruction.quantity,
            })
        }
    }

    fn fast_config() -> PipelineConfig {
        PipelineConfig {
            paper: crate::broker::PaperConfig::instant(),
            dedup: DedupConfig {
                cooldown_secs: 0,
                ..DedupConfig::default()
            },
            retry: RetryPolicy {
                max_attempts: 2,
                initial_delay_ms: 1,
                max_delay_ms: 2,
                jitter: 0.0,
                ..RetryPolicy::default()
            },
            ..PipelineConfig::default()
        }
    }

    fn buy_request(quantity: Decimal) -> OrderRequest {
        OrderRequest::market("BTC/USDT", OrderSide::Buy, quantity, dec!(50000))
            .with_balance(dec!(100000))
    }

    #[tokio::test]
    async fn paper_order_fills_cleanly() {
        let router = OrderRouter::new(fast_config());
        let ticket = router.submit_order(buy_request(dec!(0.1))).await;

        assert_eq!(ticket.status, OrderStatus::Filled);
        assert_eq!(ticket.path, Some(ExecutionPath::Simulated));
        assert_eq!(ticket.fill_price, Some(dec!(50000)));
        assert_eq!(ticket.filled_quantity, dec!(0.1));
        assert!(ticket.fingerprint.is_some());
        assert!(ticket.latency_ms.is_some());
        assert_eq!(router.orders().len(), 1);
        assert_eq!(router.open_order_count(), 0);
    }

    #[tokio::test]
    async fn open_breaker_rejects_without_execution() {
        let router = OrderRouter::new(fast_config());
        router.circuit_breaker().kill_switch("test halt").await;

        let ticket = router.submit_order(buy_request(dec!(0.1))).await;
        assert_eq!(ticket.status, OrderStatus::Rejected);
        assert!(ticket
            .rejection_reason
            .as_deref()
            .unwrap()
            .contains("circuit breaker"));
        assert!(ticket.path.is_none());
    }

    #[tokio::test]
    async fn identical_resubmission_is_rejected() {
        let router = OrderRouter::new(fast_config());

        let first = router.submit_order(buy_request(dec!(0.1))).await;
        assert_eq!(first.status, OrderStatus::Filled);

        let second = router.submit_order(buy_request(dec!(0.1))).await;
        assert_eq!(second.status, OrderStatus::Rejected);
        assert!(second
            .rejection_reason
            .as_deref()
            .unwrap()
            .contains("duplicate"));
    }

    #[tokio::test]
    async fn missing_connector_fails_not_rejects() {
        let router = OrderRouter::new(fast_config());
        let ticket = router
            .submit_order(buy_request(dec!(0.1)).with_broker("ghost"))
            .await;

        assert_eq!(ticket.status, OrderStatus::Failed);
        assert!(ticket.error.as_deref().unwrap().contains("connector"));
        assert!(ticket.rejection_reason.is_none());
    }

    #[tokio::test]
    async fn unarmed_live_order_demotes_to_simulation() {
        let router = OrderRouter::new(fast_config());
        let connector = Arc::new(CountingConnector::new());
        router.register_connector("binance", connector.clone()).await;

        let ticket = router
            .submit_order(buy_request(dec!(0.1)).with_broker("binance"))
            .await;

        assert_eq!(ticket.status, OrderStatus::Filled);
        assert_eq!(ticket.path, Some(ExecutionPath::Simulated));
        assert_eq!(connector.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_applies_to_active_orders_only() {
        let router = OrderRouter::new(fast_config());

        let filled = router.submit_order(buy_request(dec!(0.1))).await;
        assert!(!router.cancel_order(&filled.id));
        assert!(!router.cancel_order("no-such-order"));

        // A ticket parked before execution is cancellable.
        let parked = OrderTicket::from_request(&buy_request(dec!(0.2)));
        let parked_id = parked.id.clone();
        router.orders.insert(parked_id.clone(), parked);
        assert!(router.cancel_order(&parked_id));
        assert_eq!(
            router.order(&parked_id).unwrap().status,
            OrderStatus::Cancelled
        );
        assert!(!router.cancel_order(&parked_id));
    }

    #[tokio::test]
    async fn stats_aggregate_component_snapshots() {
        let router = OrderRouter::new(fast_config());
        router.submit_order(buy_request(dec!(0.1))).await;
        router.circuit_breaker().kill_switch("halt").await;
        router.submit_order(buy_request(dec!(0.2))).await;

        let stats = router.get_execution_stats().await;
        assert_eq!(stats.total_orders, 2);
        assert_eq!(stats.filled, 1);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.fill_rate_pct, 50.0);
        assert_eq!(stats.circuit_breaker.state, crate::risk::CircuitState::Locked);
        assert_eq!(stats.dedup.checks, 1);
    }
}
