use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use broker_trait::{BrokerClient, BrokerError, BrokerOrderStatus, ErrorClass, OrderAck, OrderReport};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use risk_manager::{CallOutcome, CircuitBreaker, GuardError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use trading_core::{
    ApprovedOrder, Clock, ConfigError, CoreEvent, CorrelationId, EventSink, Fill, OrderPurpose,
    Shutdown, Side,
};

use crate::feed::FeedHealth;
use crate::ledger::IdempotencyLedger;
use crate::order::{OrderEvent, OrderState, RejectReason};
use crate::rate_limiter::AdaptiveRateLimiter;
use crate::retry::RetryPolicy;
use crate::sleeper::Sleeper;

/// Quantities closer than this are treated as equal
const QTY_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Per broker call; enforced inside the broker client
    pub attempt_timeout: Duration,
    /// Delays before each status poll after acknowledgement
    pub fill_poll_delays: Vec<Duration>,
    pub retry: RetryPolicy,
    pub queue_capacity: usize,
    pub ledger_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_millis(500),
            fill_poll_delays: [250, 500, 1000, 2000, 4000]
                .into_iter()
                .map(Duration::from_millis)
                .collect(),
            retry: RetryPolicy::order_submission(),
            queue_capacity: 256,
            ledger_capacity: IdempotencyLedger::DEFAULT_CAPACITY,
        }
    }
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.attempt_timeout.is_zero() {
            return Err(ConfigError::invalid("attempt_timeout_ms", "must be positive"));
        }
        if self.fill_poll_delays.is_empty() {
            return Err(ConfigError::invalid("fill_poll_delays", "at least one poll is required"));
        }
        if self.retry.max_attempts.is_none() {
            return Err(ConfigError::invalid(
                "retry_max_attempts",
                "order submission retries must be bounded",
            ));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::invalid("queue_capacity", "must be positive"));
        }
        self.retry.validate()
    }
}

/// One incremental execution, in broker-report order.
#[derive(Debug, Clone, PartialEq)]
pub struct FillEvent {
    pub fill: Fill,
    pub broker_order_id: String,
    /// Total filled so far, this fill included
    pub cumulative_qty: f64,
}

/// Terminal outcome of one approved order.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub correlation_id: CorrelationId,
    pub symbol: String,
    pub side: Side,
    pub purpose: OrderPurpose,
    pub state: OrderState,
    /// Submission attempts made (0 if the broker was never called)
    pub attempts: u32,
    /// Answered from the idempotency ledger without touching the broker
    pub replayed: bool,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionReport {
    pub fn is_filled(&self) -> bool {
        matches!(self.state, OrderState::Filled { .. })
    }

    pub fn filled_qty(&self) -> f64 {
        self.state.filled_qty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    Fill(FillEvent),
    Report(ExecutionReport),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("execution gateway is shut down")]
    Closed,
}

/// Shared collaborators of the gateway worker.
pub struct GatewayContext {
    pub limiter: Arc<AdaptiveRateLimiter>,
    pub breaker: CircuitBreaker,
    pub feed: FeedHealth,
    pub clock: Arc<dyn Clock>,
    pub sleeper: Arc<dyn Sleeper>,
    pub events: Arc<dyn EventSink>,
}

type CancelFlags = Arc<DashMap<CorrelationId, Arc<AtomicBool>>>;

/// Cloneable front door to the gateway worker.
#[derive(Clone)]
pub struct GatewayHandle {
    tx: mpsc::Sender<ApprovedOrder>,
    cancel_flags: CancelFlags,
}

impl GatewayHandle {
    /// Queue an approved order for execution.
    pub async fn submit(&self, order: ApprovedOrder) -> Result<(), GatewayError> {
        let id = order.correlation_id;
        self.cancel_flags
            .entry(id)
            .or_insert_with(|| Arc::new(AtomicBool::new(false)));
        self.tx.send(order).await.map_err(|_| {
            self.cancel_flags.remove(&id);
            GatewayError::Closed
        })
    }

    /// Ask the worker to stop working on an order. Takes effect before the next
    /// broker attempt or poll; a call already in flight runs to completion.
    pub fn cancel(&self, correlation_id: &CorrelationId) -> bool {
        match self.cancel_flags.get(correlation_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Orders queued or executing
    pub fn outstanding(&self) -> usize {
        self.cancel_flags.len()
    }
}

/// Dedicated worker that owns the broker client. Orders run one at a time.
pub struct ExecutionGateway {
    broker: Arc<dyn BrokerClient>,
    config: GatewayConfig,
    ctx: GatewayContext,
    ledger: IdempotencyLedger,
    cancel_flags: CancelFlags,
    tx: mpsc::Sender<ApprovedOrder>,
    rx: Option<mpsc::Receiver<ApprovedOrder>>,
    out: mpsc::UnboundedSender<GatewayEvent>,
}

impl ExecutionGateway {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        config: GatewayConfig,
        ctx: GatewayContext,
    ) -> (Self, mpsc::UnboundedReceiver<GatewayEvent>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (out, out_rx) = mpsc::unbounded_channel();
        let ledger = IdempotencyLedger::new(config.ledger_capacity);
        let gateway = Self {
            broker,
            config,
            ctx,
            ledger,
            cancel_flags: Arc::new(DashMap::new()),
            tx,
            rx: Some(rx),
            out,
        };
        (gateway, out_rx)
    }

    pub fn handle(&self) -> GatewayHandle {
        GatewayHandle {
            tx: self.tx.clone(),
            cancel_flags: Arc::clone(&self.cancel_flags),
        }
    }

    pub fn ledger(&self) -> &IdempotencyLedger {
        &self.ledger
    }

    /// Run the worker loop on its own task until shutdown or until every handle is dropped.
    pub fn spawn(mut self, mut shutdown: Shutdown) -> JoinHandle<()> {
        tokio::spawn(async move {
            let Some(mut rx) = self.rx.take() else {
                return;
            };
            // Only handles keep the queue open
            let (closed_tx, _) = mpsc::channel(1);
            self.tx = closed_tx;

            tracing::info!("Execution gateway started ({})", self.broker.broker_name());
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.wait() => break,
                    next = rx.recv() => match next {
                        Some(order) => {
                            self.execute(order).await;
                        }
                        None => break,
                    },
                }
            }
            tracing::info!("Execution gateway stopped");
        })
    }

    /// Execute one approved order to a terminal state.
    pub async fn execute(&mut self, order: ApprovedOrder) -> ExecutionReport {
        let id = order.correlation_id;

        if let Some(previous) = self.ledger.get(&id) {
            let mut report = previous.clone();
            report.replayed = true;
            tracing::info!(
                "Order {} already {}, returning recorded outcome",
                id,
                report.state.name()
            );
            self.cancel_flags.remove(&id);
            let _ = self.out.send(GatewayEvent::Report(report.clone()));
            return report;
        }
        self.ledger.begin(id);

        let (state, attempts) = self.run_order(&order).await;

        let report = ExecutionReport {
            correlation_id: id,
            symbol: order.symbol.clone(),
            side: order.side,
            purpose: order.purpose,
            state,
            attempts,
            replayed: false,
            finished_at: self.ctx.clock.now(),
        };
        self.finish(&report);
        self.ledger.record(report.clone());
        self.cancel_flags.remove(&id);
        let _ = self.out.send(GatewayEvent::Report(report.clone()));
        report
    }

    async fn run_order(&mut self, order: &ApprovedOrder) -> (OrderState, u32) {
        let state = OrderState::Pending;

        if self.ctx.feed.is_halted(self.ctx.clock.now()) {
            tracing::error!(
                "Refusing {} {} {}: market data is stale",
                order.side,
                order.quantity,
                order.symbol
            );
            return (advance(state, OrderEvent::Rejected(RejectReason::MarketDataStale)), 0);
        }

        let (submitted, attempts) = self.submit_with_retry(order).await;
        let ack = match submitted {
            Ok(ack) => ack,
            Err(reason) => {
                let event = match reason {
                    RejectReason::CancelledByCaller => OrderEvent::Cancelled(reason),
                    reason => OrderEvent::Rejected(reason),
                };
                return (advance(state, event), attempts);
            }
        };

        tracing::info!(
            "Order {} submitted to {} as {} after {} attempt(s)",
            order.correlation_id,
            self.broker.broker_name(),
            ack.broker_order_id,
            attempts
        );
        self.ctx.events.emit(CoreEvent::OrderSubmitted {
            symbol: order.symbol.clone(),
            correlation_id: order.correlation_id,
            broker_order_id: ack.broker_order_id.clone(),
            attempts,
            at: self.ctx.clock.now(),
        });

        let state = advance(
            state,
            OrderEvent::Acknowledged {
                broker_order_id: ack.broker_order_id.clone(),
            },
        );
        (self.track_fills(order, &ack.broker_order_id, state).await, attempts)
    }

    /// Submit through limiter, breaker and retry policy.
    async fn submit_with_retry(&self, order: &ApprovedOrder) -> (Result<OrderAck, RejectReason>, u32) {
        let broker = Arc::clone(&self.broker);
        let mut attempt: u32 = 0;
        // Set once any attempt timed out: a copy may exist at the broker from then on
        let mut in_doubt = false;

        loop {
            if in_doubt {
                match self.lookup_in_doubt(order).await {
                    Ok(Some(report)) => return (Ok(self.landed(order, &report)), attempt),
                    Ok(None) => {}
                    Err(reason) => return (Err(reason), attempt),
                }
            }

            if self.cancel_requested(&order.correlation_id) {
                tracing::info!("Order {} cancelled before attempt {}", order.correlation_id, attempt + 1);
                return (Err(RejectReason::CancelledByCaller), attempt);
            }

            attempt += 1;
            let result = self.broker_call(|| broker.submit_order(order)).await;

            let error = match result {
                Ok(ack) => return (Ok(ack), attempt),
                Err(GuardError::Open(open)) => {
                    tracing::warn!("Order {} not sent: {}", order.correlation_id, open);
                    return (Err(RejectReason::CircuitOpen(open)), attempt - 1);
                }
                Err(GuardError::Call(error)) => error,
            };

            if error.class() == ErrorClass::Terminal {
                // A rejection after a timeout may be the broker refusing a reused client id
                if in_doubt {
                    match self.lookup_in_doubt(order).await {
                        Ok(Some(report)) => return (Ok(self.landed(order, &report)), attempt),
                        Ok(None) => {}
                        Err(reason) => return (Err(reason), attempt),
                    }
                }
                tracing::warn!(
                    "Order {} rejected by {}: {}",
                    order.correlation_id,
                    self.broker.broker_name(),
                    error
                );
                return (Err(RejectReason::Broker(error)), attempt);
            }

            if matches!(error, BrokerError::Timeout { .. }) {
                in_doubt = true;
            }

            match self.config.retry.next_delay(attempt, &error) {
                Some(delay) => {
                    tracing::warn!(
                        "Order {} attempt {} failed ({}), retrying in {}ms",
                        order.correlation_id,
                        attempt,
                        error,
                        delay.as_millis()
                    );
                    self.ctx.sleeper.sleep(delay).await;
                }
                None => {
                    if in_doubt {
                        match self.lookup_in_doubt(order).await {
                            Ok(Some(report)) => return (Ok(self.landed(order, &report)), attempt),
                            Ok(None) => {}
                            Err(reason) => return (Err(reason), attempt),
                        }
                    }
                    tracing::error!(
                        "Order {} failed after {} attempts: {}",
                        order.correlation_id,
                        attempt,
                        error
                    );
                    return (
                        Err(RejectReason::RetriesExhausted {
                            last: error,
                            attempts: attempt,
                        }),
                        attempt,
                    );
                }
            }
        }
    }

    /// Find an order whose submission timed out. A failed lookup is retried on the
    /// retry policy and never answered with a second submission.
    async fn lookup_in_doubt(&self, order: &ApprovedOrder) -> Result<Option<OrderReport>, RejectReason> {
        let broker = Arc::clone(&self.broker);
        let mut lookups: u32 = 0;

        loop {
            lookups += 1;
            let delay = match self
                .broker_call(|| broker.find_order(&order.correlation_id))
                .await
            {
                Ok(found) => return Ok(found),
                Err(GuardError::Open(open)) => {
                    if !self.config.retry.allows_another(lookups) {
                        tracing::error!(
                            "Order {} outcome unknown, breaker still open: {}",
                            order.correlation_id,
                            open
                        );
                        return Err(RejectReason::CircuitOpen(open));
                    }
                    open.retry_in
                }
                Err(GuardError::Call(error)) => match self.config.retry.next_delay(lookups, &error) {
                    Some(delay) => {
                        tracing::warn!(
                            "Lookup {} of timed-out order {} failed ({}), retrying in {}ms",
                            lookups,
                            order.correlation_id,
                            error,
                            delay.as_millis()
                        );
                        delay
                    }
                    None => {
                        tracing::error!(
                            "Order {} outcome unknown after {} lookups: {}",
                            order.correlation_id,
                            lookups,
                            error
                        );
                        return Err(RejectReason::RetriesExhausted {
                            last: error,
                            attempts: lookups,
                        });
                    }
                },
            };
            self.ctx.sleeper.sleep(delay).await;
        }
    }

    fn landed(&self, order: &ApprovedOrder, report: &OrderReport) -> OrderAck {
        tracing::warn!(
            "Order {} landed despite timeout (broker id {})",
            order.correlation_id,
            report.broker_order_id
        );
        ack_from_report(report, self.ctx.clock.now())
    }

    /// Poll the order until terminal; cancel whatever is left after the last poll.
    async fn track_fills(
        &self,
        order: &ApprovedOrder,
        broker_order_id: &str,
        mut state: OrderState,
    ) -> OrderState {
        let broker = Arc::clone(&self.broker);
        let mut cancelled_by_caller = false;

        for (i, delay) in self.config.fill_poll_delays.iter().enumerate() {
            if self.cancel_requested(&order.correlation_id) {
                cancelled_by_caller = true;
                break;
            }
            self.ctx.sleeper.sleep(*delay).await;

            match self.broker_call(|| broker.get_order(broker_order_id)).await {
                Ok(report) => {
                    state = self.absorb(order, &report, state, RejectReason::NotFilled);
                    if state.is_terminal() {
                        return state;
                    }
                    tracing::info!(
                        "Order {} {} ({}/{} filled, poll {}/{})",
                        broker_order_id,
                        state.name(),
                        state.filled_qty(),
                        order.quantity,
                        i + 1,
                        self.config.fill_poll_delays.len()
                    );
                }
                Err(e) => tracing::warn!("Status poll for {} failed: {}", broker_order_id, e),
            }
        }

        let reason = if cancelled_by_caller {
            RejectReason::CancelledByCaller
        } else {
            RejectReason::NotFilled
        };

        if let Err(e) = self.broker_call(|| broker.cancel_order(broker_order_id)).await {
            tracing::warn!("Cancel of {} failed: {}", broker_order_id, e);
        }
        // Fills can race the cancel
        if let Ok(report) = self.broker_call(|| broker.get_order(broker_order_id)).await {
            state = self.absorb(order, &report, state, reason.clone());
        }
        if state.is_terminal() {
            return state;
        }
        advance(state, OrderEvent::Cancelled(reason))
    }

    /// Fold a broker report into the order state, emitting any new fill.
    fn absorb(
        &self,
        order: &ApprovedOrder,
        report: &OrderReport,
        state: OrderState,
        cancel_reason: RejectReason,
    ) -> OrderState {
        let mut state = state;
        let prev_qty = state.filled_qty();

        if report.filled_qty > prev_qty + QTY_EPSILON {
            let cumulative_avg = report.filled_avg_price.unwrap_or(order.reference_price);
            let delta = report.filled_qty - prev_qty;
            let price = match state.avg_price() {
                Some(prev_avg) if prev_qty > 0.0 => {
                    let p = (cumulative_avg * report.filled_qty - prev_avg * prev_qty) / delta;
                    if p.is_finite() && p > 0.0 {
                        p
                    } else {
                        cumulative_avg
                    }
                }
                _ => cumulative_avg,
            };
            self.emit_fill(order, &report.broker_order_id, delta, price, report.filled_qty);

            let complete = report.status == BrokerOrderStatus::Filled
                || report.filled_qty + QTY_EPSILON >= order.quantity;
            state = advance(
                state,
                OrderEvent::Fill {
                    cumulative_qty: report.filled_qty,
                    avg_price: cumulative_avg,
                    complete,
                },
            );
        }

        match report.status {
            BrokerOrderStatus::Filled if !state.is_terminal() => {
                let avg = state.avg_price().unwrap_or(order.reference_price);
                let qty = state.filled_qty();
                advance(
                    state,
                    OrderEvent::Fill {
                        cumulative_qty: qty,
                        avg_price: avg,
                        complete: true,
                    },
                )
            }
            BrokerOrderStatus::Canceled | BrokerOrderStatus::Expired if !state.is_terminal() => {
                advance(state, OrderEvent::Cancelled(cancel_reason))
            }
            BrokerOrderStatus::Rejected if !state.is_terminal() => {
                let message = report
                    .reject_reason
                    .clone()
                    .unwrap_or_else(|| "rejected after acknowledgement".to_string());
                advance(
                    state,
                    OrderEvent::Rejected(RejectReason::Broker(BrokerError::Rejected(message))),
                )
            }
            _ => state,
        }
    }

    fn emit_fill(
        &self,
        order: &ApprovedOrder,
        broker_order_id: &str,
        quantity: f64,
        price: f64,
        cumulative_qty: f64,
    ) {
        let now = self.ctx.clock.now();
        tracing::info!(
            "Fill: {} {} {} @ {:.2} (order {}, {}/{})",
            order.side,
            quantity,
            order.symbol,
            price,
            broker_order_id,
            cumulative_qty,
            order.quantity
        );

        let fill = Fill {
            symbol: order.symbol.clone(),
            side: order.side,
            quantity,
            price,
            correlation_id: order.correlation_id,
            purpose: order.purpose,
            filled_at: now,
        };
        self.ctx.events.emit(CoreEvent::OrderFilled {
            symbol: fill.symbol.clone(),
            correlation_id: fill.correlation_id,
            side: fill.side,
            quantity,
            price,
            at: now,
        });
        let _ = self.out.send(GatewayEvent::Fill(FillEvent {
            fill,
            broker_order_id: broker_order_id.to_string(),
            cumulative_qty,
        }));
    }

    fn finish(&self, report: &ExecutionReport) {
        let detail = report.state.reject_reason().map(|r| r.to_string());
        match &report.state {
            OrderState::Filled { avg_price, filled_qty, .. } => tracing::info!(
                "Order {} filled: {} {} @ {:.2}",
                report.correlation_id,
                filled_qty,
                report.symbol,
                avg_price
            ),
            state => tracing::warn!(
                "Order {} for {} ended {}: {}",
                report.correlation_id,
                report.symbol,
                state.name(),
                detail.as_deref().unwrap_or("no detail")
            ),
        }
        self.ctx.events.emit(CoreEvent::OrderTerminal {
            symbol: report.symbol.clone(),
            correlation_id: report.correlation_id,
            state: report.state.name().to_string(),
            detail,
            at: report.finished_at,
        });
    }

    /// Rate-limit, then run one broker call through the breaker.
    async fn broker_call<T, F, Fut>(&self, op: F) -> Result<T, GuardError<BrokerError>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, BrokerError>>,
    {
        self.ctx.limiter.acquire().await;
        let result = self.ctx.breaker.guard(op, classify).await;
        match &result {
            Err(GuardError::Call(e)) if e.class() == ErrorClass::RateLimited => {
                self.ctx.limiter.on_throttled()
            }
            Err(GuardError::Open(_)) => {}
            _ => self.ctx.limiter.on_success(),
        }
        result
    }

    fn cancel_requested(&self, id: &CorrelationId) -> bool {
        self.cancel_flags
            .get(id)
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

/// Business rejections mean the broker is healthy.
fn classify<T>(result: &Result<T, BrokerError>) -> CallOutcome {
    match result {
        Ok(_) => CallOutcome::Success,
        Err(e) => match e.class() {
            ErrorClass::Transient => CallOutcome::Failure,
            ErrorClass::RateLimited => CallOutcome::Neutral,
            ErrorClass::Terminal => CallOutcome::Success,
        },
    }
}

fn ack_from_report(report: &OrderReport, at: DateTime<Utc>) -> OrderAck {
    OrderAck {
        broker_order_id: report.broker_order_id.clone(),
        client_order_id: report.client_order_id,
        status: report.status,
        submitted_at: at,
    }
}

/// Apply an event; an illegal transition is logged and leaves the state unchanged.
fn advance(state: OrderState, event: OrderEvent) -> OrderState {
    match state.clone().apply(event) {
        Ok(next) => next,
        Err(e) => {
            tracing::error!("{}", e);
            state
        }
    }
}
