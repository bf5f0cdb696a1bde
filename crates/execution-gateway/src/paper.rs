use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use broker_trait::{BrokerClient, BrokerError, BrokerOrderStatus, OrderAck, OrderReport};
use chrono::Utc;
use trading_core::{ApprovedOrder, CorrelationId};

/// How submitted orders fill.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PaperFillMode {
    /// Fill completely at the reference price on submission
    Immediate,
    /// Fill `fraction` of the quantity on submission, never the rest
    Partial { fraction: f64 },
    /// Fill completely on the n-th status poll
    AfterPolls(u32),
    /// Never fill
    Never,
}

/// Scripted outcome for the next submission.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitScript {
    Fail(BrokerError),
    /// The order lands at the broker but the caller sees a timeout
    AcceptThenTimeout,
}

#[derive(Debug, Default)]
struct PaperBook {
    orders: HashMap<String, OrderReport>,
    by_client: HashMap<CorrelationId, String>,
    polls: HashMap<String, u32>,
    reference_prices: HashMap<String, f64>,
    script: VecDeque<SubmitScript>,
    next_id: u64,
}

/// In-process broker for paper trading and tests.
#[derive(Debug)]
pub struct PaperBroker {
    book: Mutex<PaperBook>,
    fill_mode: PaperFillMode,
    submit_calls: AtomicU32,
}

impl PaperBroker {
    pub fn new() -> Self {
        Self::with_fill_mode(PaperFillMode::Immediate)
    }

    pub fn with_fill_mode(fill_mode: PaperFillMode) -> Self {
        Self {
            book: Mutex::new(PaperBook::default()),
            fill_mode,
            submit_calls: AtomicU32::new(0),
        }
    }

    /// Queue an outcome for an upcoming submission, in order.
    pub fn script(&self, outcome: SubmitScript) {
        self.lock().script.push_back(outcome);
    }

    pub fn submit_calls(&self) -> u32 {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn order(&self, broker_order_id: &str) -> Option<OrderReport> {
        self.lock().orders.get(broker_order_id).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PaperBook> {
        self.book.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for PaperBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerClient for PaperBroker {
    async fn submit_order(&self, order: &ApprovedOrder) -> Result<OrderAck, BrokerError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        let mut book = self.lock();

        let scripted = book.script.pop_front();
        if let Some(SubmitScript::Fail(err)) = scripted {
            return Err(err);
        }
        if book.by_client.contains_key(&order.correlation_id) {
            return Err(BrokerError::InvalidOrder(
                "client_order_id must be unique".to_string(),
            ));
        }

        book.next_id += 1;
        let broker_order_id = format!("paper-{}", book.next_id);
        let (status, filled_qty) = match self.fill_mode {
            PaperFillMode::Immediate => (BrokerOrderStatus::Filled, order.quantity),
            PaperFillMode::Partial { fraction } => (
                BrokerOrderStatus::PartiallyFilled,
                (order.quantity * fraction).floor(),
            ),
            PaperFillMode::AfterPolls(_) | PaperFillMode::Never => (BrokerOrderStatus::New, 0.0),
        };
        let now = Utc::now();
        let report = OrderReport {
            broker_order_id: broker_order_id.clone(),
            client_order_id: order.correlation_id,
            symbol: order.symbol.clone(),
            side: order.side,
            quantity: order.quantity,
            status,
            filled_qty,
            filled_avg_price: (filled_qty > 0.0).then_some(order.reference_price),
            updated_at: now,
            reject_reason: None,
        };
        book.orders.insert(broker_order_id.clone(), report);
        book.by_client
            .insert(order.correlation_id, broker_order_id.clone());
        book.reference_prices
            .insert(broker_order_id.clone(), order.reference_price);

        tracing::debug!("Paper order {} accepted for {}", broker_order_id, order.symbol);

        if scripted == Some(SubmitScript::AcceptThenTimeout) {
            return Err(BrokerError::Timeout {
                after: Duration::from_millis(500),
            });
        }

        Ok(OrderAck {
            broker_order_id,
            client_order_id: order.correlation_id,
            status,
            submitted_at: now,
        })
    }

    async fn get_order(&self, broker_order_id: &str) -> Result<OrderReport, BrokerError> {
        let mut guard = self.lock();
        let book = &mut *guard;
        let polls = book.polls.entry(broker_order_id.to_string()).or_insert(0);
        *polls += 1;
        let report = book
            .orders
            .get_mut(broker_order_id)
            .ok_or_else(|| BrokerError::NotFound(broker_order_id.to_string()))?;

        if let PaperFillMode::AfterPolls(n) = self.fill_mode {
            if *polls >= n && !report.status.is_terminal() {
                report.status = BrokerOrderStatus::Filled;
                report.filled_qty = report.quantity;
                report.filled_avg_price = book.reference_prices.get(broker_order_id).copied();
                report.updated_at = Utc::now();
            }
        }
        Ok(report.clone())
    }

    async fn find_order(
        &self,
        client_order_id: &CorrelationId,
    ) -> Result<Option<OrderReport>, BrokerError> {
        let book = self.lock();
        Ok(book
            .by_client
            .get(client_order_id)
            .and_then(|id| book.orders.get(id))
            .cloned())
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), BrokerError> {
        let mut book = self.lock();
        let report = book
            .orders
            .get_mut(broker_order_id)
            .ok_or_else(|| BrokerError::NotFound(broker_order_id.to_string()))?;
        if report.status.is_terminal() {
            return Err(BrokerError::InvalidOrder(format!(
                "order {} is already {:?}",
                broker_order_id, report.status
            )));
        }
        report.status = BrokerOrderStatus::Canceled;
        report.updated_at = Utc::now();
        Ok(())
    }

    fn is_paper(&self) -> bool {
        true
    }

    fn broker_name(&self) -> &str {
        "paper"
    }
}
