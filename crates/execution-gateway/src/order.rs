use broker_trait::BrokerError;
use serde::Serialize;
use thiserror::Error;
use trading_core::CircuitOpenError;

/// Why an order ended without (fully) filling.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RejectReason {
    #[error("broker rejected: {0}")]
    Broker(BrokerError),

    #[error("{0}")]
    CircuitOpen(CircuitOpenError),

    #[error("market data is stale, new orders are halted")]
    MarketDataStale,

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { last: BrokerError, attempts: u32 },

    #[error("not filled within the polling window")]
    NotFilled,

    #[error("cancelled by caller")]
    CancelledByCaller,
}

/// Lifecycle of one approved order at the gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderState {
    Pending,
    Submitted {
        broker_order_id: String,
    },
    PartiallyFilled {
        broker_order_id: String,
        filled_qty: f64,
        avg_price: f64,
    },
    Filled {
        broker_order_id: String,
        filled_qty: f64,
        avg_price: f64,
    },
    Rejected {
        reason: RejectReason,
    },
    Cancelled {
        broker_order_id: Option<String>,
        filled_qty: f64,
        reason: RejectReason,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrderEvent {
    Acknowledged { broker_order_id: String },
    /// Cumulative fill as reported by the broker
    Fill {
        cumulative_qty: f64,
        avg_price: f64,
        complete: bool,
    },
    Rejected(RejectReason),
    Cancelled(RejectReason),
}

#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[error("illegal order transition: {event} while {from}")]
pub struct TransitionError {
    pub from: &'static str,
    pub event: &'static str,
}

impl OrderEvent {
    fn name(&self) -> &'static str {
        match self {
            OrderEvent::Acknowledged { .. } => "acknowledged",
            OrderEvent::Fill { .. } => "fill",
            OrderEvent::Rejected(_) => "rejected",
            OrderEvent::Cancelled(_) => "cancelled",
        }
    }
}

impl OrderState {
    pub fn name(&self) -> &'static str {
        match self {
            OrderState::Pending => "pending",
            OrderState::Submitted { .. } => "submitted",
            OrderState::PartiallyFilled { .. } => "partially_filled",
            OrderState::Filled { .. } => "filled",
            OrderState::Rejected { .. } => "rejected",
            OrderState::Cancelled { .. } => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Filled { .. } | OrderState::Rejected { .. } | OrderState::Cancelled { .. }
        )
    }

    pub fn broker_order_id(&self) -> Option<&str> {
        match self {
            OrderState::Submitted { broker_order_id }
            | OrderState::PartiallyFilled { broker_order_id, .. }
            | OrderState::Filled { broker_order_id, .. } => Some(broker_order_id),
            OrderState::Cancelled { broker_order_id, .. } => broker_order_id.as_deref(),
            _ => None,
        }
    }

    pub fn filled_qty(&self) -> f64 {
        match self {
            OrderState::PartiallyFilled { filled_qty, .. }
            | OrderState::Filled { filled_qty, .. }
            | OrderState::Cancelled { filled_qty, .. } => *filled_qty,
            _ => 0.0,
        }
    }

    pub fn avg_price(&self) -> Option<f64> {
        match self {
            OrderState::PartiallyFilled { avg_price, .. } | OrderState::Filled { avg_price, .. } => {
                Some(*avg_price)
            }
            _ => None,
        }
    }

    pub fn reject_reason(&self) -> Option<&RejectReason> {
        match self {
            OrderState::Rejected { reason } | OrderState::Cancelled { reason, .. } => Some(reason),
            _ => None,
        }
    }

    /// The single transition function. Terminal states accept nothing.
    pub fn apply(self, event: OrderEvent) -> Result<OrderState, TransitionError> {
        let illegal = |from: &OrderState, event: &OrderEvent| TransitionError {
            from: from.name(),
            event: event.name(),
        };

        match (self, event) {
            (OrderState::Pending, OrderEvent::Acknowledged { broker_order_id }) => {
                Ok(OrderState::Submitted { broker_order_id })
            }
            (OrderState::Pending, OrderEvent::Rejected(reason)) => Ok(OrderState::Rejected { reason }),
            (OrderState::Pending, OrderEvent::Cancelled(reason)) => Ok(OrderState::Cancelled {
                broker_order_id: None,
                filled_qty: 0.0,
                reason,
            }),

            (
                OrderState::Submitted { broker_order_id }
                | OrderState::PartiallyFilled { broker_order_id, .. },
                OrderEvent::Fill {
                    cumulative_qty,
                    avg_price,
                    complete,
                },
            ) => Ok(if complete {
                OrderState::Filled {
                    broker_order_id,
                    filled_qty: cumulative_qty,
                    avg_price,
                }
            } else {
                OrderState::PartiallyFilled {
                    broker_order_id,
                    filled_qty: cumulative_qty,
                    avg_price,
                }
            }),

            (OrderState::Submitted { .. }, OrderEvent::Rejected(reason)) => {
                Ok(OrderState::Rejected { reason })
            }

            (state @ OrderState::Submitted { .. }, OrderEvent::Cancelled(reason))
            | (state @ OrderState::PartiallyFilled { .. }, OrderEvent::Cancelled(reason)) => {
                Ok(OrderState::Cancelled {
                    broker_order_id: state.broker_order_id().map(str::to_string),
                    filled_qty: state.filled_qty(),
                    reason,
                })
            }

            // A partial fill that the broker then rejects keeps what filled
            (state @ OrderState::PartiallyFilled { .. }, OrderEvent::Rejected(reason)) => {
                Ok(OrderState::Cancelled {
                    broker_order_id: state.broker_order_id().map(str::to_string),
                    filled_qty: state.filled_qty(),
                    reason,
                })
            }

            (state, event) => Err(illegal(&state, &event)),
        }
    }
}
