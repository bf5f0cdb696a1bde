pub mod feed;
pub mod gateway;
pub mod ledger;
pub mod order;
pub mod paper;
pub mod rate_limiter;
pub mod retry;
pub mod sleeper;

#[cfg(test)]
mod tests;

pub use feed::{FeedConfig, FeedHealth, MarketDataSupervisor};
pub use gateway::{
    ExecutionGateway, ExecutionReport, FillEvent, GatewayConfig, GatewayContext, GatewayError,
    GatewayEvent, GatewayHandle,
};
pub use ledger::IdempotencyLedger;
pub use order::{OrderEvent, OrderState, RejectReason, TransitionError};
pub use paper::{PaperBroker, PaperFillMode, SubmitScript};
pub use rate_limiter::{AdaptiveRateLimiter, RateLimitConfig};
pub use retry::RetryPolicy;
pub use sleeper::{RecordingSleeper, Sleeper, TokioSleeper};
