pub mod circuit_breaker;
pub mod limits;
pub mod manager;
pub mod stops;
pub mod store;
#[cfg(test)]
mod tests;

pub use circuit_breaker::{
    BreakerConfig, BreakerEvent, BreakerSnapshot, CallOutcome, CircuitBreaker, CircuitState,
    GuardError, Permit,
};
pub use limits::{PositionLimitGuard, ReturnHistory, RiskLimits, VarLimit};
pub use manager::{ExitPlan, RiskManager, RiskVerdict};
pub use stops::{
    ExitReason, ExitSignal, StopConfig, StopDefaults, StopError, StopKind, StopManager, StopState,
    WorkingExit,
};
pub use store::{FillEffect, PortfolioSnapshot, Position, PositionError, PositionStore};
