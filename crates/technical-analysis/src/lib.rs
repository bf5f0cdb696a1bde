pub mod aggregator;
pub mod atr;
pub mod indicators;
pub mod snapshot;


pub use aggregator::*;
pub use atr::*;
pub use indicators::*;
pub use snapshot::*;
