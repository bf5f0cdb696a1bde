pub mod clock;
pub mod error;
pub mod events;
pub mod shutdown;
pub mod types;

pub use clock::*;
pub use error::*;
pub use events::*;
pub use shutdown::*;
pub use types::*;
