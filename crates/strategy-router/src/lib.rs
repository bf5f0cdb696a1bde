pub mod profile;
pub mod router;
pub mod signal;


pub use profile::*;
pub use router::*;
pub use signal::*;
