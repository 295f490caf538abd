pub mod logging;
pub use logging::*;

mod stopwatch;
pub use stopwatch::*;

// Re-export log crate so downstream crates can use base::log::*
pub use log;
