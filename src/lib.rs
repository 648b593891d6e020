//! perfrelay core library: profile a program with `perf` and forward the
//! per-symbol breakdown to a telemetry backend.

mod artifact;
mod config;
mod emit;
mod error;
mod interrupt;
mod profiler;
mod record;
mod report;
mod session;
mod telemetry;

pub use artifact::*;
pub use config::*;
pub use emit::*;
pub use error::*;
pub use interrupt::*;
pub use profiler::*;
pub use record::*;
pub use report::*;
pub use session::*;
pub use telemetry::*;
