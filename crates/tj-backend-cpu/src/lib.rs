//! Host backend for tracejit.
//!
//! Exposes a configurable number of logical devices and runs compiled
//! computations with the reference interpreter. Always available.

#![forbid(unsafe_code)]

mod executable;
mod executor;

pub use executable::CpuExecutable;
pub use executor::CpuBackend;
