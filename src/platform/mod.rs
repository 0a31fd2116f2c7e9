//! Platform primitives for process supervision and descriptor handling.
//!
//! Only Unix is implemented; Linux additionally gets the parent death signal.

#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub use unix::*;
