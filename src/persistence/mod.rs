//! Durable file persistence primitives.

pub mod atomic;
pub mod fsync;

pub use atomic::write_atomic;
