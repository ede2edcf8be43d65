//! Synchronization primitives the refresh paths serialize through.

pub mod mutex;

pub use mutex::*;
