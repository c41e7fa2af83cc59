//! Core abstractions shared by every layer of reliefops.

pub mod error;
pub mod status;

pub use error::{ErrorContext, ReliefError, ReliefResult};

/// Compare two strings without short-circuiting on the first mismatch.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
