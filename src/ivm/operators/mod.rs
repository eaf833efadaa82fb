//! Operator implementations.
//!
//! Each operator implements both directions of the push/fetch contract in
//! [`crate::ivm`]. The leaves are source connections; the root is the
//! terminus that materialises the result view.

pub mod fan;
pub mod filter;
pub mod join;
pub mod take;
pub mod terminus;

#[cfg(test)]
pub mod test_helpers;
