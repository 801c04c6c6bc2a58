//! Shared domain types.

mod ecosystem;

pub use ecosystem::Ecosystem;
