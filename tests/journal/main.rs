//! Journal integration tests: lifecycle rules and value reference counts.

#[path = "../common/mod.rs"]
mod common;

mod lifecycle;
mod value_counters;
