//! Deterministic, pure logic shared by the control plane.
//!
//! Core modules must be free of I/O side effects. Anything time-dependent
//! takes `now` as an argument so tests can pin it.

pub mod block_log;
pub mod graph;
pub mod render;
pub mod review;
pub mod schedule;
pub mod states;
pub mod types;
pub mod validate;
pub mod watch;
