//! Control plane for multi-agent mission pipelines.
//!
//! Tasks move through declarative state machines (`workflows.toml`). Each
//! agent wakes on a staggered heartbeat, picks up its work and advances it by
//! one stage; every advance is checked against ground truth before the state
//! changes. The crate keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (mission graph, validation,
//!   schedules, staleness rules). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (config, store, system of record,
//!   worker process, alerts). Isolated behind traits to enable fakes in tests.
//!
//! Orchestration modules ([`step`], [`heartbeat`], [`scheduler`],
//! [`watchdog`], [`monitor`], [`scope`]) combine the two, and [`control`]
//! wires them into the commands the binary exposes.

pub mod control;
pub mod core;
pub mod exit_codes;
pub mod heartbeat;
pub mod io;
pub mod logging;
pub mod monitor;
pub mod scheduler;
pub mod scope;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod watchdog;
