//! Side-effecting adapters used by the orchestration modules.
//!
//! Everything that talks to the filesystem, the network or a child process
//! lives here, behind a trait where tests need a fake.

pub mod actions;
pub mod alerts;
pub mod config;
pub mod github;
pub mod guards;
pub mod learning;
pub mod pr_check;
pub mod prompt;
pub mod store;
pub mod worker;
pub mod workflow;
