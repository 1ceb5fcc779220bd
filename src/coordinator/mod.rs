//! Write coordination with two-phase commit
//!
//! The coordinator is responsible for:
//! - Ordering writes into the log (leader only)
//! - Driving prepare/commit/rollback across every server
//! - Answering the leader as a participant (every node)
//! - Owning the node's store and accepted peer set

pub mod runner;
pub mod runtime;
pub mod worker;

pub use runner::{Applied, Runner, RunnerEnv, TwoPcRunner};
pub use runtime::{Runtime, RuntimeConfig, TwoPcConfig};
pub use worker::{Method, Worker};
