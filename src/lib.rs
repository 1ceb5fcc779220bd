//! # kayak
//!
//! Replicated writes for a fixed cluster of storage nodes:
//! - A signed peer set names the members and the single leader
//! - The leader orders every write into a durable log
//! - Two-phase commit (prepare, then commit or rollback) across every member
//! - Pluggable node-addressable transport (in-process or TCP)
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//!             apply(data)
//!                  │
//! ┌────────────────▼────────────────┐
//! │ Leader runtime                  │
//! │  log: append entry N            │
//! │  prepare N ──► every server     │
//! │  commit  N ──► every server     │
//! │  (rollback N on any failure)    │
//! └───────┬─────────────────┬───────┘
//!         │ transport       │
//! ┌───────▼──────┐   ┌──────▼───────┐
//! │ Follower 1   │   │ Follower 2   │
//! │  log + worker│   │  log + worker│
//! └──────────────┘   └──────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Sign a peer set
//! ```bash
//! kayak-node keygen --out ./operator.key
//! kayak-node sign-peers --key ./operator.key --input ./cluster.json --out ./peers.json
//! ```
//!
//! ### Start a node
//! ```bash
//! kayak-node serve --config ./leader.toml
//! ```

pub mod common;
pub mod coordinator;
pub mod peers;
pub mod storage;
pub mod transport;

// Re-export commonly used types
pub use common::{Config, Context, Error, NodeId, Result};
pub use coordinator::{Applied, Runtime, RuntimeConfig, TwoPcConfig, TwoPcRunner, Worker};
pub use peers::Peers;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
