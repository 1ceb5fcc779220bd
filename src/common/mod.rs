//! Common utilities and types shared across kayak

pub mod config;
pub mod context;
pub mod error;
pub mod hash;
pub mod node;
pub mod utils;

pub use config::Config;
pub use context::{Canceller, Context};
pub use error::{Error, ErrorKind, Result};
pub use hash::{Blake3Hasher, Hash};
pub use node::NodeId;
pub use utils::{crc32, parse_duration};
