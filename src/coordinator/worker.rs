//! State-machine port
//!
//! A `Worker` executes the three 2PC steps against application data. Every
//! node of the cluster runs one; the runner calls it with the raw payload of
//! the log entry being coordinated.

use crate::common::{Context, Error, Result};
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;

#[async_trait]
pub trait Worker: Send + Sync {
    /// Validate and stage `data`. An error vetoes the write cluster-wide.
    async fn prepare(&self, ctx: &Context, data: &[u8]) -> Result<()>;

    /// Apply staged `data` and return the result payload.
    async fn commit(&self, ctx: &Context, data: &[u8]) -> Result<Vec<u8>>;

    /// Drop staged `data`. Also called on nodes whose prepare failed.
    async fn rollback(&self, ctx: &Context, data: &[u8]) -> Result<()>;
}

/// 2PC phase names as carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Prepare,
    Commit,
    Rollback,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Prepare => "prepare",
            Method::Commit => "commit",
            Method::Rollback => "rollback",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "prepare" => Ok(Method::Prepare),
            "commit" => Ok(Method::Commit),
            "rollback" => Ok(Method::Rollback),
            other => Err(Error::Other(format!("unknown method: {}", other))),
        }
    }
}
