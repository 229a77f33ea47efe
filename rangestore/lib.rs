//! A distributed key/value store partitioned over a fixed group of ranks.
//!
//! Keys are mapped to slices of the keyspace and slices to the range servers
//! of an index. Every rank routes its own requests, a subset of the ranks
//! also serve them.
extern crate byteorder;
extern crate bytes;
extern crate commitlog;
extern crate fnv;
extern crate futures;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;
extern crate pin_project;
#[macro_use]
extern crate prometheus;
extern crate rand;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate thiserror;
extern crate tokio;
extern crate tokio_util;
extern crate toml;

pub mod config;
pub mod error;
mod flush;
pub mod index;
pub mod key;
mod manifest;
pub mod metrics;
pub mod partitioner;
pub mod protocol;
mod retry;
pub mod router;
pub mod server;
pub mod stats;
pub mod storage;
mod store;
pub mod transport;

#[cfg(test)]
mod tests;

pub use crate::config::{Config, Options};
pub use crate::error::{Error, ErrorCode, Result};
pub use crate::index::{Index, IndexKind};
pub use crate::key::KeyType;
pub use crate::protocol::GetOp;
pub use crate::router::{BulkGetResult, GetResult, Receipt, Router, SecondaryKeys};
pub use crate::store::Store;
