//! Accord node
//!
//! Runs the objectivity catch-up machinery against real peers:
//!
//! - [`storage`]: RocksDB backend for objectivity state, the saved local view
//!   and the node key
//! - [`wire`] / [`transport`] / [`server`]: newline-delimited JSON over TCP
//! - [`network`]: the local view's peer interactions over that wire
//! - [`majority`] / [`driver`]: majority sampling and the catch-up machines
//! - [`api`]: read-only HTTP status

pub mod api;
pub mod config;
pub mod driver;
pub mod error;
pub mod majority;
pub mod network;
pub mod node;
pub mod server;
pub mod storage;
pub mod transport;
pub mod wire;

pub use config::NodeConfig;
pub use error::{Error, Result};
pub use node::{AccordNode, NodeStore};
pub use storage::Storage;
