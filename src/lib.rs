//! # netmeter
//!
//! A two-endpoint network throughput measurement tool.
//!
//! One endpoint runs as the server, the other as the client; together they
//! conduct a time- or byte-bounded transfer over one or more parallel TCP or
//! UDP data connections, report interval statistics while the test runs, and
//! exchange final per-stream summaries over the control channel.
//!
//! ## Example
//!
//! ```no_run
//! use netmeter::{Server, TestConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = Server::bind(TestConfig::server()).unwrap();
//!     server.run().await.unwrap();
//! }
//! ```

pub mod client;
pub mod config;
pub mod control;
pub mod diag;
pub mod error;
pub mod net;
pub mod protocol;
pub mod report;
pub mod server;
pub mod session;
pub mod stats;
pub mod stream;
pub mod timer;
pub mod units;

pub use client::TestReport;
pub use config::{Protocol, Role, TestConfig};
pub use error::{Error, Result};
pub use server::Server;
