//! profiledb: a small record server with secondary indexes and stream
//! modules, a client library with scoped cursors, and the authenticate demo
//! that drives them end to end.
//!
//! The server side is [`engine::Engine`] (sled storage, index catalog, module
//! registry, cursor table) exposed over HTTP by [`rest`]. Clients talk to it
//! through [`client::Client`], either remotely or in-process.

pub mod client;
pub mod config;
pub mod demo;
pub mod engine;
pub mod error;
pub mod indexing;
pub mod info;
pub mod logging;
pub mod models;
pub mod query;
pub mod remote;
// REST API module: Axum HTTP handlers over the shared engine
pub mod rest;
pub mod script;
pub mod storage;
pub mod udf;

pub use client::{Backend, Client, ClientPolicy, RecordSet, ResultSet};
pub use config::Config;
pub use engine::Engine;
pub use error::{DbError, ErrorCode, Result};
