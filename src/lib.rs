//! clilogger: stream structured log entries to a logging server on the
//! local network.
//!
//! A [`client::LoggingClient`] discovers a server, authenticates with an
//! identity handshake and delivers entries one acknowledged frame at a time.
//! A [`server::LoggingServer`] authorizes clients and hands their entries to
//! a [`server::SessionHandler`] for filtering, rendering and persistence.

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod render;
pub mod server;
pub mod sink;

pub use error::{LoggerError, Result};
