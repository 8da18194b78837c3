//! MCP stdio proxy
//!
//! Expose stdio MCP servers over MCP Streamable HTTP, with one subprocess per session.
//!
//! Request path: [`http`] → [`gateway`] → [`manager`] → [`session`] → [`bridge`] →
//! process.
//! [`reaper`] expires idle sessions and tears down sessions of destroyed containers.

pub mod bridge;
pub mod config;
pub mod error;
pub mod gateway;
pub mod http;
pub mod jsonrpc;
pub mod manager;
pub mod reaper;
pub mod registry;
pub mod session;
pub mod timeouts;

pub use error::{ProxyError, Result};
