//! netdiag - real-time network diagnostic session engine.
//!
//! Sends validated, rate-limited commands to a remote executor over a
//! reconnecting WebSocket and parses the streamed tool output into typed
//! records with running statistics, one session per diagnostic kind.

pub mod channel;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod parser;
pub mod ratelimit;
pub mod session;
pub mod validation;
