//! PingGate: an API gateway built on Pingora.
//!
//! Requests pass admission control and a configurable filter chain, are resolved to a route
//! (with per-client dedicated lines), and are answered either by a single backend call or by
//! an aggregation pipeline that fans out to HTTP, RPC and SQL backends.

pub mod admin;
pub mod admission;
pub mod config;
pub mod connector;
pub mod core;
pub mod gateway;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod plugin;
pub mod route;
pub mod service;
pub(crate) mod utils;
