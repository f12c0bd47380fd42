//! Pingora-facing services: the gateway listener, the status endpoint and the restart hook

pub mod http;
pub mod restart;
pub mod status;
