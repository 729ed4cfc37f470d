//! HTTP surface of the operator: health checks and Prometheus metrics

mod server;

pub use server::{run_server, ServerState};
