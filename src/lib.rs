//! netsync operator
//!
//! Keeps network custom resources (security policies, namespace VPCs, IP
//! address allocations and address bindings) in sync with a
//! network-management backend.

pub mod backend;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod rest_api;
pub mod store;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
