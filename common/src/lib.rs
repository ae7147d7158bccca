//! Shared building blocks for the `v6seek` workspace: the configuration model
//! and the IPv6 value types every other crate speaks in.

pub mod config;
pub mod network;
