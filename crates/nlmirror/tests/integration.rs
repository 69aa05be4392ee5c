//! Integration test entry point.
//!
//! These tests create real network namespaces and need root:
//!
//! ```bash
//! sudo cargo test -p nlmirror --test integration --features integration
//! ```
//!
//! - `socket.rs` - dumps over a socket opened inside a namespace
//! - `registry.rs` - namespace registration, interface tracking, watcher

#[macro_use]
#[path = "common/mod.rs"]
mod common;

#[path = "integration/socket.rs"]
mod socket;

#[path = "integration/registry.rs"]
mod registry;
