//! Mirror Linux rtnetlink state across network namespaces.
//!
//! The crate discovers network namespaces, opens an rtnetlink socket pair
//! inside each, dumps and then follows its link, address, neighbor, route
//! and namespace-id state, and reports interface changes to a userspace
//! dataplane through the [`Dataplane`] trait.
//!
//! # Features
//!
//! - `serde` - Serialize namespace table snapshots
//! - `integration` - Root-only integration tests
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use nlmirror::{NamespaceWatcher, NoDataplane, Registry, RegistryConfig};
//!
//! #[tokio::main]
//! async fn main() -> nlmirror::Result<()> {
//!     let registry = Registry::new(RegistryConfig::default(), Arc::new(NoDataplane));
//!     registry.start().await?;
//!
//!     let watcher = NamespaceWatcher::new(registry.clone());
//!     watcher.scan().await?;
//!     registry.initial_sync().await?;
//!
//!     for row in registry.snapshot() {
//!         println!("{} {} {:?}", row.interface, row.namespace, row.nsid);
//!     }
//!     Ok(())
//! }
//! ```

pub mod namespace;
pub mod netlink;

pub use namespace::{
    Dataplane, DataplaneId, Interface, Namespace, NamespaceRow, NamespaceWatcher, NoDataplane,
    Registry, RegistryConfig,
};
pub use netlink::{Error, Message, Result, Socket, SocketConfig};
