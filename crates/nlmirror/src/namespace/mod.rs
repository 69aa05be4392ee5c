//! Network namespace tracking.
//!
//! [`Registry`] owns one entry per live namespace, each with its own socket
//! pair and interface table. [`NamespaceWatcher`] keeps the registry in step
//! with the namespace directory.

mod barrier;
mod interface;
pub mod netns;
mod pool;
mod registry;
mod watcher;

pub use barrier::SyncBarrier;
pub use interface::{DataplaneId, Interface, InterfaceTable, LinkUpdate};
pub use netns::{NamespaceFd, NamespaceGuard, NamespaceSockets};
pub use pool::IndexPool;
pub use registry::{
    DEFAULT_NAMESPACE, Dataplane, Namespace, NamespaceRow, NoDataplane, Registry, RegistryConfig,
};
pub use watcher::{DirectoryEvents, NamespaceEvent, NamespaceWatcher};
