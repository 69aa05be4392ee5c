//! Namespace directory watcher.
//!
//! Scans the namespace directory once at startup, then follows it with
//! inotify. Created entries are registered with the [`Registry`]; deleted
//! entries are removed from it.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use nlmirror::{NamespaceWatcher, NoDataplane, Registry, RegistryConfig};
//!
//! let registry = Registry::new(RegistryConfig::default(), Arc::new(NoDataplane));
//! registry.start().await?;
//!
//! let watcher = NamespaceWatcher::new(registry.clone());
//! watcher.scan().await?;
//! registry.initial_sync().await?;
//! watcher.run().await?;
//! ```

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use inotify::{EventMask, EventStream, Inotify, WatchMask};
use tokio_stream::StreamExt;
use tracing::{debug, error, info};

use super::netns;
use super::registry::Registry;
use crate::netlink::{Error, Result};

const DEFAULT_BUFFER_SIZE: usize = 4096;

/// A change in the namespace directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceEvent {
    /// An entry was created.
    Created { name: String },
    /// An entry was deleted.
    Deleted { name: String },
}

impl NamespaceEvent {
    fn from_inotify(mask: EventMask, name: Option<&OsStr>) -> Option<Self> {
        if mask.contains(EventMask::ISDIR) {
            return None;
        }
        let name = name?.to_str()?.to_string();
        if mask.contains(EventMask::CREATE) {
            Some(Self::Created { name })
        } else if mask.contains(EventMask::DELETE) {
            Some(Self::Deleted { name })
        } else {
            None
        }
    }
}

/// Stream of [`NamespaceEvent`]s for one directory.
pub struct DirectoryEvents {
    stream: EventStream<Vec<u8>>,
}

impl DirectoryEvents {
    /// Next event. `None` once the inotify stream ends.
    pub async fn next(&mut self) -> Option<Result<NamespaceEvent>> {
        while let Some(event) = self.stream.next().await {
            match event {
                Ok(event) => {
                    if let Some(ns_event) =
                        NamespaceEvent::from_inotify(event.mask, event.name.as_deref())
                    {
                        return Some(Ok(ns_event));
                    }
                }
                Err(e) => return Some(Err(Error::Io(e))),
            }
        }
        None
    }
}

/// Drives a [`Registry`] from the contents of a namespace directory.
#[derive(Debug, Clone)]
pub struct NamespaceWatcher {
    registry: Registry,
    dir: PathBuf,
    buffer_size: usize,
}

impl NamespaceWatcher {
    /// Watch the registry's configured namespace directory.
    pub fn new(registry: Registry) -> Self {
        let dir = registry.config().netns_dir.clone();
        Self {
            registry,
            dir,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    /// Watch a different directory.
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    /// Set the inotify read buffer size.
    pub fn with_buffer_size(mut self, bytes: usize) -> Self {
        self.buffer_size = bytes;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Register every existing entry, then seal the startup set.
    ///
    /// Entries that fail to register are logged and skipped. Returns the
    /// number registered.
    pub async fn scan(&self) -> Result<usize> {
        let names = netns::list(&self.dir)?;
        let mut added = 0;
        for name in &names {
            match self.registry.add(name).await {
                Ok(_) => added += 1,
                Err(e) => error!(namespace = %name, error = %e, "failed to add namespace"),
            }
        }
        self.registry.seal_startup_set();
        info!(dir = %self.dir.display(), found = names.len(), added, "namespace scan complete");
        Ok(added)
    }

    /// Create the directory if needed and start watching it.
    pub fn watch(&self) -> Result<DirectoryEvents> {
        std::fs::create_dir_all(&self.dir)?;
        let inotify = Inotify::init()?;
        inotify
            .watches()
            .add(&self.dir, WatchMask::CREATE | WatchMask::DELETE)?;
        let stream = inotify.into_event_stream(vec![0u8; self.buffer_size])?;
        debug!(dir = %self.dir.display(), "watching namespace directory");
        Ok(DirectoryEvents { stream })
    }

    /// Apply directory events to the registry until the stream ends.
    ///
    /// A failed add is logged. Deleting a name the registry does not know
    /// stops the watcher with [`Error::NamespaceNotFound`].
    pub async fn follow(&self, mut events: DirectoryEvents) -> Result<()> {
        while let Some(event) = events.next().await {
            match event? {
                NamespaceEvent::Created { name } => {
                    if let Err(e) = self.registry.add(&name).await {
                        error!(namespace = %name, error = %e, "failed to add namespace");
                    }
                }
                NamespaceEvent::Deleted { name } => self.registry.del(&name)?,
            }
        }
        Ok(())
    }

    /// [`watch`](Self::watch) then [`follow`](Self::follow).
    pub async fn run(&self) -> Result<()> {
        let events = self.watch()?;
        self.follow(events).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::{NoDataplane, RegistryConfig};
    use std::sync::Arc;
    use std::time::Duration;

    fn temp_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("nlmirror-{}-{}", tag, std::process::id()))
    }

    #[test]
    fn test_event_classification() {
        assert_eq!(
            NamespaceEvent::from_inotify(EventMask::CREATE, Some(OsStr::new("red"))),
            Some(NamespaceEvent::Created { name: "red".into() })
        );
        assert_eq!(
            NamespaceEvent::from_inotify(EventMask::DELETE, Some(OsStr::new("red"))),
            Some(NamespaceEvent::Deleted { name: "red".into() })
        );
        assert_eq!(
            NamespaceEvent::from_inotify(EventMask::CREATE | EventMask::ISDIR, Some(OsStr::new("d"))),
            None
        );
        assert_eq!(NamespaceEvent::from_inotify(EventMask::CREATE, None), None);
        assert_eq!(
            NamespaceEvent::from_inotify(EventMask::MODIFY, Some(OsStr::new("red"))),
            None
        );
    }

    #[tokio::test]
    async fn test_scan_empty_dir_seals_and_syncs() {
        let dir = temp_dir("scan-empty");
        let registry = Registry::new(
            RegistryConfig::default().with_netns_dir(&dir),
            Arc::new(NoDataplane),
        );
        let watcher = NamespaceWatcher::new(registry.clone());
        assert_eq!(watcher.dir(), dir.as_path());

        assert_eq!(watcher.scan().await.unwrap(), 0);
        assert!(registry.is_synced());
    }

    #[tokio::test]
    async fn test_watch_creates_directory() {
        let dir = temp_dir("watch-create");
        let _ = std::fs::remove_dir_all(&dir);
        let registry = Registry::new(RegistryConfig::default(), Arc::new(NoDataplane));
        let watcher = NamespaceWatcher::new(registry).with_dir(&dir);

        let _events = watcher.watch().unwrap();
        assert!(dir.is_dir());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_unknown_delete_is_fatal() {
        let dir = temp_dir("watch-delete");
        let _ = std::fs::remove_dir_all(&dir);
        let registry = Registry::new(
            RegistryConfig::default().with_netns_dir(&dir),
            Arc::new(NoDataplane),
        );
        let watcher = NamespaceWatcher::new(registry.clone());
        let events = watcher.watch().unwrap();

        // A plain file is not a namespace handle: the add fails and is
        // skipped, so the delete names an unknown namespace.
        std::fs::File::create(dir.join("bogus")).unwrap();
        let follow = tokio::spawn(async move { watcher.follow(events).await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::remove_file(dir.join("bogus")).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), follow)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::NamespaceNotFound { .. })));
        assert!(registry.namespace("bogus").is_none());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
