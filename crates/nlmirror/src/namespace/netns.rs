//! Network namespace handles and scoped namespace switching.
//!
//! `setns(2)` changes the namespace of the calling thread, so every switch
//! here is synchronous, holds a process-wide lock for its whole duration and
//! is undone by [`NamespaceGuard`] on every exit path. Async callers run the
//! switch on a blocking thread (see [`allocate_in`]).

use std::fs::File;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use netlink_sys::protocols;
use tracing::{error, trace};

use crate::netlink::{Error, Result, negotiate_buffer};

/// The runtime directory where named network namespaces are stored.
pub const NETNS_RUN_DIR: &str = "/var/run/netns";

/// Handle of the calling thread's own network namespace.
pub const SELF_NETNS: &str = "/proc/self/ns/net";

/// How long a switch keeps retrying while the handle is not yet mounted.
pub const DEFAULT_SWITCH_WINDOW: Duration = Duration::from_millis(10);

/// Send buffer requested for the raw packet socket.
pub const DEFAULT_PACKET_SNDBUF: usize = 1 << 20;

static SWITCH_LOCK: Mutex<()> = Mutex::new(());

/// Open a namespace file by path.
pub fn open_path<P: AsRef<Path>>(path: P) -> Result<NamespaceFd> {
    let path = path.as_ref();
    let file = File::open(path)?;
    Ok(NamespaceFd {
        file,
        path: path.to_path_buf(),
    })
}

/// A handle to an open namespace file.
#[derive(Debug)]
pub struct NamespaceFd {
    file: File,
    path: PathBuf,
}

impl NamespaceFd {
    /// Get the raw file descriptor.
    pub fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Path the handle was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AsRawFd for NamespaceFd {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// Enter the namespace behind `target` on the calling thread.
///
/// Blocks until no other switch is in flight. Dropping the guard returns
/// the thread to the namespace it was in before.
pub fn enter(target: &NamespaceFd) -> Result<NamespaceGuard> {
    let lock = SWITCH_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    let original = File::open(SELF_NETNS)?;

    // SAFETY: target holds an open namespace file for the call's duration.
    let ret = unsafe { libc::setns(target.as_raw_fd(), libc::CLONE_NEWNET) };
    if ret < 0 {
        return Err(Error::NamespaceSwitch {
            path: target.path().to_path_buf(),
            source: io::Error::last_os_error(),
        });
    }

    Ok(NamespaceGuard {
        original: Some(original),
        _lock: lock,
    })
}

/// A guard that restores the original namespace when dropped.
#[derive(Debug)]
pub struct NamespaceGuard {
    original: Option<File>,
    // Released after `original` is restored.
    _lock: MutexGuard<'static, ()>,
}

impl NamespaceGuard {
    /// Restore the original namespace explicitly, reporting failure.
    pub fn restore(mut self) -> Result<()> {
        self.do_restore()
    }

    fn do_restore(&mut self) -> Result<()> {
        let Some(original) = self.original.take() else {
            return Ok(());
        };
        // SAFETY: original was opened from SELF_NETNS when the guard was created.
        let ret = unsafe { libc::setns(original.as_raw_fd(), libc::CLONE_NEWNET) };
        if ret < 0 {
            return Err(Error::NamespaceSwitch {
                path: PathBuf::from(SELF_NETNS),
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }
}

impl Drop for NamespaceGuard {
    fn drop(&mut self) {
        if let Err(e) = self.do_restore() {
            error!(error = %e, "failed to restore original namespace");
        }
    }
}

/// Run `f` inside the namespace behind `target`.
pub fn with_namespace<T, F>(target: &NamespaceFd, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    let guard = enter(target)?;
    let result = f();
    guard.restore()?;
    result
}

/// List the entries of a namespace directory, sorted.
///
/// A missing directory has no namespaces.
pub fn list(dir: &Path) -> Result<Vec<String>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(d) => d,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::Io(e)),
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(Error::Io)?;
        names.push(entry.file_name().to_string_lossy().to_string());
    }

    names.sort();
    Ok(names)
}

/// Sockets owned by one namespace, created inside it.
#[derive(Debug)]
pub struct NamespaceSockets {
    /// Raw `AF_PACKET` socket for transmitting frames.
    pub packet: OwnedFd,
    /// Netlink socket for dumps and multicast events.
    pub events: netlink_sys::Socket,
    /// Netlink socket for request/reply exchanges.
    pub requests: netlink_sys::Socket,
}

/// Create a namespace's sockets in the calling thread's current namespace.
pub fn allocate_sockets(packet_sndbuf: usize) -> Result<NamespaceSockets> {
    let packet = packet_socket(packet_sndbuf)?;
    let events = netlink_sys::Socket::new(protocols::NETLINK_ROUTE)?;
    let requests = netlink_sys::Socket::new(protocols::NETLINK_ROUTE)?;
    Ok(NamespaceSockets {
        packet,
        events,
        requests,
    })
}

fn packet_socket(sndbuf: usize) -> Result<OwnedFd> {
    // Protocol 0: transmit only, nothing is queued for receive.
    // SAFETY: plain socket(2) call; the result is checked before use.
    let fd = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    // SAFETY: fd was just returned by socket(2) and is owned by nobody else.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    negotiate_buffer(fd.as_raw_fd(), libc::SO_SNDBUF, sndbuf)?;
    Ok(fd)
}

/// Open the namespace at `path` and allocate its sockets inside it.
///
/// `setns` reports EINVAL while `ip netns add` has created the handle file
/// but not yet bind-mounted it. That error is retried every millisecond
/// until `window` has elapsed; any other error is returned at once.
///
/// Blocking: call from `spawn_blocking`.
pub fn allocate_in(
    path: &Path,
    window: Duration,
    packet_sndbuf: usize,
) -> Result<(NamespaceFd, NamespaceSockets)> {
    retry_not_mounted(path, window, || {
        let handle = open_path(path)?;
        let sockets = with_namespace(&handle, || allocate_sockets(packet_sndbuf))?;
        Ok((handle, sockets))
    })
}

/// Run `switch` until it stops failing with the "not mounted yet" EINVAL
/// or `window` has elapsed.
fn retry_not_mounted<T, F>(path: &Path, window: Duration, mut switch: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let start = Instant::now();
    loop {
        match switch() {
            Ok(v) => return Ok(v),
            Err(e) if e.is_not_mounted() && start.elapsed() <= window => {
                trace!(path = %path.display(), "namespace not mounted yet, retrying");
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(e) => return Err(e),
        }
    }
}
