//! Error types for netlink and namespace operations.

use std::io;
use std::path::PathBuf;

/// Result type for netlink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while mirroring kernel state.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error from socket or filesystem operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Kernel returned an error code.
    #[error("kernel error: {message} (errno {errno})")]
    Kernel {
        /// The errno value from the kernel (positive).
        errno: i32,
        /// Human-readable error message.
        message: String,
    },

    /// Message was truncated.
    #[error("message truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Expected message length.
        expected: usize,
        /// Actual bytes received.
        actual: usize,
    },

    /// Invalid message format.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Invalid attribute format.
    #[error("invalid attribute: {0}")]
    InvalidAttribute(String),

    /// The kernel granted a smaller socket buffer than requested.
    #[error("{option} truncated to {actual} bytes; run: sysctl -w net.core.{sysctl}={requested}")]
    BufferTruncated {
        /// `SO_RCVBUF` or `SO_SNDBUF`.
        option: &'static str,
        /// Size reported back by the kernel.
        actual: usize,
        /// Size that was asked for.
        requested: usize,
        /// The tunable that caps the option.
        sysctl: &'static str,
    },

    /// Socket closed or its receive stream ended.
    #[error("socket closed")]
    Closed,

    /// Namespace not found.
    #[error("namespace not found: {name}")]
    NamespaceNotFound {
        /// The namespace name that was not found.
        name: String,
    },

    /// Namespace already registered.
    #[error("namespace already registered: {name}")]
    NamespaceExists {
        /// The duplicate name.
        name: String,
    },

    /// A startup namespace exhausted its initial dump attempts.
    #[error("initial dump of namespace {namespace} failed: {reason}")]
    InitialDump {
        /// The namespace whose dump failed.
        namespace: String,
        /// The last attempt's error.
        reason: String,
    },

    /// Entering a namespace (or returning from it) failed.
    #[error("failed to switch to namespace {}: {source}", path.display())]
    NamespaceSwitch {
        /// Namespace handle path.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// Create a kernel error from a (negative) errno value.
    pub fn from_errno(errno: i32) -> Self {
        let message = io::Error::from_raw_os_error(-errno).to_string();
        Self::Kernel {
            errno: -errno,
            message,
        }
    }

    /// Check if this is a "not found" error (ENOENT, ENODEV, etc.).
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Kernel { errno, .. } => matches!(*errno, libc::ENOENT | libc::ENODEV),
            Self::NamespaceNotFound { .. } => true,
            Self::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Check if this is a permission error (EPERM, EACCES).
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Self::Kernel { errno, .. } => matches!(*errno, libc::EPERM | libc::EACCES),
            Self::Io(e) | Self::NamespaceSwitch { source: e, .. } => {
                matches!(e.raw_os_error(), Some(libc::EPERM | libc::EACCES))
            }
            _ => false,
        }
    }

    /// Check if this is the transient EINVAL `setns` reports while a freshly
    /// created namespace handle is not yet bind-mounted.
    pub fn is_not_mounted(&self) -> bool {
        match self {
            Self::NamespaceSwitch { source, .. } => source.raw_os_error() == Some(libc::EINVAL),
            _ => false,
        }
    }

    /// Get the errno value if this is a kernel error.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Kernel { errno, .. } => Some(*errno),
            _ => None,
        }
    }
}
