//! Shared helpers for the root-only integration tests.

use nlmirror::Result;
use nlmirror::namespace::netns::NETNS_RUN_DIR;
use std::io;
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

static NAMESPACE_COUNTER: AtomicU32 = AtomicU32::new(0);

fn unique_ns_name(prefix: &str) -> String {
    let id = NAMESPACE_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("nlmirror-test-{}-{}-{}", prefix, std::process::id(), id)
}

fn run_ip(args: &[&str]) -> Result<String> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .map_err(|e| nlmirror::Error::Io(io::Error::from(e.kind())))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(nlmirror::Error::InvalidMessage(format!(
            "ip {:?} failed: {}",
            args, stderr
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// A named network namespace created with `ip netns add`, deleted on drop.
pub struct TestNamespace {
    name: String,
}

impl TestNamespace {
    pub fn new(prefix: &str) -> Result<Self> {
        let name = unique_ns_name(prefix);
        run_ip(&["netns", "add", &name])?;
        Ok(Self { name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the namespace handle.
    pub fn path(&self) -> PathBuf {
        PathBuf::from(NETNS_RUN_DIR).join(&self.name)
    }

    /// Run `ip` inside the namespace.
    pub fn ip(&self, args: &[&str]) -> Result<String> {
        let mut full = vec!["-n", self.name.as_str()];
        full.extend_from_slice(args);
        run_ip(&full)
    }

    pub fn add_dummy(&self, name: &str) -> Result<()> {
        self.ip(&["link", "add", name, "type", "dummy"])?;
        Ok(())
    }

    pub fn rename_link(&self, old: &str, new: &str) -> Result<()> {
        self.ip(&["link", "set", old, "name", new])?;
        Ok(())
    }

    pub fn del_link(&self, name: &str) -> Result<()> {
        self.ip(&["link", "del", name])?;
        Ok(())
    }

    /// Move `dev` from this namespace into `other`.
    pub fn move_link(&self, dev: &str, other: &TestNamespace) -> Result<()> {
        self.ip(&["link", "set", dev, "netns", &other.name])?;
        Ok(())
    }
}

impl Drop for TestNamespace {
    fn drop(&mut self) {
        let _ = Command::new("ip").args(["netns", "del", &self.name]).status();
    }
}

pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Poll `cond` every 10ms until it holds or 5s pass.
pub async fn wait_for<F: FnMut() -> bool>(mut cond: F) -> bool {
    for _ in 0..500 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Skip the test if not running as root.
#[macro_export]
macro_rules! require_root {
    () => {
        if !crate::common::is_root() {
            eprintln!("Skipping test: requires root");
            return Ok(());
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_ns_name() {
        let a = unique_ns_name("x");
        let b = unique_ns_name("x");
        assert_ne!(a, b);
        assert!(a.starts_with("nlmirror-test-x-"));
    }
}
