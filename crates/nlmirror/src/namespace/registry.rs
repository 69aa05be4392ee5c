//! Registry of live network namespaces and their mirrored interfaces.
//!
//! Each registered [`Namespace`] owns a socket pair created inside it: an
//! events socket, which first runs the initial dump and then follows
//! multicast changes, and a request socket for synchronous exchanges. A
//! spawned task per namespace drives the events socket and applies link
//! records to the namespace's [`InterfaceTable`].
//!
//! The registry reports namespace and interface changes to a [`Dataplane`].
//! Notifications are delivered after internal locks are released, in the
//! order the changes were applied.
//!
//! # Lock order
//!
//! registry state, then a namespace's interface table. Neither is held
//! across an `.await`.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use super::barrier::SyncBarrier;
use super::interface::{DataplaneId, Interface, InterfaceTable, LinkUpdate};
use super::netns::{
    self, DEFAULT_PACKET_SNDBUF, DEFAULT_SWITCH_WINDOW, NETNS_RUN_DIR, NamespaceFd,
    NamespaceSockets, SELF_NETNS,
};
use super::pool::IndexPool;
use crate::netlink::{
    CloseHandle, Error, LinkInfo, ListenRequest, Message, NlMsgType, Payload, Result, Socket,
    SocketConfig, listen, rx_until_done,
};

/// Name under which the process's own namespace is registered.
pub const DEFAULT_NAMESPACE: &str = "default";

const NSID_UNSET: i32 = -1;

/// Receiver of namespace and interface changes.
///
/// All methods default to doing nothing. They are called from registry
/// tasks and must not block.
pub trait Dataplane: Send + Sync + 'static {
    /// A namespace was registered.
    fn namespace_added(&self, _namespace: &Namespace) {}

    /// A namespace was removed and its sockets closed.
    fn namespace_deleted(&self, _namespace: &Namespace) {}

    /// An interface appeared.
    fn interface_added(&self, _namespace: &Namespace, _interface: &Interface) {}

    /// An interface kept its index but changed its name.
    fn interface_renamed(&self, _namespace: &Namespace, _interface: &Interface, _old: &str) {}

    /// An interface disappeared.
    fn interface_deleted(&self, _namespace: &Namespace, _interface: &Interface) {}

    /// A bound interface showed up in a namespace other than the one it was
    /// last seen in.
    fn interface_moved(&self, _interface: &Interface, _from: &str, _to: &Namespace) {}

    /// A namespace gave up on its initial dump after every attempt failed.
    fn initial_dump_failed(&self, _namespace: &Namespace, _error: &Error) {}

    /// Every namespace known at startup completed its initial dump.
    fn initial_sync_complete(&self) {}
}

/// A [`Dataplane`] that ignores every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDataplane;

impl Dataplane for NoDataplane {}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Directory holding named namespace handles.
    pub netns_dir: PathBuf,
    /// Configuration of each namespace's events socket.
    pub events: SocketConfig,
    /// Configuration of each namespace's request socket.
    pub requests: SocketConfig,
    /// Initial dump requests (empty = the default set).
    pub listen_requests: Vec<ListenRequest>,
    /// How long to retry entering a namespace that is not yet mounted.
    pub switch_window: Duration,
    /// Send buffer of the raw packet socket.
    pub packet_sndbuf: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            netns_dir: PathBuf::from(NETNS_RUN_DIR),
            events: SocketConfig::default(),
            requests: SocketConfig::request(),
            listen_requests: Vec::new(),
            switch_window: DEFAULT_SWITCH_WINDOW,
            packet_sndbuf: DEFAULT_PACKET_SNDBUF,
        }
    }
}

impl RegistryConfig {
    /// Set the namespace directory.
    pub fn with_netns_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.netns_dir = dir.into();
        self
    }

    /// Set the events socket configuration.
    pub fn with_events(mut self, config: SocketConfig) -> Self {
        self.events = config;
        self
    }

    /// Set the request socket configuration.
    pub fn with_requests(mut self, config: SocketConfig) -> Self {
        self.requests = config;
        self
    }

    /// Set the initial dump requests.
    pub fn with_listen_requests(mut self, requests: impl Into<Vec<ListenRequest>>) -> Self {
        self.listen_requests = requests.into();
        self
    }

    /// Set the namespace switch retry window.
    pub fn with_switch_window(mut self, window: Duration) -> Self {
        self.switch_window = window;
        self
    }

    /// Set the packet socket send buffer.
    pub fn with_packet_sndbuf(mut self, bytes: usize) -> Self {
        self.packet_sndbuf = bytes;
        self
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct NamespaceIo {
    packet: Mutex<Option<OwnedFd>>,
    requests: tokio::sync::Mutex<Socket>,
    closers: Vec<CloseHandle>,
}

/// One registered network namespace.
pub struct Namespace {
    index: usize,
    name: String,
    nsid: AtomicI32,
    startup: bool,
    handle: Option<NamespaceFd>,
    io: Option<NamespaceIo>,
    interfaces: Mutex<InterfaceTable>,
    dump_done: AtomicBool,
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("nsid", &self.nsid())
            .field("startup", &self.startup)
            .finish()
    }
}

impl Namespace {
    /// Compact index, unique among live namespaces.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kernel-assigned namespace id, if any.
    pub fn nsid(&self) -> Option<i32> {
        match self.nsid.load(Ordering::Acquire) {
            NSID_UNSET => None,
            id => Some(id),
        }
    }

    fn set_nsid(&self, nsid: Option<i32>) -> bool {
        let new = nsid.unwrap_or(NSID_UNSET);
        self.nsid.swap(new, Ordering::AcqRel) != new
    }

    /// True for the process's own namespace.
    pub fn is_default(&self) -> bool {
        self.name == DEFAULT_NAMESPACE
    }

    /// True if the namespace counts toward the initial sync barrier.
    pub fn is_startup(&self) -> bool {
        self.startup
    }

    /// True once the initial dump completed.
    pub fn dump_done(&self) -> bool {
        self.dump_done.load(Ordering::Acquire)
    }

    /// The namespace handle.
    pub fn handle(&self) -> Option<&NamespaceFd> {
        self.handle.as_ref()
    }

    /// Raw `AF_PACKET` transmit socket, until the namespace is closed.
    pub fn packet_fd(&self) -> Option<RawFd> {
        let io = self.io.as_ref()?;
        lock(&io.packet).as_ref().map(|fd| fd.as_raw_fd())
    }

    /// Interface with kernel index `index`.
    pub fn interface(&self, index: u32) -> Option<Interface> {
        lock(&self.interfaces).by_index(index).cloned()
    }

    /// Interface currently named `name`.
    pub fn interface_by_name(&self, name: &str) -> Option<Interface> {
        lock(&self.interfaces).by_name(name).cloned()
    }

    /// All interfaces, ordered by index.
    pub fn interfaces(&self) -> Vec<Interface> {
        lock(&self.interfaces).to_vec()
    }

    /// Send `msg` on the request socket and collect every reply up to the
    /// terminal record. Exchanges on one namespace are serialized.
    pub async fn request(&self, msg: Message) -> Result<Vec<Message>> {
        let io = self.io.as_ref().ok_or(Error::Closed)?;
        let mut socket = io.requests.lock().await;

        let seq = socket.send(msg).await?;
        let mut replies = Vec::new();
        let mut collect = |reply: Message| -> Result<()> {
            replies.push(reply);
            Ok(())
        };
        rx_until_done(&mut socket, seq, &mut collect).await?;
        Ok(replies)
    }

    /// Ask this namespace's kernel view for the id of the namespace behind
    /// `target`.
    pub async fn get_nsid(&self, target: &NamespaceFd) -> Result<Option<i32>> {
        let replies = self
            .request(Message::get_nsid(target.as_raw_fd() as u32))
            .await?;
        Ok(replies.iter().find_map(|reply| match &reply.payload {
            Payload::Namespace(info) => info.nsid(),
            _ => None,
        }))
    }

    fn is_closed(&self) -> bool {
        self.io
            .as_ref()
            .is_some_and(|io| io.closers.iter().any(CloseHandle::is_closed))
    }

    fn close(&self) {
        let Some(io) = &self.io else {
            return;
        };
        for closer in &io.closers {
            let _ = closer.close();
        }
        lock(&io.packet).take();
    }
}

#[derive(Debug, Clone)]
struct Binding {
    id: DataplaneId,
    // Namespace the interface was last seen in.
    namespace: Option<String>,
}

#[derive(Default)]
struct State {
    by_name: HashMap<String, Arc<Namespace>>,
    pool: IndexPool,
    bindings: HashMap<String, Binding>,
    sealed: bool,
    startup_count: usize,
}

enum Notification {
    NamespaceAdded(Arc<Namespace>),
    NamespaceDeleted(Arc<Namespace>),
    InterfaceAdded(Arc<Namespace>, Interface),
    InterfaceRenamed(Arc<Namespace>, Interface, String),
    InterfaceDeleted(Arc<Namespace>, Interface),
    InterfaceMoved(Interface, String, Arc<Namespace>),
    DumpFailed(Arc<Namespace>, Error),
    InitialSync,
}

struct Inner {
    config: RegistryConfig,
    dataplane: Arc<dyn Dataplane>,
    state: Mutex<State>,
    barrier: SyncBarrier,
}

/// One row of [`Registry::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct NamespaceRow {
    pub namespace: String,
    pub interface: String,
    pub nsid: Option<i32>,
}

/// Namespace registry. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("namespaces", &self.namespaces().len())
            .field("initial_sync", &self.inner.barrier.is_fired())
            .finish()
    }
}

impl Registry {
    /// Create an empty registry reporting to `dataplane`.
    pub fn new(config: RegistryConfig, dataplane: Arc<dyn Dataplane>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                dataplane,
                state: Mutex::new(State::default()),
                barrier: SyncBarrier::new(),
            }),
        }
    }

    /// The registry configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Register the process's own namespace as [`DEFAULT_NAMESPACE`].
    pub async fn start(&self) -> Result<Arc<Namespace>> {
        let sndbuf = self.inner.config.packet_sndbuf;
        let (handle, sockets) = tokio::task::spawn_blocking(move || {
            let handle = netns::open_path(SELF_NETNS)?;
            let sockets = netns::allocate_sockets(sndbuf)?;
            Ok::<_, Error>((handle, sockets))
        })
        .await
        .map_err(|e| Error::Io(io::Error::other(e)))??;

        self.register(DEFAULT_NAMESPACE, None, handle, sockets)
    }

    /// Register the named namespace, learning its id through the default
    /// namespace first.
    pub async fn add(&self, name: &str) -> Result<Arc<Namespace>> {
        let nsid = self.nsid_for_path(&self.inner.config.netns_dir.join(name)).await;
        self.add_with_nsid(name, nsid).await
    }

    /// Register the named namespace with a known id.
    ///
    /// Enters the namespace to create its sockets, then starts its initial
    /// dump. Nothing is registered if any step fails.
    pub async fn add_with_nsid(&self, name: &str, nsid: Option<i32>) -> Result<Arc<Namespace>> {
        if lock(&self.inner.state).by_name.contains_key(name) {
            return Err(Error::NamespaceExists {
                name: name.to_string(),
            });
        }

        let path = self.inner.config.netns_dir.join(name);
        let window = self.inner.config.switch_window;
        let sndbuf = self.inner.config.packet_sndbuf;
        let (handle, sockets) =
            tokio::task::spawn_blocking(move || netns::allocate_in(&path, window, sndbuf))
                .await
                .map_err(|e| Error::Io(io::Error::other(e)))??;

        self.register(name, nsid, handle, sockets)
    }

    /// Id of the namespace at `path` as seen from the default namespace.
    ///
    /// Failures are logged and reported as unassigned; the id is refreshed
    /// on the next namespace-id event.
    pub async fn nsid_for_path(&self, path: &Path) -> Option<i32> {
        let default = self.namespace(DEFAULT_NAMESPACE)?;
        let handle = match netns::open_path(path) {
            Ok(h) => h,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot open namespace handle");
                return None;
            }
        };
        match default.get_nsid(&handle).await {
            Ok(nsid) => nsid,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "namespace id lookup failed");
                None
            }
        }
    }

    /// Re-query the id of every named namespace.
    pub async fn refresh_nsids(&self) {
        let Some(default) = self.namespace(DEFAULT_NAMESPACE) else {
            return;
        };
        for ns in self.namespaces() {
            if ns.is_default() {
                continue;
            }
            let Some(handle) = ns.handle() else {
                continue;
            };
            match default.get_nsid(handle).await {
                Ok(nsid) => {
                    if ns.set_nsid(nsid) {
                        info!(namespace = %ns.name(), ?nsid, "namespace id changed");
                    }
                }
                Err(e) => debug!(namespace = %ns.name(), error = %e, "namespace id refresh failed"),
            }
        }
    }

    fn register(
        &self,
        name: &str,
        nsid: Option<i32>,
        handle: NamespaceFd,
        sockets: NamespaceSockets,
    ) -> Result<Arc<Namespace>> {
        let config = &self.inner.config;
        let events = Socket::from_netlink(sockets.events, &config.events)?;
        let requests = Socket::from_netlink(sockets.requests, &config.requests)?;

        let io = NamespaceIo {
            packet: Mutex::new(Some(sockets.packet)),
            closers: vec![events.close_handle(), requests.close_handle()],
            requests: tokio::sync::Mutex::new(requests),
        };
        let ns = self.insert(name, nsid, Some(handle), Some(io))?;

        tokio::spawn(run_namespace(self.clone(), ns.clone(), events));
        Ok(ns)
    }

    fn insert(
        &self,
        name: &str,
        nsid: Option<i32>,
        handle: Option<NamespaceFd>,
        io: Option<NamespaceIo>,
    ) -> Result<Arc<Namespace>> {
        let ns = {
            let mut state = lock(&self.inner.state);
            if state.by_name.contains_key(name) {
                return Err(Error::NamespaceExists {
                    name: name.to_string(),
                });
            }

            let startup = !state.sealed;
            if startup {
                state.startup_count += 1;
            }
            let ns = Arc::new(Namespace {
                index: state.pool.alloc(),
                name: name.to_string(),
                nsid: AtomicI32::new(nsid.unwrap_or(NSID_UNSET)),
                startup,
                handle,
                io,
                interfaces: Mutex::new(InterfaceTable::new()),
                dump_done: AtomicBool::new(false),
            });
            state.by_name.insert(name.to_string(), ns.clone());
            ns
        };

        info!(namespace = %name, index = ns.index, ?nsid, startup = ns.startup, "namespace added");
        self.dispatch(vec![Notification::NamespaceAdded(ns.clone())]);
        Ok(ns)
    }

    /// Remove a namespace, close its sockets and free its index.
    pub fn del(&self, name: &str) -> Result<()> {
        let ns = {
            let mut state = lock(&self.inner.state);
            let ns = state
                .by_name
                .remove(name)
                .ok_or_else(|| Error::NamespaceNotFound {
                    name: name.to_string(),
                })?;
            state.pool.free(ns.index);
            ns
        };

        ns.close();
        info!(namespace = %name, index = ns.index, "namespace deleted");

        let mut notes = vec![Notification::NamespaceDeleted(ns.clone())];
        // A startup namespace that vanished before finishing its dump will
        // never report; release its share of the barrier.
        if ns.startup && !ns.dump_done.swap(true, Ordering::AcqRel) && self.inner.barrier.complete_one() {
            notes.push(Notification::InitialSync);
        }
        self.dispatch(notes);
        Ok(())
    }

    /// Close the startup set: namespaces registered from now on do not count
    /// toward the initial sync barrier.
    pub fn seal_startup_set(&self) {
        let target = {
            let mut state = lock(&self.inner.state);
            state.sealed = true;
            state.startup_count
        };
        debug!(target, "startup namespace set sealed");
        if self.inner.barrier.arm(target) {
            self.dispatch(vec![Notification::InitialSync]);
        }
    }

    /// Record that `ns` finished its initial dump.
    pub fn netlink_dump_done(&self, ns: &Namespace) {
        if ns.dump_done.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(namespace = %ns.name(), "initial dump done");
        if ns.startup && self.inner.barrier.complete_one() {
            self.dispatch(vec![Notification::InitialSync]);
        }
    }

    /// Record that `ns` gave up on its initial dump.
    ///
    /// A startup namespace failing this way fails the initial sync: from
    /// then on [`initial_sync`](Self::initial_sync) returns
    /// [`Error::InitialDump`]. A namespace closed mid-dump is not a failure.
    pub fn netlink_dump_failed(&self, ns: &Arc<Namespace>, error: Error) {
        if ns.is_closed() {
            debug!(namespace = %ns.name(), "initial dump abandoned, namespace closed");
            return;
        }
        error!(namespace = %ns.name(), error = %error, "initial dump failed");
        if ns.startup && !ns.dump_done() {
            self.inner.barrier.fail(ns.name(), &error.to_string());
        }
        self.dispatch(vec![Notification::DumpFailed(ns.clone(), error)]);
    }

    /// Wait until every startup namespace completed its initial dump.
    ///
    /// Fails with [`Error::InitialDump`] if one of them gave up instead.
    pub async fn initial_sync(&self) -> Result<()> {
        self.inner.barrier.wait().await
    }

    /// True once the initial sync barrier fired.
    pub fn is_synced(&self) -> bool {
        self.inner.barrier.is_fired()
    }

    /// Apply a received message to `ns`. Returns true if it announced a
    /// namespace id change.
    pub fn handle_message(&self, ns: &Arc<Namespace>, msg: Message) -> bool {
        // Relayed from a peer namespace; its own socket delivers it too.
        if msg.nsid.is_some() {
            trace!(namespace = %ns.name(), nsid = ?msg.nsid, "ignoring relayed message");
            return false;
        }
        match &msg.payload {
            Payload::Link(link) => {
                self.add_del_interface(ns, msg.msg_type(), link);
                false
            }
            Payload::Namespace(_) => ns.is_default(),
            _ => false,
        }
    }

    /// Apply a new-link or del-link record to `ns`'s interface tables.
    pub fn add_del_interface(&self, ns: &Arc<Namespace>, msg_type: u16, link: &LinkInfo) {
        let notes = match msg_type {
            NlMsgType::RTM_NEWLINK => self.apply_new_link(ns, link),
            NlMsgType::RTM_DELLINK => self.apply_del_link(ns, link),
            _ => return,
        };
        self.dispatch(notes);
    }

    fn apply_new_link(&self, ns: &Arc<Namespace>, link: &LinkInfo) -> Vec<Notification> {
        let index = link.index();
        let Some(name) = link
            .name()
            .map(str::to_string)
            .or_else(|| ns.interface(index).map(|i| i.name))
        else {
            warn!(namespace = %ns.name(), index, "new link without a name");
            return Vec::new();
        };

        let mut notes = Vec::new();
        let mut state = lock(&self.inner.state);
        let mut table = lock(&ns.interfaces);

        let interface = match table.upsert(index, &name, Arc::downgrade(ns)) {
            LinkUpdate::Added(interface) => {
                debug!(namespace = %ns.name(), index, name = %name, "interface added");
                notes.push(Notification::InterfaceAdded(ns.clone(), interface.clone()));
                interface
            }
            LinkUpdate::Renamed { interface, old } => {
                debug!(namespace = %ns.name(), index, old = %old, name = %name, "interface renamed");
                if let Some(binding) = state.bindings.remove(&old) {
                    state.bindings.insert(name.clone(), binding);
                }
                notes.push(Notification::InterfaceRenamed(ns.clone(), interface.clone(), old));
                interface
            }
            LinkUpdate::Unchanged(interface) => interface,
        };

        if let Some(binding) = state.bindings.get_mut(&name) {
            let bound = if interface.dataplane != Some(binding.id) {
                table.bind(index, binding.id).unwrap_or(interface)
            } else {
                interface
            };
            match binding.namespace.replace(ns.name().to_string()) {
                Some(from) if from != ns.name() => {
                    info!(interface = %name, from = %from, to = %ns.name(), "interface moved");
                    notes.push(Notification::InterfaceMoved(bound, from, ns.clone()));
                }
                _ => {}
            }
        }

        notes
    }

    fn apply_del_link(&self, ns: &Arc<Namespace>, link: &LinkInfo) -> Vec<Notification> {
        let Some(interface) = lock(&ns.interfaces).remove(link.index()) else {
            trace!(namespace = %ns.name(), index = link.index(), "delete of unknown interface");
            return Vec::new();
        };
        debug!(namespace = %ns.name(), index = interface.index, name = %interface.name, "interface deleted");
        vec![Notification::InterfaceDeleted(ns.clone(), interface)]
    }

    /// Declare that the dataplane owns interfaces named `name`.
    ///
    /// An interface already present under that name is bound immediately.
    pub fn bind_interface(&self, name: &str, id: DataplaneId) {
        let mut state = lock(&self.inner.state);
        let mut namespace = None;
        for ns in state.by_name.values() {
            let mut table = lock(&ns.interfaces);
            if let Some(index) = table.by_name(name).map(|i| i.index) {
                table.bind(index, id);
                namespace = Some(ns.name().to_string());
                break;
            }
        }
        state.bindings.insert(name.to_string(), Binding { id, namespace });
    }

    /// Registered namespace by name.
    pub fn namespace(&self, name: &str) -> Option<Arc<Namespace>> {
        lock(&self.inner.state).by_name.get(name).cloned()
    }

    /// All registered namespaces, ordered by index.
    pub fn namespaces(&self) -> Vec<Arc<Namespace>> {
        let mut all: Vec<Arc<Namespace>> = lock(&self.inner.state).by_name.values().cloned().collect();
        all.sort_by_key(|ns| ns.index);
        all
    }

    /// Find an interface by name in any namespace.
    pub fn interface_by_name(&self, name: &str) -> Option<(Arc<Namespace>, Interface)> {
        self.namespaces()
            .into_iter()
            .find_map(|ns| ns.interface_by_name(name).map(|intf| (ns, intf)))
    }

    /// Every mirrored interface with its namespace, sorted by namespace then
    /// interface name.
    pub fn snapshot(&self) -> Vec<NamespaceRow> {
        let mut rows = Vec::new();
        for ns in self.namespaces() {
            for interface in ns.interfaces() {
                rows.push(NamespaceRow {
                    namespace: ns.name().to_string(),
                    interface: interface.name,
                    nsid: ns.nsid(),
                });
            }
        }
        rows.sort();
        rows
    }

    /// Close every namespace and empty the registry.
    pub fn shutdown(&self) {
        let namespaces: Vec<Arc<Namespace>> = {
            let mut state = lock(&self.inner.state);
            state.sealed = true;
            state.by_name.drain().map(|(_, ns)| ns).collect()
        };
        for ns in &namespaces {
            ns.close();
        }
        info!(count = namespaces.len(), "registry shut down");
    }

    fn dispatch(&self, notes: Vec<Notification>) {
        let dp = &self.inner.dataplane;
        for note in notes {
            match note {
                Notification::NamespaceAdded(ns) => dp.namespace_added(&ns),
                Notification::NamespaceDeleted(ns) => dp.namespace_deleted(&ns),
                Notification::InterfaceAdded(ns, intf) => dp.interface_added(&ns, &intf),
                Notification::InterfaceRenamed(ns, intf, old) => dp.interface_renamed(&ns, &intf, &old),
                Notification::InterfaceDeleted(ns, intf) => dp.interface_deleted(&ns, &intf),
                Notification::InterfaceMoved(intf, from, to) => dp.interface_moved(&intf, &from, &to),
                Notification::DumpFailed(ns, error) => dp.initial_dump_failed(&ns, &error),
                Notification::InitialSync => {
                    info!("initial sync complete");
                    dp.initial_sync_complete();
                }
            }
        }
    }

    /// Register a namespace without sockets or a handle.
    #[cfg(test)]
    pub(crate) fn insert_detached(&self, name: &str, nsid: Option<i32>) -> Result<Arc<Namespace>> {
        self.insert(name, nsid, None, None)
    }
}

async fn run_namespace(registry: Registry, ns: Arc<Namespace>, mut events: Socket) {
    let requests = registry.inner.config.listen_requests.clone();
    let mut handler = |msg: Message| -> Result<()> {
        registry.handle_message(&ns, msg);
        Ok(())
    };

    match listen(&mut events, &mut handler, &requests).await {
        Ok(()) => registry.netlink_dump_done(&ns),
        Err(e) => registry.netlink_dump_failed(&ns, e),
    }

    let pid = events.pid();
    while let Some(msg) = events.recv().await {
        // Unicast replies left over from an abandoned dump attempt.
        if msg.header.nlmsg_pid == pid && msg.seq() != 0 {
            trace!(namespace = %ns.name(), seq = msg.seq(), "dropping stale dump reply");
            continue;
        }
        if registry.handle_message(&ns, msg) {
            registry.refresh_nsids().await;
        }
    }
    debug!(namespace = %ns.name(), "namespace event stream ended");
}
