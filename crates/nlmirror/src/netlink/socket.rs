//! Async rtnetlink socket with independent receive and transmit tasks.
//!
//! [`Socket::open`] binds a `NETLINK_ROUTE` socket, negotiates its buffers
//! and spawns two tasks sharing only the descriptor:
//!
//! - the receive task reads datagrams with `recvmsg`, decodes them and feeds
//!   a bounded inbound queue. When it stops, the queue closes, which
//!   [`Socket::recv`] reports as end-of-stream (`None`).
//! - the transmit task drains a bounded outbound queue, stamping flags and
//!   port id before each write. A write failure is logged and ends the task,
//!   after which [`Socket::send`] fails with [`Error::Closed`].
//!
//! [`Socket::send`] gives each message without a sequence number the next
//! one from the socket's counter and returns it, so the caller can match
//! the terminal record of its own exchange.
//!
//! # Example
//!
//! ```ignore
//! use nlmirror::netlink::{Message, NlMsgType, Socket, SocketConfig, family};
//!
//! let mut socket = Socket::open(&SocketConfig::default())?;
//! let seq = socket.send(Message::dump_request(NlMsgType::RTM_GETLINK, family::AF_PACKET)?).await?;
//! while let Some(msg) = socket.recv().await {
//!     if msg.is_terminal() && msg.seq() == seq {
//!         break;
//!     }
//! }
//! ```

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bytes::Bytes;
use netlink_sys::{SocketAddr, protocols};
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, trace, warn};

use super::codec::{
    Message, NETLINK_LISTEN_ALL_NSID, NSID_CONTROL_SPACE, SOL_NETLINK, decode_datagram,
    encode_nsid_control, nsid_from_control,
};
use super::error::{Error, Result};
use super::message::{NLM_F_REQUEST, NlMsgHdr};
use super::types::RtnetlinkGroup;

/// Queue depth used when a configured depth is zero.
pub const DEFAULT_QUEUE_DEPTH: usize = 1024;

const RECV_BUF_SIZE: usize = 64 * 1024;
const CONTROL_BUF_SIZE: usize = 8 * 1024;

/// Socket configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketConfig {
    /// Requested SO_RCVBUF in bytes (0 leaves the kernel default).
    pub rx_bytes: usize,
    /// Requested SO_SNDBUF in bytes (0 leaves the kernel default).
    pub tx_bytes: usize,
    /// Inbound queue depth in messages (0 = [`DEFAULT_QUEUE_DEPTH`]).
    pub rx_messages: usize,
    /// Outbound queue depth in messages (0 = [`DEFAULT_QUEUE_DEPTH`]).
    pub tx_messages: usize,
    /// Multicast groups to join. Empty means no membership.
    pub groups: Vec<RtnetlinkGroup>,
    /// Receive traffic from every namespace with an assigned id, tagged
    /// with that id, instead of only the socket's own namespace.
    pub listen_all_nsid: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            rx_bytes: 0,
            tx_bytes: 0,
            rx_messages: 0,
            tx_messages: 0,
            groups: RtnetlinkGroup::DEFAULT.to_vec(),
            listen_all_nsid: true,
        }
    }
}

impl SocketConfig {
    /// Configuration for a request/reply socket: no groups, own namespace only.
    pub fn request() -> Self {
        Self {
            groups: Vec::new(),
            listen_all_nsid: false,
            ..Self::default()
        }
    }

    /// Set the receive buffer size.
    pub fn with_rx_bytes(mut self, bytes: usize) -> Self {
        self.rx_bytes = bytes;
        self
    }

    /// Set the transmit buffer size.
    pub fn with_tx_bytes(mut self, bytes: usize) -> Self {
        self.tx_bytes = bytes;
        self
    }

    /// Set the inbound queue depth.
    pub fn with_rx_messages(mut self, depth: usize) -> Self {
        self.rx_messages = depth;
        self
    }

    /// Set the outbound queue depth.
    pub fn with_tx_messages(mut self, depth: usize) -> Self {
        self.tx_messages = depth;
        self
    }

    /// Set the multicast groups.
    pub fn with_groups(mut self, groups: impl Into<Vec<RtnetlinkGroup>>) -> Self {
        self.groups = groups.into();
        self
    }

    /// Enable or disable NETLINK_LISTEN_ALL_NSID.
    pub fn with_listen_all_nsid(mut self, enabled: bool) -> Self {
        self.listen_all_nsid = enabled;
        self
    }

    fn depth(configured: usize) -> usize {
        if configured == 0 {
            DEFAULT_QUEUE_DEPTH
        } else {
            configured
        }
    }
}

struct CloseState {
    closed: AtomicBool,
    signal: watch::Sender<bool>,
}

/// Handle that can close a [`Socket`] from elsewhere.
#[derive(Clone)]
pub struct CloseHandle {
    state: Arc<CloseState>,
}

impl CloseHandle {
    fn new() -> (Self, watch::Receiver<bool>) {
        let (signal, rx) = watch::channel(false);
        let handle = Self {
            state: Arc::new(CloseState {
                closed: AtomicBool::new(false),
                signal,
            }),
        };
        (handle, rx)
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.signal.subscribe()
    }

    /// Close the socket. Only the first call succeeds.
    pub fn close(&self) -> Result<()> {
        if self.state.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Closed);
        }
        self.state.signal.send_replace(true);
        Ok(())
    }

    /// True once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for CloseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloseHandle")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Fills in the flags and port id a caller left unset.
#[derive(Debug)]
pub(crate) struct Stamper {
    pid: u32,
}

impl Stamper {
    pub(crate) fn new(pid: u32) -> Self {
        Self { pid }
    }

    pub(crate) fn stamp(&self, header: &mut NlMsgHdr) {
        if header.nlmsg_flags == 0 {
            header.nlmsg_flags = NLM_F_REQUEST;
        }
        if header.nlmsg_pid == 0 {
            header.nlmsg_pid = self.pid;
        }
    }
}

/// Per-socket request sequence numbers. Never yields 0, which the kernel
/// uses for unsolicited notifications.
#[derive(Debug)]
struct SequenceCounter(AtomicU32);

impl SequenceCounter {
    fn new() -> Self {
        Self::starting_at(1)
    }

    fn starting_at(first: u32) -> Self {
        Self(AtomicU32::new(first))
    }

    fn next(&self) -> u32 {
        loop {
            let seq = self.0.fetch_add(1, Ordering::Relaxed);
            if seq != 0 {
                return seq;
            }
        }
    }
}

/// A bound rtnetlink socket driven by a receive task and a transmit task.
#[derive(Debug)]
pub struct Socket {
    outbound: mpsc::Sender<Message>,
    inbound: mpsc::Receiver<Message>,
    pid: u32,
    seq: SequenceCounter,
    closer: CloseHandle,
}

impl Socket {
    /// Open a `NETLINK_ROUTE` socket in the current namespace.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(config: &SocketConfig) -> Result<Self> {
        let socket = netlink_sys::Socket::new(protocols::NETLINK_ROUTE)?;
        Self::from_netlink(socket, config)
    }

    /// Bind and start an unbound socket created elsewhere, typically inside
    /// another network namespace.
    pub fn from_netlink(mut socket: netlink_sys::Socket, config: &SocketConfig) -> Result<Self> {
        let mut addr = SocketAddr::new(0, RtnetlinkGroup::mask(&config.groups));
        socket.bind(&addr)?;
        socket.get_address(&mut addr)?;
        let pid = addr.port_number();

        let fd = socket.as_raw_fd();
        negotiate_buffer(fd, libc::SO_RCVBUF, config.rx_bytes)?;
        negotiate_buffer(fd, libc::SO_SNDBUF, config.tx_bytes)?;
        if config.listen_all_nsid {
            setsockopt_int(fd, SOL_NETLINK, NETLINK_LISTEN_ALL_NSID, 1)?;
        }

        socket.set_non_blocking(true)?;
        let fd = Arc::new(AsyncFd::new(socket)?);

        let (inbound_tx, inbound) = mpsc::channel(SocketConfig::depth(config.rx_messages));
        let (outbound, outbound_rx) = mpsc::channel(SocketConfig::depth(config.tx_messages));
        let (closer, closed) = CloseHandle::new();

        tokio::spawn(receive_loop(fd.clone(), inbound_tx, closed));
        tokio::spawn(transmit_loop(
            fd,
            outbound_rx,
            closer.subscribe(),
            Stamper::new(pid),
        ));

        debug!(pid, groups = ?config.groups, "netlink socket open");

        Ok(Self {
            outbound,
            inbound,
            pid,
            seq: SequenceCounter::new(),
            closer,
        })
    }

    /// Port id of sockets built by [`from_channels`](Self::from_channels).
    #[cfg(test)]
    pub(crate) const TEST_PID: u32 = 4242;

    /// Socket driven by in-memory queues instead of a kernel descriptor.
    ///
    /// Returns the socket, the receiver of everything it sends, and the
    /// sender feeding its inbound stream.
    #[cfg(test)]
    pub(crate) fn from_channels(
        depth: usize,
    ) -> (Self, mpsc::Receiver<Message>, mpsc::Sender<Message>) {
        let (outbound, sent) = mpsc::channel(depth);
        let (replies, inbound) = mpsc::channel(depth);
        let (closer, _) = CloseHandle::new();
        let socket = Self {
            outbound,
            inbound,
            pid: Self::TEST_PID,
            seq: SequenceCounter::new(),
            closer,
        };
        (socket, sent, replies)
    }

    /// Local port id assigned by the kernel.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Queue a message for transmission, waiting while the queue is full.
    ///
    /// A message without a sequence number gets the next one from this
    /// socket's counter; a preset one is kept. Returns the sequence number
    /// the message is sent with.
    pub async fn send(&self, mut msg: Message) -> Result<u32> {
        if self.closer.is_closed() {
            return Err(Error::Closed);
        }
        if msg.header.nlmsg_seq == 0 {
            msg.header.nlmsg_seq = self.seq.next();
        }
        let seq = msg.header.nlmsg_seq;
        self.outbound.send(msg).await.map_err(|_| Error::Closed)?;
        Ok(seq)
    }

    /// Next inbound message, or `None` at end-of-stream.
    pub async fn recv(&mut self) -> Option<Message> {
        if self.closer.is_closed() {
            return None;
        }
        self.inbound.recv().await
    }

    /// Close the socket. Fails with [`Error::Closed`] if already closed.
    pub fn close(&self) -> Result<()> {
        self.closer.close()
    }

    /// True once the socket has been closed.
    pub fn is_closed(&self) -> bool {
        self.closer.is_closed()
    }

    /// Handle for closing this socket from another task.
    pub fn close_handle(&self) -> CloseHandle {
        self.closer.clone()
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        let _ = self.closer.close();
    }
}

async fn receive_loop(
    fd: Arc<AsyncFd<netlink_sys::Socket>>,
    inbound: mpsc::Sender<Message>,
    mut closed: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; RECV_BUF_SIZE];
    let mut control = vec![0u8; CONTROL_BUF_SIZE];

    loop {
        let received = tokio::select! {
            r = recv_datagram(&fd, &mut buf, &mut control) => r,
            _ = closed.wait_for(|c| *c) => break,
        };

        let (len, nsid) = match received {
            Ok(v) => v,
            Err(e) if e.raw_os_error() == Some(libc::ENOBUFS) => {
                warn!("netlink receive overrun, messages lost");
                continue;
            }
            Err(e) => {
                error!(error = %e, "netlink receive failed");
                break;
            }
        };

        let datagram = Bytes::copy_from_slice(&buf[..len]);
        for msg in decode_datagram(&datagram, nsid) {
            trace!(msg_type = msg.msg_type(), seq = msg.seq(), ?nsid, "received");
            tokio::select! {
                r = inbound.send(msg) => {
                    if r.is_err() {
                        return;
                    }
                }
                _ = closed.wait_for(|c| *c) => return,
            }
        }
    }
}

async fn transmit_loop(
    fd: Arc<AsyncFd<netlink_sys::Socket>>,
    mut outbound: mpsc::Receiver<Message>,
    mut closed: watch::Receiver<bool>,
    stamper: Stamper,
) {
    loop {
        let mut msg = tokio::select! {
            m = outbound.recv() => match m {
                Some(m) => m,
                None => break,
            },
            _ = closed.wait_for(|c| *c) => break,
        };

        stamper.stamp(&mut msg.header);
        let bytes = msg.encode();
        let control = msg.nsid.map(encode_nsid_control);

        if let Err(e) = send_datagram(&fd, &bytes, control.as_deref()).await {
            error!(error = %e, seq = msg.seq(), msg_type = msg.msg_type(), "netlink send failed");
            break;
        }
        trace!(msg_type = msg.msg_type(), seq = msg.seq(), "sent");
    }
}

async fn recv_datagram(
    fd: &AsyncFd<netlink_sys::Socket>,
    buf: &mut [u8],
    control: &mut [u8],
) -> io::Result<(usize, Option<i32>)> {
    loop {
        let mut guard = fd.ready(Interest::READABLE).await?;

        match guard.try_io(|inner| recvmsg(inner.get_ref().as_raw_fd(), buf, control)) {
            Ok(result) => return result,
            Err(_would_block) => continue,
        }
    }
}

async fn send_datagram(
    fd: &AsyncFd<netlink_sys::Socket>,
    bytes: &[u8],
    control: Option<&[u8]>,
) -> io::Result<()> {
    loop {
        let mut guard = fd.ready(Interest::WRITABLE).await?;

        match guard.try_io(|inner| sendmsg(inner.get_ref().as_raw_fd(), bytes, control)) {
            Ok(result) => return result,
            Err(_would_block) => continue,
        }
    }
}

fn recvmsg(fd: RawFd, buf: &mut [u8], control: &mut [u8]) -> io::Result<(usize, Option<i32>)> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    // SAFETY: msghdr is plain old data; all-zero is an empty header.
    let mut hdr: libc::msghdr = unsafe { std::mem::zeroed() };
    hdr.msg_iov = &mut iov;
    hdr.msg_iovlen = 1;
    hdr.msg_control = control.as_mut_ptr().cast();
    hdr.msg_controllen = control.len() as _;

    // SAFETY: iov and control point at live buffers of the stated lengths.
    let n = unsafe { libc::recvmsg(fd, &mut hdr, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    if hdr.msg_flags & libc::MSG_TRUNC != 0 {
        warn!(len = n, "netlink datagram truncated");
    }

    let control_len = (hdr.msg_controllen as usize).min(control.len());
    Ok((n as usize, nsid_from_control(&control[..control_len])))
}

fn sendmsg(fd: RawFd, bytes: &[u8], control: Option<&[u8]>) -> io::Result<()> {
    let mut iov = libc::iovec {
        iov_base: bytes.as_ptr() as *mut libc::c_void,
        iov_len: bytes.len(),
    };
    // SAFETY: sockaddr_nl is plain old data; all-zero addresses the kernel.
    let mut kernel: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
    kernel.nl_family = libc::AF_NETLINK as libc::sa_family_t;

    // SAFETY: see above.
    let mut hdr: libc::msghdr = unsafe { std::mem::zeroed() };
    hdr.msg_name = (&mut kernel as *mut libc::sockaddr_nl).cast();
    hdr.msg_namelen = std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t;
    hdr.msg_iov = &mut iov;
    hdr.msg_iovlen = 1;

    let mut space = [0u8; NSID_CONTROL_SPACE];
    if let Some(control) = control {
        let len = control.len().min(space.len());
        space[..len].copy_from_slice(&control[..len]);
        hdr.msg_control = space.as_mut_ptr().cast();
        hdr.msg_controllen = len as _;
    }

    // SAFETY: every pointer in hdr refers to a local that outlives the call.
    let n = unsafe { libc::sendmsg(fd, &hdr, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn setsockopt_int(fd: RawFd, level: i32, name: i32, value: i32) -> io::Result<()> {
    // SAFETY: value is a live i32 and the length matches.
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            (&value as *const i32).cast(),
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn getsockopt_int(fd: RawFd, level: i32, name: i32) -> io::Result<i32> {
    let mut value: i32 = 0;
    let mut len = std::mem::size_of::<i32>() as libc::socklen_t;
    // SAFETY: value and len are live and sized for an i32 option.
    let ret = unsafe {
        libc::getsockopt(
            fd,
            level,
            name,
            (&mut value as *mut i32).cast(),
            &mut len,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(value)
}

/// Set a socket buffer and verify the kernel did not cap it.
pub(crate) fn negotiate_buffer(fd: RawFd, option: i32, requested: usize) -> Result<()> {
    if requested == 0 {
        return Ok(());
    }
    let (name, sysctl) = buffer_names(option);

    let value = i32::try_from(requested)
        .map_err(|_| Error::InvalidMessage(format!("{} of {} bytes too large", name, requested)))?;
    setsockopt_int(fd, libc::SOL_SOCKET, option, value)?;
    let actual = getsockopt_int(fd, libc::SOL_SOCKET, option)?.max(0) as usize;

    check_buffer(name, sysctl, actual, requested)
}

fn buffer_names(option: i32) -> (&'static str, &'static str) {
    if option == libc::SO_RCVBUF {
        ("SO_RCVBUF", "rmem_max")
    } else {
        ("SO_SNDBUF", "wmem_max")
    }
}

fn check_buffer(option: &'static str, sysctl: &'static str, actual: usize, requested: usize) -> Result<()> {
    if actual < requested {
        return Err(Error::BufferTruncated {
            option,
            actual,
            requested,
            sysctl,
        });
    }
    Ok(())
}
