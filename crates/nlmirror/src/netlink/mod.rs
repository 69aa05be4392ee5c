//! Async rtnetlink transport.
//!
//! This module covers the wire side: record framing and attributes, the
//! typed [`Message`] codec, the [`Socket`] with its receive and transmit
//! tasks, and the request/dump exchanges in [`dump`].
//!
//! # Quick Start
//!
//! ```ignore
//! use nlmirror::netlink::{Socket, SocketConfig, dump};
//!
//! let mut socket = Socket::open(&SocketConfig::default())?;
//! let mut handler = |msg| {
//!     println!("{:?}", msg);
//!     Ok(())
//! };
//! dump::listen(&mut socket, &mut handler, &[]).await?;
//! ```

pub mod attr;
mod builder;
pub mod codec;
pub mod dump;
mod error;
pub mod message;
mod socket;
pub mod types;

pub use attr::{Attr, Attrs};
pub use builder::MessageBuilder;
pub use codec::{
    AddrInfo, ErrorInfo, LinkInfo, Message, NamespaceInfo, NeighborInfo, Payload, RouteInfo,
    decode_datagram,
};
pub use dump::{DEFAULT_LISTEN_REQUESTS, ListenRequest, MAX_DUMP_ATTEMPTS, listen, rx_until_done};
pub use error::{Error, Result};
pub use message::{NLMSG_HDRLEN, NlMsgHdr, NlMsgType};
pub use socket::{CloseHandle, DEFAULT_QUEUE_DEPTH, Socket, SocketConfig};
pub(crate) use socket::negotiate_buffer;
pub use types::{RtnetlinkGroup, family};
