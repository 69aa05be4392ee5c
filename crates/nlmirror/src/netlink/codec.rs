//! Typed rtnetlink messages and the datagram codec.
//!
//! A received datagram holds one or more framed records. [`decode_datagram`]
//! turns each record into a [`Message`], classified by the header's type
//! code. Records of unknown types are dropped. A record that fails to decode
//! becomes a synthetic [`Payload::Error`] carrying the record's own header,
//! so one bad record never discards its neighbours.
//!
//! The namespace id carried in the datagram's ancillary data (see
//! [`nsid_from_control`]) is copied onto every message of that datagram.

use bytes::Bytes;
use tracing::{trace, warn};
use zerocopy::FromBytes;

use super::attr::{Attrs, get};
use super::builder::MessageBuilder;
use super::error::{Error, Result};
use super::message::{
    NLM_F_ACK, NLM_F_DUMP, NLM_F_REQUEST, NLMSG_HDRLEN, NlMsgError, NlMsgHdr, NlMsgType, RecordIter,
    nlmsg_align,
};
use super::types::{
    IFLA_IFNAME, IfAddrMsg, IfInfoMsg, NETNSA_NSID_NOT_ASSIGNED, NdMsg, RtGenMsg, RtMsg, netnsa,
};

/// Socket option level for netlink (SOL_NETLINK).
pub const SOL_NETLINK: i32 = 270;
/// Socket option and control message type (NETLINK_LISTEN_ALL_NSID).
pub const NETLINK_LISTEN_ALL_NSID: i32 = 8;

/// Interface info (RTM_{NEW,DEL,GET}LINK).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub header: IfInfoMsg,
    pub attrs: Attrs,
}

impl LinkInfo {
    /// Kernel interface index.
    pub fn index(&self) -> u32 {
        self.header.ifi_index as u32
    }

    /// Interface name from IFLA_IFNAME, if present and valid.
    pub fn name(&self) -> Option<&str> {
        self.attrs
            .get(IFLA_IFNAME)
            .and_then(|v| get::string(v).ok())
    }
}

/// Interface address (RTM_{NEW,DEL,GET}ADDR).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrInfo {
    pub header: IfAddrMsg,
    pub attrs: Attrs,
}

/// Route (RTM_{NEW,DEL,GET}ROUTE).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteInfo {
    pub header: RtMsg,
    pub attrs: Attrs,
}

/// Neighbor entry (RTM_{NEW,DEL,GET}NEIGH).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborInfo {
    pub header: NdMsg,
    pub attrs: Attrs,
}

/// Namespace id record (RTM_{NEW,DEL,GET}NSID).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceInfo {
    pub header: RtGenMsg,
    pub attrs: Attrs,
}

impl NamespaceInfo {
    /// The namespace id, `None` when the kernel reports it unassigned.
    pub fn nsid(&self) -> Option<i32> {
        self.attrs
            .get(netnsa::NSID)
            .and_then(|v| get::i32_ne(v).ok())
            .filter(|&id| id != NETNSA_NSID_NOT_ASSIGNED)
    }
}

/// Error or acknowledgement record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorInfo {
    /// Negative errno, or 0 for an ACK.
    pub errno: i32,
    /// Header of the request this record answers.
    pub request: NlMsgHdr,
}

impl ErrorInfo {
    /// True for an acknowledgement (errno 0).
    pub fn is_ack(&self) -> bool {
        self.errno == 0
    }
}

/// Message body, one variant per recognized message class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Noop,
    Error(ErrorInfo),
    Done,
    Link(LinkInfo),
    Addr(AddrInfo),
    Route(RouteInfo),
    Neighbor(NeighborInfo),
    Namespace(NamespaceInfo),
}

/// A decoded (or to-be-encoded) netlink message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: NlMsgHdr,
    /// Namespace id from the datagram's ancillary data. `None` means the
    /// receiving socket's own namespace. On send, `Some` attaches the tag.
    pub nsid: Option<i32>,
    pub payload: Payload,
}

fn body<T: FromBytes>(payload: &[u8], size: usize) -> Result<T> {
    T::read_from_prefix(payload)
        .map(|(v, _)| v)
        .map_err(|_| Error::Truncated {
            expected: size,
            actual: payload.len(),
        })
}

fn trailing_attrs(datagram: &Bytes, payload: &[u8], size: usize) -> Result<Attrs> {
    let start = nlmsg_align(size);
    if payload.len() <= start {
        return Ok(Attrs::new());
    }
    Attrs::parse(&datagram.slice_ref(&payload[start..]))
}

fn decode_payload(datagram: &Bytes, header: &NlMsgHdr, payload: &[u8]) -> Result<Option<Payload>> {
    let decoded = match header.nlmsg_type {
        NlMsgType::NOOP => Payload::Noop,
        NlMsgType::DONE => Payload::Done,
        NlMsgType::ERROR => {
            if payload.len() < 4 {
                return Err(Error::Truncated {
                    expected: 4,
                    actual: payload.len(),
                });
            }
            let errno = get::i32_ne(payload)?;
            let request = NlMsgHdr::parse(&payload[4..]).unwrap_or_default();
            Payload::Error(ErrorInfo { errno, request })
        }
        NlMsgType::RTM_NEWLINK | NlMsgType::RTM_DELLINK | NlMsgType::RTM_GETLINK => {
            Payload::Link(LinkInfo {
                header: body(payload, IfInfoMsg::SIZE)?,
                attrs: trailing_attrs(datagram, payload, IfInfoMsg::SIZE)?,
            })
        }
        NlMsgType::RTM_NEWADDR | NlMsgType::RTM_DELADDR | NlMsgType::RTM_GETADDR => {
            Payload::Addr(AddrInfo {
                header: body(payload, IfAddrMsg::SIZE)?,
                attrs: trailing_attrs(datagram, payload, IfAddrMsg::SIZE)?,
            })
        }
        NlMsgType::RTM_NEWROUTE | NlMsgType::RTM_DELROUTE | NlMsgType::RTM_GETROUTE => {
            Payload::Route(RouteInfo {
                header: body(payload, RtMsg::SIZE)?,
                attrs: trailing_attrs(datagram, payload, RtMsg::SIZE)?,
            })
        }
        NlMsgType::RTM_NEWNEIGH | NlMsgType::RTM_DELNEIGH | NlMsgType::RTM_GETNEIGH => {
            Payload::Neighbor(NeighborInfo {
                header: body(payload, NdMsg::SIZE)?,
                attrs: trailing_attrs(datagram, payload, NdMsg::SIZE)?,
            })
        }
        NlMsgType::RTM_NEWNSID | NlMsgType::RTM_DELNSID | NlMsgType::RTM_GETNSID => {
            Payload::Namespace(NamespaceInfo {
                header: body(payload, RtGenMsg::SIZE)?,
                attrs: trailing_attrs(datagram, payload, RtGenMsg::SIZE)?,
            })
        }
        _ => return Ok(None),
    };
    Ok(Some(decoded))
}

/// Decode every record of a datagram.
pub fn decode_datagram(datagram: &Bytes, nsid: Option<i32>) -> Vec<Message> {
    let mut messages = Vec::new();

    for record in RecordIter::new(datagram) {
        match record {
            Ok(record) => match decode_payload(datagram, &record.header, record.payload) {
                Ok(Some(payload)) => messages.push(Message {
                    header: record.header,
                    nsid,
                    payload,
                }),
                Ok(None) => {
                    trace!(msg_type = record.header.nlmsg_type, "dropping unknown message type");
                }
                Err(e) => {
                    trace!(seq = record.header.nlmsg_seq, error = %e, "record failed to decode");
                    messages.push(Message::decode_failure(record.header, nsid));
                }
            },
            Err((Some(header), e)) => {
                warn!(seq = header.nlmsg_seq, error = %e, "truncated record");
                messages.push(Message::decode_failure(header, nsid));
            }
            Err((None, e)) => {
                warn!(error = %e, "trailing bytes in datagram");
            }
        }
    }

    messages
}

impl Message {
    /// Wrap a payload in a header of the given type with no flags set.
    pub fn new(msg_type: u16, payload: Payload) -> Self {
        Self {
            header: NlMsgHdr::new(msg_type, 0),
            nsid: None,
            payload,
        }
    }

    /// Synthetic error standing in for a record that could not be decoded.
    pub fn decode_failure(original: NlMsgHdr, nsid: Option<i32>) -> Self {
        Self {
            header: NlMsgHdr {
                nlmsg_len: (NLMSG_HDRLEN + std::mem::size_of::<NlMsgError>()) as u32,
                nlmsg_type: NlMsgType::ERROR,
                ..original
            },
            nsid,
            payload: Payload::Error(ErrorInfo {
                errno: -libc::EINVAL,
                request: original,
            }),
        }
    }

    /// Empty request of the given type for an address family.
    pub fn request(msg_type: u16, flags: u16, family: u8) -> Result<Self> {
        let payload = match msg_type {
            NlMsgType::RTM_GETLINK | NlMsgType::RTM_NEWLINK | NlMsgType::RTM_DELLINK => {
                Payload::Link(LinkInfo {
                    header: IfInfoMsg {
                        ifi_family: family,
                        ..Default::default()
                    },
                    attrs: Attrs::new(),
                })
            }
            NlMsgType::RTM_GETADDR | NlMsgType::RTM_NEWADDR | NlMsgType::RTM_DELADDR => {
                Payload::Addr(AddrInfo {
                    header: IfAddrMsg {
                        ifa_family: family,
                        ..Default::default()
                    },
                    attrs: Attrs::new(),
                })
            }
            NlMsgType::RTM_GETROUTE | NlMsgType::RTM_NEWROUTE | NlMsgType::RTM_DELROUTE => {
                Payload::Route(RouteInfo {
                    header: RtMsg {
                        rtm_family: family,
                        ..Default::default()
                    },
                    attrs: Attrs::new(),
                })
            }
            NlMsgType::RTM_GETNEIGH | NlMsgType::RTM_NEWNEIGH | NlMsgType::RTM_DELNEIGH => {
                Payload::Neighbor(NeighborInfo {
                    header: NdMsg {
                        ndm_family: family,
                        ..Default::default()
                    },
                    attrs: Attrs::new(),
                })
            }
            NlMsgType::RTM_GETNSID | NlMsgType::RTM_NEWNSID | NlMsgType::RTM_DELNSID => {
                Payload::Namespace(NamespaceInfo {
                    header: RtGenMsg {
                        rtgen_family: family,
                    },
                    attrs: Attrs::new(),
                })
            }
            other => {
                return Err(Error::InvalidMessage(format!(
                    "no request body for message type {}",
                    other
                )));
            }
        };
        let mut msg = Self::new(msg_type, payload);
        msg.header.nlmsg_flags = flags;
        Ok(msg)
    }

    /// Dump request (request + dump flags) for `(msg_type, family)`.
    pub fn dump_request(msg_type: u16, family: u8) -> Result<Self> {
        Self::request(msg_type, NLM_F_REQUEST | NLM_F_DUMP, family)
    }

    /// RTM_GETNSID request asking for the id of the namespace behind `fd`.
    ///
    /// The acknowledgement terminates the reply stream.
    pub fn get_nsid(fd: u32) -> Self {
        let mut attrs = Attrs::new();
        attrs.push(netnsa::FD, fd.to_ne_bytes().to_vec());
        let mut msg = Self::new(
            NlMsgType::RTM_GETNSID,
            Payload::Namespace(NamespaceInfo {
                header: RtGenMsg::default(),
                attrs,
            }),
        );
        msg.header.nlmsg_flags = NLM_F_REQUEST | NLM_F_ACK;
        msg
    }

    /// Message type code.
    pub fn msg_type(&self) -> u16 {
        self.header.nlmsg_type
    }

    /// Sequence number.
    pub fn seq(&self) -> u32 {
        self.header.nlmsg_seq
    }

    /// True for Done and Error records, which end a reply stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self.payload, Payload::Done | Payload::Error(_))
    }

    /// Serialize to wire bytes. The header length is recomputed.
    pub fn encode(&self) -> Vec<u8> {
        let mut builder = MessageBuilder::with_header(self.header);
        let attrs = match &self.payload {
            Payload::Noop | Payload::Done => None,
            Payload::Error(info) => {
                builder.append(&NlMsgError {
                    error: info.errno,
                    msg: info.request,
                });
                None
            }
            Payload::Link(m) => {
                builder.append(&m.header);
                Some(&m.attrs)
            }
            Payload::Addr(m) => {
                builder.append(&m.header);
                Some(&m.attrs)
            }
            Payload::Route(m) => {
                builder.append(&m.header);
                Some(&m.attrs)
            }
            Payload::Neighbor(m) => {
                builder.append(&m.header);
                Some(&m.attrs)
            }
            Payload::Namespace(m) => {
                builder.append(&m.header);
                Some(&m.attrs)
            }
        };
        for attr in attrs.into_iter().flatten() {
            builder.append_attr(attr.kind, &attr.value);
        }
        builder.finish()
    }
}

fn cmsg_len(data: usize) -> usize {
    // SAFETY: CMSG_LEN is pure arithmetic on its argument.
    unsafe { libc::CMSG_LEN(data as libc::c_uint) as usize }
}

fn cmsg_space(data: usize) -> usize {
    // SAFETY: CMSG_SPACE is pure arithmetic on its argument.
    unsafe { libc::CMSG_SPACE(data as libc::c_uint) as usize }
}

/// Size of a control buffer holding one namespace id (CMSG_SPACE(4)).
// SAFETY: CMSG_SPACE is pure arithmetic on its argument.
pub const NSID_CONTROL_SPACE: usize =
    unsafe { libc::CMSG_SPACE(std::mem::size_of::<i32>() as libc::c_uint) } as usize;

/// Extract the NETLINK_LISTEN_ALL_NSID namespace id from control data.
pub fn nsid_from_control(control: &[u8]) -> Option<i32> {
    let data_offset = cmsg_len(0);
    let mut offset = 0;

    while control.len() - offset >= std::mem::size_of::<libc::cmsghdr>() {
        // SAFETY: at least one cmsghdr worth of bytes remains at `offset`,
        // and read_unaligned places no alignment requirement on the source.
        let cmsg: libc::cmsghdr =
            unsafe { std::ptr::read_unaligned(control[offset..].as_ptr().cast()) };
        let len = cmsg.cmsg_len as usize;

        if len < data_offset || len > control.len() - offset {
            return None;
        }
        if cmsg.cmsg_level == SOL_NETLINK
            && cmsg.cmsg_type == NETLINK_LISTEN_ALL_NSID
            && len >= cmsg_len(std::mem::size_of::<i32>())
        {
            return get::i32_ne(&control[offset + data_offset..]).ok();
        }

        offset += cmsg_space(len - data_offset);
        if offset >= control.len() {
            break;
        }
    }

    None
}

/// Build the control data tagging an outgoing datagram with `nsid`.
pub fn encode_nsid_control(nsid: i32) -> Vec<u8> {
    let mut buf = vec![0u8; NSID_CONTROL_SPACE];

    // SAFETY: msghdr and cmsghdr are plain old data; all-zero is valid.
    let mut hdr: libc::msghdr = unsafe { std::mem::zeroed() };
    hdr.msg_control = buf.as_mut_ptr().cast();
    hdr.msg_controllen = buf.len() as _;

    // SAFETY: see above.
    let mut cmsg: libc::cmsghdr = unsafe { std::mem::zeroed() };
    cmsg.cmsg_len = cmsg_len(std::mem::size_of::<i32>()) as _;
    cmsg.cmsg_level = SOL_NETLINK;
    cmsg.cmsg_type = NETLINK_LISTEN_ALL_NSID;

    // SAFETY: buf holds CMSG_SPACE(4) bytes, so CMSG_FIRSTHDR is non-null
    // and both the header and its 4-byte payload fit. The writes are
    // unaligned because buf is a byte buffer.
    unsafe {
        let first = libc::CMSG_FIRSTHDR(&hdr);
        std::ptr::write_unaligned(first, cmsg);
        std::ptr::write_unaligned(libc::CMSG_DATA(first).cast::<i32>(), nsid);
    }
    buf
}
