//! Fixed-size kernel message bodies and rtnetlink constants.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::error::{Error, Result};

/// Address families used by the mirrored message kinds.
pub mod family {
    pub const AF_UNSPEC: u8 = 0;
    pub const AF_INET: u8 = 2;
    pub const AF_INET6: u8 = 10;
    pub const AF_PACKET: u8 = 17;
}

/// Interface name attribute (IFLA_IFNAME).
pub const IFLA_IFNAME: u16 = 3;

/// Netlink namespace ID message attributes (NETNSA_*).
pub mod netnsa {
    /// Namespace ID (i32, -1 when unassigned).
    pub const NSID: u16 = 1;
    /// File descriptor (u32).
    pub const FD: u16 = 3;
}

/// Value the kernel reports for a namespace without an assigned id.
pub const NETNSA_NSID_NOT_ASSIGNED: i32 = -1;

macro_rules! kernel_struct {
    ($name:ident) => {
        impl $name {
            /// Size of this structure.
            pub const SIZE: usize = std::mem::size_of::<Self>();

            /// Convert to bytes.
            pub fn as_bytes(&self) -> &[u8] {
                <Self as IntoBytes>::as_bytes(self)
            }

            /// Copy out of the front of `data`.
            pub fn parse(data: &[u8]) -> Result<Self> {
                Self::read_from_prefix(data)
                    .map(|(v, _)| v)
                    .map_err(|_| Error::Truncated {
                        expected: Self::SIZE,
                        actual: data.len(),
                    })
            }
        }
    };
}

/// Interface info message (struct ifinfomsg).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct IfInfoMsg {
    /// Address family.
    pub ifi_family: u8,
    /// Padding.
    pub ifi_pad: u8,
    /// Device type (ARPHRD_*).
    pub ifi_type: u16,
    /// Interface index.
    pub ifi_index: i32,
    /// Device flags (IFF_*).
    pub ifi_flags: u32,
    /// Change mask.
    pub ifi_change: u32,
}

kernel_struct!(IfInfoMsg);

/// Interface address message (struct ifaddrmsg).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct IfAddrMsg {
    pub ifa_family: u8,
    pub ifa_prefixlen: u8,
    pub ifa_flags: u8,
    pub ifa_scope: u8,
    pub ifa_index: u32,
}

kernel_struct!(IfAddrMsg);

/// Route message (struct rtmsg).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct RtMsg {
    pub rtm_family: u8,
    pub rtm_dst_len: u8,
    pub rtm_src_len: u8,
    pub rtm_tos: u8,
    pub rtm_table: u8,
    pub rtm_protocol: u8,
    pub rtm_scope: u8,
    pub rtm_type: u8,
    pub rtm_flags: u32,
}

kernel_struct!(RtMsg);

/// Neighbor message (struct ndmsg).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NdMsg {
    pub ndm_family: u8,
    pub ndm_pad1: u8,
    pub ndm_pad2: u16,
    pub ndm_ifindex: i32,
    pub ndm_state: u16,
    pub ndm_flags: u8,
    pub ndm_type: u8,
}

kernel_struct!(NdMsg);

/// rtgenmsg structure, the header of RTM_*NSID messages.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct RtGenMsg {
    /// Address family (usually AF_UNSPEC).
    pub rtgen_family: u8,
}

kernel_struct!(RtGenMsg);

impl RtGenMsg {
    /// Size on the wire: 1 byte + 3 bytes padding.
    pub const fn padded_size() -> usize {
        4
    }
}

/// Multicast groups for NETLINK_ROUTE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RtnetlinkGroup {
    Link = 1,
    Neigh = 3,
    Ipv4Ifaddr = 5,
    Ipv4Mroute = 6,
    Ipv4Route = 7,
    Ipv6Ifaddr = 9,
    Ipv6Mroute = 10,
    Ipv6Route = 11,
    Nsid = 28,
}

impl RtnetlinkGroup {
    /// Groups an events socket joins unless configured otherwise.
    pub const DEFAULT: [RtnetlinkGroup; 9] = [
        Self::Link,
        Self::Neigh,
        Self::Ipv4Ifaddr,
        Self::Ipv6Ifaddr,
        Self::Ipv4Route,
        Self::Ipv6Route,
        Self::Ipv4Mroute,
        Self::Ipv6Mroute,
        Self::Nsid,
    ];

    /// Group number as used by NETLINK_ADD_MEMBERSHIP.
    pub fn number(self) -> u32 {
        self as u32
    }

    /// Combined legacy bind mask (RTMGRP_*) for a group list.
    pub fn mask(groups: &[RtnetlinkGroup]) -> u32 {
        groups.iter().fold(0, |m, g| m | (1 << (g.number() - 1)))
    }
}
