//! Request/drain exchanges and bulk state enumeration.

use tracing::{debug, trace, warn};

use super::codec::{Message, Payload};
use super::error::{Error, Result};
use super::message::NlMsgType;
use super::socket::Socket;
use super::types::family;

/// Total attempts per dump request before giving up.
pub const MAX_DUMP_ATTEMPTS: usize = 5;

/// One dump target: message type and address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenRequest {
    pub msg_type: u16,
    pub family: u8,
}

impl ListenRequest {
    pub const fn new(msg_type: u16, family: u8) -> Self {
        Self { msg_type, family }
    }
}

/// Dumps issued when no explicit list is given.
pub const DEFAULT_LISTEN_REQUESTS: [ListenRequest; 8] = [
    ListenRequest::new(NlMsgType::RTM_GETNSID, family::AF_UNSPEC),
    ListenRequest::new(NlMsgType::RTM_GETLINK, family::AF_PACKET),
    ListenRequest::new(NlMsgType::RTM_GETADDR, family::AF_INET),
    ListenRequest::new(NlMsgType::RTM_GETADDR, family::AF_INET6),
    ListenRequest::new(NlMsgType::RTM_GETNEIGH, family::AF_INET),
    ListenRequest::new(NlMsgType::RTM_GETNEIGH, family::AF_INET6),
    ListenRequest::new(NlMsgType::RTM_GETROUTE, family::AF_INET),
    ListenRequest::new(NlMsgType::RTM_GETROUTE, family::AF_INET6),
];

/// Drain `socket` until the terminal record answering request `seq`.
///
/// Non-terminal messages go to `handler` in arrival order. Done, or an
/// Error record with errno 0 (ACK), ends the drain successfully; a nonzero
/// errno is returned as [`Error::Kernel`]. A handler error stops the drain
/// at once. End-of-stream yields [`Error::Closed`].
///
/// Replies to earlier requests on this socket, such as the tail of an
/// abandoned dump, are skipped: terminals whose sequence number is not
/// `seq`, and data addressed to this socket's port under another sequence
/// number. Notifications from other ports pass through to `handler`.
pub async fn rx_until_done<F>(socket: &mut Socket, seq: u32, handler: &mut F) -> Result<()>
where
    F: FnMut(Message) -> Result<()>,
{
    loop {
        let msg = socket.recv().await.ok_or(Error::Closed)?;
        if msg.seq() != seq && (msg.is_terminal() || msg.header.nlmsg_pid == socket.pid()) {
            trace!(seq = msg.seq(), expected = seq, msg_type = msg.msg_type(), "skipping stale reply");
            continue;
        }
        match msg.payload {
            Payload::Done => return Ok(()),
            Payload::Error(info) if info.is_ack() => return Ok(()),
            Payload::Error(info) => return Err(Error::from_errno(info.errno)),
            _ => handler(msg)?,
        }
    }
}

/// Enumerate kernel state through `socket`.
///
/// Each request is sent as a dump and drained with [`rx_until_done`]; a
/// failed drain is retried with a fresh request up to
/// [`MAX_DUMP_ATTEMPTS`] times in total. An empty `requests` slice means
/// [`DEFAULT_LISTEN_REQUESTS`]. No-op requests are skipped.
pub async fn listen<F>(socket: &mut Socket, handler: &mut F, requests: &[ListenRequest]) -> Result<()>
where
    F: FnMut(Message) -> Result<()>,
{
    let requests = if requests.is_empty() {
        &DEFAULT_LISTEN_REQUESTS[..]
    } else {
        requests
    };

    for request in requests {
        if request.msg_type == NlMsgType::NOOP {
            continue;
        }
        dump_with_retry(socket, handler, request).await?;
    }
    Ok(())
}

async fn dump_with_retry<F>(socket: &mut Socket, handler: &mut F, request: &ListenRequest) -> Result<()>
where
    F: FnMut(Message) -> Result<()>,
{
    let mut attempt = 1;
    loop {
        let msg = Message::dump_request(request.msg_type, request.family)?;
        let result = match socket.send(msg).await {
            Ok(seq) => rx_until_done(socket, seq, handler).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                debug!(msg_type = request.msg_type, family = request.family, "dump complete");
                return Ok(());
            }
            Err(e) if attempt < MAX_DUMP_ATTEMPTS => {
                warn!(
                    msg_type = request.msg_type,
                    family = request.family,
                    attempt,
                    error = %e,
                    "dump failed, retrying"
                );
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::attr::Attrs;
    use crate::netlink::codec::{AddrInfo, ErrorInfo, LinkInfo};
    use crate::netlink::message::{NLM_F_DUMP, NLM_F_REQUEST, NlMsgHdr};
    use crate::netlink::types::{IfAddrMsg, IfInfoMsg};

    fn reply(seq: u32, msg_type: u16, payload: Payload) -> Message {
        let mut msg = Message::new(msg_type, payload);
        msg.header.nlmsg_seq = seq;
        msg.header.nlmsg_pid = Socket::TEST_PID;
        msg
    }

    fn link(seq: u32, index: i32) -> Message {
        reply(
            seq,
            NlMsgType::RTM_NEWLINK,
            Payload::Link(LinkInfo {
                header: IfInfoMsg {
                    ifi_index: index,
                    ..Default::default()
                },
                attrs: Attrs::new(),
            }),
        )
    }

    fn addr(seq: u32, index: u32) -> Message {
        reply(
            seq,
            NlMsgType::RTM_NEWADDR,
            Payload::Addr(AddrInfo {
                header: IfAddrMsg {
                    ifa_index: index,
                    ..Default::default()
                },
                attrs: Attrs::new(),
            }),
        )
    }

    fn error(seq: u32, errno: i32) -> Message {
        reply(
            seq,
            NlMsgType::ERROR,
            Payload::Error(ErrorInfo {
                errno,
                request: NlMsgHdr::default(),
            }),
        )
    }

    fn done(seq: u32) -> Message {
        reply(seq, NlMsgType::DONE, Payload::Done)
    }

    fn index_of(msg: &Message) -> i32 {
        match &msg.payload {
            Payload::Link(info) => info.header.ifi_index,
            other => panic!("unexpected payload {:?}", other),
        }
    }

    const LINKS: [ListenRequest; 1] = [ListenRequest::new(NlMsgType::RTM_GETLINK, family::AF_PACKET)];

    #[tokio::test]
    async fn test_listen_delivers_in_order() {
        let (mut socket, mut sent, replies) = Socket::from_channels(16);
        for msg in [link(1, 1), link(1, 2), link(1, 3), done(1)] {
            replies.send(msg).await.unwrap();
        }

        let mut seen = Vec::new();
        let mut handler = |msg: Message| -> Result<()> {
            seen.push(index_of(&msg));
            Ok(())
        };
        listen(&mut socket, &mut handler, &LINKS).await.unwrap();
        assert_eq!(seen, vec![1, 2, 3]);

        let request = sent.recv().await.unwrap();
        assert_eq!(request.msg_type(), NlMsgType::RTM_GETLINK);
        assert_eq!(request.header.nlmsg_flags, NLM_F_REQUEST | NLM_F_DUMP);
        assert_eq!(request.seq(), 1);
    }

    #[tokio::test]
    async fn test_kernel_error_stops_delivery() {
        let (mut socket, _sent, replies) = Socket::from_channels(16);
        for msg in [link(1, 1), error(1, -libc::EBUSY), link(1, 2)] {
            replies.send(msg).await.unwrap();
        }

        let mut seen = Vec::new();
        let mut handler = |msg: Message| -> Result<()> {
            seen.push(index_of(&msg));
            Ok(())
        };
        let err = rx_until_done(&mut socket, 1, &mut handler).await.unwrap_err();
        assert_eq!(err.errno(), Some(libc::EBUSY));
        assert_eq!(seen, vec![1]);
    }

    #[tokio::test]
    async fn test_ack_ends_drain() {
        let (mut socket, _sent, replies) = Socket::from_channels(4);
        replies.send(error(6, 0)).await.unwrap();
        let mut handler = |_: Message| -> Result<()> { Ok(()) };
        assert!(rx_until_done(&mut socket, 6, &mut handler).await.is_ok());
    }

    #[tokio::test]
    async fn test_handler_error_stops_drain() {
        let (mut socket, _sent, replies) = Socket::from_channels(4);
        for msg in [link(1, 1), link(1, 2), done(1)] {
            replies.send(msg).await.unwrap();
        }

        let mut calls = 0;
        let mut handler = |_: Message| -> Result<()> {
            calls += 1;
            Err(Error::InvalidMessage("rejected".into()))
        };
        let err = rx_until_done(&mut socket, 1, &mut handler).await.unwrap_err();
        assert!(matches!(err, Error::InvalidMessage(_)));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_terminal_of_other_request_is_skipped() {
        let (mut socket, _sent, replies) = Socket::from_channels(8);
        for msg in [done(7), error(8, -libc::EBUSY), link(4, 9), link(5, 3), done(5)] {
            replies.send(msg).await.unwrap();
        }

        let mut seen = Vec::new();
        let mut handler = |msg: Message| -> Result<()> {
            seen.push(index_of(&msg));
            Ok(())
        };
        rx_until_done(&mut socket, 5, &mut handler).await.unwrap();
        assert_eq!(seen, vec![3]);
    }

    #[tokio::test]
    async fn test_notification_during_drain_is_delivered() {
        let (mut socket, _sent, replies) = Socket::from_channels(8);
        // Multicast notifications carry the originating port and its
        // sequence number, not ours.
        let mut event = link(31, 7);
        event.header.nlmsg_pid = 0;
        let mut foreign = link(2, 8);
        foreign.header.nlmsg_pid = 999;
        for msg in [link(1, 1), event, foreign, link(1, 2), done(1)] {
            replies.send(msg).await.unwrap();
        }

        let mut seen = Vec::new();
        let mut handler = |msg: Message| -> Result<()> {
            seen.push(index_of(&msg));
            Ok(())
        };
        rx_until_done(&mut socket, 1, &mut handler).await.unwrap();
        assert_eq!(seen, vec![1, 7, 8, 2]);
    }

    #[tokio::test]
    async fn test_retry_skips_abandoned_dump() {
        let (mut socket, mut sent, replies) = Socket::from_channels(16);
        // Attempt 1 fails mid-dump; the rest of it is still queued when
        // attempt 2 starts.
        let queued = [
            link(1, 1),
            error(1, -libc::EINVAL),
            link(1, 2),
            done(1),
            link(2, 1),
            link(2, 2),
            done(2),
            addr(3, 1),
            done(3),
        ];
        for msg in queued {
            replies.send(msg).await.unwrap();
        }

        let requests = [
            ListenRequest::new(NlMsgType::RTM_GETLINK, family::AF_PACKET),
            ListenRequest::new(NlMsgType::RTM_GETADDR, family::AF_INET),
        ];
        let mut delivered = Vec::new();
        let mut handler = |msg: Message| -> Result<()> {
            delivered.push((msg.msg_type(), msg.seq()));
            Ok(())
        };
        listen(&mut socket, &mut handler, &requests).await.unwrap();

        assert_eq!(
            delivered,
            vec![
                (NlMsgType::RTM_NEWLINK, 1),
                (NlMsgType::RTM_NEWLINK, 2),
                (NlMsgType::RTM_NEWLINK, 2),
                (NlMsgType::RTM_NEWADDR, 3),
            ]
        );

        let mut issued = Vec::new();
        while let Ok(msg) = sent.try_recv() {
            issued.push((msg.msg_type(), msg.seq()));
        }
        assert_eq!(
            issued,
            vec![
                (NlMsgType::RTM_GETLINK, 1),
                (NlMsgType::RTM_GETLINK, 2),
                (NlMsgType::RTM_GETADDR, 3),
            ]
        );

        // Nothing of the address dump is left behind.
        let leftover = tokio::time::timeout(std::time::Duration::from_millis(20), socket.recv()).await;
        assert!(leftover.is_err());
    }

    #[tokio::test]
    async fn test_retries_exhausted_after_five_attempts() {
        let (mut socket, mut sent, replies) = Socket::from_channels(16);
        for seq in 1..=MAX_DUMP_ATTEMPTS as u32 {
            replies.send(error(seq, -libc::EBUSY)).await.unwrap();
        }

        let mut handler = |_: Message| -> Result<()> { Ok(()) };
        let err = listen(&mut socket, &mut handler, &LINKS).await.unwrap_err();
        assert_eq!(err.errno(), Some(libc::EBUSY));

        let mut attempts = 0;
        while let Ok(msg) = sent.try_recv() {
            assert_eq!(msg.msg_type(), NlMsgType::RTM_GETLINK);
            attempts += 1;
        }
        assert_eq!(attempts, MAX_DUMP_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_retry_recovers() {
        let (mut socket, mut sent, replies) = Socket::from_channels(16);
        for msg in [error(1, -libc::EBUSY), link(2, 5), done(2)] {
            replies.send(msg).await.unwrap();
        }

        let mut seen = Vec::new();
        let mut handler = |msg: Message| -> Result<()> {
            seen.push(index_of(&msg));
            Ok(())
        };
        listen(&mut socket, &mut handler, &LINKS).await.unwrap();
        assert_eq!(seen, vec![5]);

        let mut attempts = 0;
        while sent.try_recv().is_ok() {
            attempts += 1;
        }
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn test_default_requests_and_noop_skip() {
        let (mut socket, mut sent, replies) = Socket::from_channels(16);
        for seq in 1..=DEFAULT_LISTEN_REQUESTS.len() as u32 {
            replies.send(done(seq)).await.unwrap();
        }

        let mut handler = |_: Message| -> Result<()> { Ok(()) };
        listen(&mut socket, &mut handler, &[]).await.unwrap();

        let mut issued = Vec::new();
        while let Ok(msg) = sent.try_recv() {
            issued.push(msg.msg_type());
        }
        let expected: Vec<u16> = DEFAULT_LISTEN_REQUESTS.iter().map(|r| r.msg_type).collect();
        assert_eq!(issued, expected);

        let requests = [
            ListenRequest::new(NlMsgType::NOOP, family::AF_UNSPEC),
            ListenRequest::new(NlMsgType::RTM_GETLINK, family::AF_PACKET),
        ];
        replies
            .send(done(DEFAULT_LISTEN_REQUESTS.len() as u32 + 1))
            .await
            .unwrap();
        listen(&mut socket, &mut handler, &requests).await.unwrap();
        assert_eq!(sent.try_recv().unwrap().msg_type(), NlMsgType::RTM_GETLINK);
        assert!(sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_end_of_stream_is_closed() {
        let (mut socket, _sent, replies) = Socket::from_channels(4);
        drop(replies);
        let mut handler = |_: Message| -> Result<()> { Ok(()) };
        let err = rx_until_done(&mut socket, 1, &mut handler).await.unwrap_err();
        assert!(matches!(err, Error::Closed));
    }
}
