//! Socket and dump tests inside a fresh namespace.

use nlmirror::Result;
use nlmirror::namespace::netns::{self, DEFAULT_PACKET_SNDBUF, DEFAULT_SWITCH_WINDOW};
use nlmirror::netlink::{
    ListenRequest, Message, NlMsgType, Payload, Socket, SocketConfig, family, listen,
};

use crate::common::TestNamespace;

fn open_in(ns: &TestNamespace, config: &SocketConfig) -> Result<Socket> {
    let (_handle, sockets) =
        netns::allocate_in(&ns.path(), DEFAULT_SWITCH_WINDOW, DEFAULT_PACKET_SNDBUF)?;
    Socket::from_netlink(sockets.events, config)
}

async fn link_names(socket: &mut Socket) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut handler = |msg: Message| -> Result<()> {
        if let Payload::Link(link) = &msg.payload
            && let Some(name) = link.name()
        {
            names.push(name.to_string());
        }
        Ok(())
    };
    let requests = [ListenRequest::new(NlMsgType::RTM_GETLINK, family::AF_PACKET)];
    listen(socket, &mut handler, &requests).await?;
    Ok(names)
}

#[tokio::test]
async fn test_link_dump_in_namespace() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("dump")?;
    ns.add_dummy("dummy0")?;

    let mut socket = open_in(&ns, &SocketConfig::request())?;
    let names = link_names(&mut socket).await?;

    assert!(names.iter().any(|n| n == "lo"));
    assert!(names.iter().any(|n| n == "dummy0"));
    // Only this namespace's links: a fresh namespace has nothing else.
    assert_eq!(names.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_default_listen_completes() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("listen")?;
    let mut socket = open_in(&ns, &SocketConfig::default())?;

    let mut count = 0usize;
    let mut handler = |_: Message| -> Result<()> {
        count += 1;
        Ok(())
    };
    listen(&mut socket, &mut handler, &[]).await?;
    assert!(count >= 1);
    Ok(())
}

#[tokio::test]
async fn test_link_event_after_dump() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("events")?;
    let mut socket = open_in(&ns, &SocketConfig::default())?;
    link_names(&mut socket).await?;

    ns.add_dummy("dummy1")?;

    let found = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while let Some(msg) = socket.recv().await {
            if let Payload::Link(link) = &msg.payload
                && msg.msg_type() == NlMsgType::RTM_NEWLINK
                && link.name() == Some("dummy1")
            {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    assert!(found, "expected RTM_NEWLINK for dummy1");
    Ok(())
}

#[tokio::test]
async fn test_close_ends_receive() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("close")?;
    let mut socket = open_in(&ns, &SocketConfig::default())?;
    socket.close()?;
    assert!(socket.recv().await.is_none());
    assert!(socket.close().is_err());
    Ok(())
}
