//! Nodes and a rendezvous server talking over loopback sockets

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use peerchat::peer::{ChatEvent, KeepaliveConfig, Node, NodeConfig};
use peerchat::protocol::{opcode, Frame};
use peerchat::reactor::ReactorConfig;
use peerchat::rendezvous::RendezvousServer;

fn start_node(name: &str, keepalive: KeepaliveConfig) -> (Node, mpsc::UnboundedReceiver<ChatEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let config = NodeConfig {
        name: name.to_string(),
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        keepalive,
        rendezvous_timeout: Duration::from_secs(2),
        ..Default::default()
    };
    (Node::start(config, Arc::new(tx)).unwrap(), rx)
}

/// Skip events until one matches
async fn wait_for<F>(rx: &mut mpsc::UnboundedReceiver<ChatEvent>, mut pred: F) -> ChatEvent
where
    F: FnMut(&ChatEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event stream closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn joined(rx: &mut mpsc::UnboundedReceiver<ChatEvent>, name: &str) {
    wait_for(rx, |e| matches!(e, ChatEvent::PeerJoined(p) if p.name == name)).await;
}

fn stop(node: Node) {
    node.shutdown();
    node.join().unwrap();
}

#[tokio::test]
async fn test_register_list_dial_and_chat() {
    let server = RendezvousServer::start("127.0.0.1:0".parse().unwrap(), ReactorConfig::default()).unwrap();
    let rv_port = server.local_addr().port();

    let (xena, mut xena_rx) = start_node("xena", KeepaliveConfig::default());
    let (yuri, mut yuri_rx) = start_node("yuri", KeepaliveConfig::default());

    assert!(xena.register_self_with_rendezvous("127.0.0.1", rv_port).await);
    for _ in 0..200 {
        if !server.entries().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let listed = yuri.list_peers_from_rendezvous("127.0.0.1", rv_port).await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].port, xena.local_addr().port());

    let target = listed[0].socket_addr();
    yuri.connect_to(&target.ip().to_string(), target.port()).await.unwrap();

    joined(&mut xena_rx, "yuri").await;
    joined(&mut yuri_rx, "xena").await;

    yuri.send_text("hi", None).unwrap();
    let event = wait_for(&mut xena_rx, |e| matches!(e, ChatEvent::Message { .. })).await;
    assert_eq!(
        event,
        ChatEvent::Message {
            from: "yuri".to_string(),
            text: "hi".to_string(),
        }
    );

    let peers = xena.peers();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].port, yuri.local_addr().port());

    stop(yuri);
    wait_for(&mut xena_rx, |e| {
        matches!(e, ChatEvent::PeerLeft { peer, timed_out: false } if peer.name == "yuri")
    })
    .await;

    stop(xena);
    server.shutdown();
    server.join().unwrap();
}

#[tokio::test]
async fn test_malformed_advert_closes_only_its_channel() {
    let (xena, mut xena_rx) = start_node("xena", KeepaliveConfig::default());
    let (yuri, mut yuri_rx) = start_node("yuri", KeepaliveConfig::default());

    yuri.connect_to("127.0.0.1", xena.local_addr().port()).await.unwrap();
    joined(&mut xena_rx, "yuri").await;
    joined(&mut yuri_rx, "xena").await;

    let mut raw = TcpStream::connect(xena.local_addr()).unwrap();
    raw.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut advert = vec![opcode::PEER_ADVERT];
    advert.extend_from_slice(&i32::MAX.to_be_bytes());
    raw.write_all(&advert).unwrap();

    // The node hangs up on the offender
    let mut sink = Vec::new();
    match raw.read_to_end(&mut sink) {
        Ok(_) => {}
        Err(e) => assert!(
            !matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut),
            "channel was not closed"
        ),
    }

    yuri.send_text("still here", None).unwrap();
    let event = wait_for(&mut xena_rx, |e| matches!(e, ChatEvent::Message { .. })).await;
    assert_eq!(
        event,
        ChatEvent::Message {
            from: "yuri".to_string(),
            text: "still here".to_string(),
        }
    );
    assert_eq!(xena.peers().len(), 1);

    stop(yuri);
    stop(xena);
}

#[tokio::test]
async fn test_silent_peer_purged() {
    let keepalive = KeepaliveConfig {
        delay: Duration::from_millis(50),
        interval: Duration::from_millis(100),
    };
    let (xena, mut xena_rx) = start_node("xena", keepalive);

    // Completes the handshake, then never answers PING
    let mut raw = TcpStream::connect(xena.local_addr()).unwrap();
    raw.write_all(&Frame::Name("mute".to_string()).to_bytes()).unwrap();
    raw.write_all(&Frame::PortAck(1).to_bytes()).unwrap();

    joined(&mut xena_rx, "mute").await;
    let event = wait_for(&mut xena_rx, |e| matches!(e, ChatEvent::PeerLeft { .. })).await;
    assert!(matches!(
        event,
        ChatEvent::PeerLeft { peer, timed_out: true } if peer.name == "mute"
    ));
    assert!(xena.peers().is_empty());

    drop(raw);
    stop(xena);
}
