//! End-to-end scenarios driving two `NetStack`s against each other over
//! `LoopbackIpLayer`, in place of a real TUN device.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tcpstack::{LoopbackIpLayer, NetStack, StackConfig};

const SERVER_ADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const CLIENT_ADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

fn harness(cfg: StackConfig) -> (NetStack, NetStack) {
    let (ip_a, ip_b) = LoopbackIpLayer::pair(SERVER_ADDR, CLIENT_ADDR);
    let server = NetStack::new(Arc::new(ip_a), cfg.clone());
    let client = NetStack::new(Arc::new(ip_b), cfg);
    (server, client)
}

#[test]
fn three_way_handshake_and_echo() {
    let (server, client) = harness(StackConfig::default());

    let listening = server.open().unwrap();
    server.bind(listening, 9090).unwrap();
    server.listen(listening).unwrap();

    let server_thread = thread::spawn(move || {
        let conn = server.accept(listening).unwrap();
        let mut buf = [0u8; 1024];
        let n = server.recv(conn, &mut buf).unwrap();
        server.send(conn, &buf[..n]).unwrap();
        server.close(conn).unwrap();
    });

    let csock = client.open().unwrap();
    client.connect(csock, SERVER_ADDR, 9090).unwrap();

    let payload = vec![7u8; 1024];
    client.send(csock, &payload).unwrap();

    let mut back = [0u8; 1024];
    let mut got = 0;
    while got < back.len() {
        got += client.recv(csock, &mut back[got..]).unwrap();
    }
    assert_eq!(&back[..], &payload[..]);

    client.close(csock).unwrap();
    server_thread.join().unwrap();
}

#[test]
fn graceful_close_initiated_by_client() {
    let (server, client) = harness(StackConfig::default());

    let listening = server.open().unwrap();
    server.bind(listening, 9091).unwrap();
    server.listen(listening).unwrap();

    let server_thread = thread::spawn(move || {
        let conn = server.accept(listening).unwrap();
        let mut buf = [0u8; 64];
        // client closes without sending data; recv in CLOSE_WAIT with an
        // empty window reports the connection as closing.
        let err = server.recv(conn, &mut buf).unwrap_err();
        assert!(matches!(err, tcpstack::Error::ConnectionClosing));
        server.close(conn).unwrap();
    });

    let csock = client.open().unwrap();
    client.connect(csock, SERVER_ADDR, 9091).unwrap();
    client.close(csock).unwrap();

    server_thread.join().unwrap();
}

#[test]
fn connect_without_listener_is_refused() {
    let (_server, client) = harness(StackConfig::default());

    let csock = client.open().unwrap();
    let err = client.connect(csock, SERVER_ADDR, 9999).unwrap_err();
    assert!(matches!(err, tcpstack::Error::Reset));
}

#[test]
fn user_timeout_forces_connection_closed() {
    let cfg = StackConfig::default()
        .user_timeout(Duration::from_millis(300))
        .tick_interval(Duration::from_millis(20));
    let (ip_a, ip_b) = LoopbackIpLayer::pair(SERVER_ADDR, CLIENT_ADDR);
    let server = NetStack::new(Arc::new(ip_a), cfg);
    // never construct a peer stack for `ip_b`, so the server's SYN and
    // subsequent retransmits all go unanswered.
    drop(ip_b);

    let sock = server.open().unwrap();
    let err = server.connect(sock, CLIENT_ADDR, 9999).unwrap_err();
    assert!(matches!(err, tcpstack::Error::Reset));
}
