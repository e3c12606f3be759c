use std::net::Ipv4Addr;
use std::str::FromStr;

use log::info;
use tcpstack::{NetStack, StackConfig};

fn main() {
    env_logger::init();

    let netstack = NetStack::over_tun(
        "tun0",
        Ipv4Addr::from_str("10.10.10.10").unwrap(),
        Ipv4Addr::from_str("255.255.255.0").unwrap(),
        StackConfig::default(),
    )
    .unwrap();

    let sock = netstack.open().unwrap();
    netstack.bind(sock, 9090).unwrap();
    netstack.listen(sock).unwrap();

    info!("waiting for incoming connections on port 9090");
    let conn = netstack.accept(sock).unwrap();
    info!("connection accepted");

    loop {
        let mut buf = [0u8; 1500];
        match netstack.recv(conn, &mut buf) {
            Ok(n) => {
                netstack.send(conn, &buf[..n]).unwrap();
                info!("echoed {n} bytes");
            }
            Err(tcpstack::Error::ConnectionClosing) => break,
            Err(e) => panic!("recv failed: {e}"),
        }
    }

    netstack.close(conn).unwrap();
}
