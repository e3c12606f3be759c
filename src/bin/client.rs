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

    info!("connecting to server...");
    netstack
        .connect(sock, "10.10.10.10".parse::<Ipv4Addr>().unwrap(), 9090)
        .unwrap();
    info!("connected");

    netstack.send(sock, b"hello from client\n").unwrap();

    let mut buf = [0u8; 1500];
    let n = netstack.recv(sock, &mut buf).unwrap();
    info!("read back {n} bytes: {:?}", String::from_utf8_lossy(&buf[..n]));

    netstack.close(sock).unwrap();
}
