//! The IP-layer collaborator TCP sits on top of: something that can hand
//! a TCP segment to a peer address and hand back segments addressed to
//! us. `TunIpLayer` is the real one (a TUN device); `LoopbackIpLayer` is
//! an in-process stand-in used by tests and the demo binaries' own
//! tests, the way `cs-wwu-srg-elvis-public` drives its simulated network
//! without a kernel interface.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use etherparse::{Ipv4Header, Ipv4HeaderSlice};
use log::warn;
use nix::poll::{poll, PollFd, PollFlags};
use tidy_tuntap::Tun;

use crate::err::{Error, Result};

pub const IPPROTO_TCP: u8 = 6;
pub const IP_HDR_MAX: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IfaceId(pub usize);

/// A TCP segment plus the IPv4 addressing it arrived with.
#[derive(Debug, Clone)]
pub struct RawDatagram {
    pub iface: IfaceId,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub payload: Vec<u8>,
}

pub trait IpLayer: Send + Sync {
    /// Wraps `payload` (a complete TCP segment) in an IPv4 header and
    /// hands it to the peer.
    fn tx(&self, iface: IfaceId, peer: Ipv4Addr, payload: &[u8]) -> Result<()>;

    /// Blocks up to `timeout` for the next inbound TCP segment.
    fn recv(&self, timeout: Duration) -> Result<Option<RawDatagram>>;

    /// Our own address on the given interface.
    fn local_addr(&self, iface: IfaceId) -> Ipv4Addr;

    /// Picks the outgoing interface for a peer address, if reachable.
    fn route(&self, peer: Ipv4Addr) -> Option<IfaceId>;

    /// Maximum TCP segment size this interface can carry in one frame.
    fn mtu(&self, iface: IfaceId) -> usize;
}

/// Real IPv4-over-TUN collaborator: `tidy_tuntap::Tun` for the device,
/// `etherparse` for the IPv4 header. The TCP header itself is
/// hand-rolled in `tcp::codec` rather than routed through etherparse's
/// own (RFC-correct) checksum helper, since it must reproduce the
/// pseudo-header quirk this crate deliberately keeps.
pub struct TunIpLayer {
    tun: Mutex<Tun>,
    addr: Ipv4Addr,
    mtu: usize,
}

impl TunIpLayer {
    pub fn new(name: &str, addr: Ipv4Addr, mask: Ipv4Addr) -> Result<Self> {
        let tun = Tun::new(name, false).map_err(Error::TunError)?;
        tun.set_addr(addr).map_err(Error::TunError)?;
        tun.set_netmask(mask).map_err(Error::TunError)?;
        tun.bring_up().map_err(Error::TunError)?;
        Ok(TunIpLayer {
            tun: Mutex::new(tun),
            addr,
            mtu: 1500,
        })
    }
}

impl IpLayer for TunIpLayer {
    fn tx(&self, _iface: IfaceId, peer: Ipv4Addr, payload: &[u8]) -> Result<()> {
        let ip4h = Ipv4Header::new(payload.len() as u16, 64, IPPROTO_TCP, self.addr.octets(), peer.octets());
        let mut buf = Vec::with_capacity(ip4h.header_len() + payload.len());
        ip4h.write(&mut buf).map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        buf.extend_from_slice(payload);
        let mut tun = self.tun.lock().unwrap();
        tun.write_all(&buf)?;
        Ok(())
    }

    fn recv(&self, timeout: Duration) -> Result<Option<RawDatagram>> {
        let mut tun = self.tun.lock().unwrap();
        let mut pfd = [PollFd::new(tun.as_raw_fd(), PollFlags::POLLIN)];
        let millis = timeout.as_millis().min(i32::MAX as u128) as i32;
        if poll(&mut pfd[..], millis)? == 0 {
            return Ok(None);
        }
        let mut buf = [0u8; 1500];
        let n = tun.read(&mut buf)?;
        let Ok(ip4h) = Ipv4HeaderSlice::from_slice(&buf[..n]) else {
            return Ok(None);
        };
        if ip4h.protocol() != IPPROTO_TCP {
            return Ok(None);
        }
        let start = (ip4h.ihl() as usize) * 4;
        Ok(Some(RawDatagram {
            iface: IfaceId(0),
            src: ip4h.source_addr(),
            dst: ip4h.destination_addr(),
            payload: buf[start..n].to_vec(),
        }))
    }

    fn local_addr(&self, _iface: IfaceId) -> Ipv4Addr {
        self.addr
    }

    fn route(&self, _peer: Ipv4Addr) -> Option<IfaceId> {
        Some(IfaceId(0))
    }

    fn mtu(&self, _iface: IfaceId) -> usize {
        self.mtu
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Error::Io(std::io::Error::from(e))
    }
}

struct Mailbox {
    queue: Mutex<VecDeque<RawDatagram>>,
    cond: Condvar,
}

impl Mailbox {
    fn new() -> Self {
        Mailbox {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
        }
    }
}

/// In-process collaborator connecting exactly two stacks, for tests and
/// demos that don't want a real TUN device.
pub struct LoopbackIpLayer {
    addr: Ipv4Addr,
    peer_addr: Ipv4Addr,
    inbox: Arc<Mailbox>,
    outbox: Arc<Mailbox>,
    mtu: usize,
}

impl LoopbackIpLayer {
    /// Builds a connected pair: sending on one side is receiving on the
    /// other.
    pub fn pair(addr_a: Ipv4Addr, addr_b: Ipv4Addr) -> (Self, Self) {
        let box_a = Arc::new(Mailbox::new());
        let box_b = Arc::new(Mailbox::new());
        (
            LoopbackIpLayer {
                addr: addr_a,
                peer_addr: addr_b,
                inbox: box_a.clone(),
                outbox: box_b.clone(),
                mtu: 1500,
            },
            LoopbackIpLayer {
                addr: addr_b,
                peer_addr: addr_a,
                inbox: box_b,
                outbox: box_a,
                mtu: 1500,
            },
        )
    }
}

impl IpLayer for LoopbackIpLayer {
    fn tx(&self, _iface: IfaceId, peer: Ipv4Addr, payload: &[u8]) -> Result<()> {
        if peer != self.peer_addr {
            warn!("loopback: no route to {peer}");
            return Err(Error::NoRoute);
        }
        let mut q = self.outbox.queue.lock().unwrap();
        q.push_back(RawDatagram {
            iface: IfaceId(0),
            src: self.addr,
            dst: peer,
            payload: payload.to_vec(),
        });
        self.outbox.cond.notify_one();
        Ok(())
    }

    fn recv(&self, timeout: Duration) -> Result<Option<RawDatagram>> {
        let mut q = self.inbox.queue.lock().unwrap();
        if q.is_empty() {
            let (guard, _) = self.inbox.cond.wait_timeout(q, timeout).unwrap();
            q = guard;
        }
        Ok(q.pop_front())
    }

    fn local_addr(&self, _iface: IfaceId) -> Ipv4Addr {
        self.addr
    }

    fn route(&self, peer: Ipv4Addr) -> Option<IfaceId> {
        if peer == self.peer_addr {
            Some(IfaceId(0))
        } else {
            None
        }
    }

    fn mtu(&self, _iface: IfaceId) -> usize {
        self.mtu
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_delivers_across_sides() {
        let (a, b) = LoopbackIpLayer::pair(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2));
        a.tx(IfaceId(0), Ipv4Addr::new(10, 0, 0, 2), b"hello").unwrap();
        let dgram = b.recv(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(dgram.payload, b"hello");
        assert_eq!(dgram.src, Ipv4Addr::new(10, 0, 0, 1));
    }

    #[test]
    fn tx_to_unknown_peer_is_no_route() {
        let (a, _b) = LoopbackIpLayer::pair(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2));
        let err = a.tx(IfaceId(0), Ipv4Addr::new(10, 0, 0, 9), b"x").unwrap_err();
        assert!(matches!(err, Error::NoRoute));
    }
}
