use log::trace;

use crate::ip::{IfaceId, IpLayer};

use super::codec::{self, RST, TcpHeader};
use super::tcb::{PeerEndpoint, State, Tcb};
use super::Quad;

pub const TABLE_SIZE: usize = 128;
pub const SOURCE_PORT_MIN: u16 = 49152;

/// Outcome of dispatching an incoming segment's four-tuple against the
/// table (spec.md §4.1).
pub enum Lookup {
    /// An existing TCB (or an already-promoted LISTEN child) owns this
    /// four-tuple.
    Existing(usize),
    /// No existing match, but a LISTEN TCB for the destination port was
    /// found and a free slot was available: a new child TCB has been
    /// initialized at this index, still in the LISTEN state, ready to be
    /// handed the segment.
    Promoted(usize),
    /// No match and no listener: caller should reply with a bare RST
    /// unless the incoming segment is itself an RST.
    NoListener,
    /// A listener matched but the table has no free slot: drop silently.
    ResourceExhausted,
}

pub struct Table {
    pub tcbs: Vec<Tcb>,
}

impl Table {
    pub fn new() -> Self {
        Table {
            tcbs: (0..TABLE_SIZE).map(|_| Tcb::free()).collect(),
        }
    }

    pub fn alloc(&mut self) -> Option<usize> {
        let idx = self
            .tcbs
            .iter()
            .position(|t| !t.used && t.state == State::Closed)?;
        self.tcbs[idx].used = true;
        Some(idx)
    }

    /// Decision (SPEC_FULL.md §9 #3): only compare against slots that are
    /// actually owned (`used`) or listening, not every slot including
    /// free ones whose stale `port` field happens to be zero-equal.
    pub fn is_port_bound(&self, port: u16) -> bool {
        self.tcbs
            .iter()
            .any(|t| (t.used || t.state == State::Listen) && t.port == port)
    }

    pub fn alloc_ephemeral_port(&self, now_unix_secs: u64) -> Option<u16> {
        let start = SOURCE_PORT_MIN as u32 + (now_unix_secs % 1024) as u32;
        (start..=u16::MAX as u32)
            .map(|p| p as u16)
            .find(|p| !self.is_port_bound(*p))
    }

    pub fn lookup(&mut self, quad: Quad, iface: IfaceId) -> Lookup {
        let mut free_slot = None;
        let mut listener = None;

        for (i, t) in self.tcbs.iter().enumerate() {
            if !t.used && t.state == State::Closed {
                if free_slot.is_none() {
                    free_slot = Some(i);
                }
                continue;
            }
            if t.port == quad.dst.port
                && t.state != State::Listen
                && t.peer.addr == quad.src.addr
                && t.peer.port == quad.src.port
            {
                return Lookup::Existing(i);
            }
            if t.state == State::Listen && t.port == quad.dst.port && listener.is_none() {
                listener = Some(i);
            }
        }

        match (listener, free_slot) {
            (Some(l), Some(slot)) => {
                let listen_port = self.tcbs[l].port;
                let child = &mut self.tcbs[slot];
                *child = Tcb::free();
                child.state = State::Listen;
                child.port = listen_port;
                child.iface = Some(iface);
                child.peer = PeerEndpoint { addr: quad.src.addr, port: quad.src.port };
                child.parent = Some(l);
                trace!("promoted free slot {slot} as child of listener {l}");
                Lookup::Promoted(slot)
            }
            (Some(_), None) => Lookup::ResourceExhausted,
            (None, _) => Lookup::NoListener,
        }
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

/// Handles the truly-CLOSED case (spec.md §4.4 step 1): no TCB exists at
/// all for this four-tuple, so there's nothing to update; the only
/// action is a bare RST reply, built directly from the inbound header
/// with no stored state.
pub fn reply_closed(
    hdr: &TcpHeader,
    payload_len: usize,
    local: std::net::Ipv4Addr,
    peer: std::net::Ipv4Addr,
    iface: IfaceId,
    ip: &dyn IpLayer,
) {
    if hdr.flags & RST != 0 {
        return;
    }
    let seg_len = payload_len as u32
        + u32::from(hdr.flags & super::codec::SYN != 0)
        + u32::from(hdr.flags & super::codec::FIN != 0);
    let (seq, ack, flags) = if hdr.flags & super::codec::ACK != 0 {
        (hdr.ack, 0, RST)
    } else {
        (0, hdr.seq.wrapping_add(seg_len.max(1)), RST | super::codec::ACK)
    };
    let mut out = TcpHeader {
        src_port: hdr.dst_port,
        dst_port: hdr.src_port,
        seq,
        ack,
        flags,
        window: 0,
        checksum: 0,
        urgent_ptr: 0,
    };
    let mut buf = Vec::with_capacity(TcpHeader::LEN);
    out.encode_into(&mut buf);
    out.checksum = codec::checksum(local, peer, &buf);
    buf[16..18].copy_from_slice(&out.checksum.to_be_bytes());
    let _ = ip.tx(iface, peer, &buf);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn alloc_returns_distinct_free_slots() {
        let mut t = Table::new();
        let a = t.alloc().unwrap();
        let b = t.alloc().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn alloc_exhausts_after_table_size_allocations() {
        let mut t = Table::new();
        for _ in 0..TABLE_SIZE {
            assert!(t.alloc().is_some());
        }
        assert!(t.alloc().is_none());
    }

    #[test]
    fn is_port_bound_ignores_stale_free_slots() {
        let t = Table::new();
        // every free slot's port defaults to 0; that must not count as bound
        assert!(!t.is_port_bound(0));
    }

    #[test]
    fn ephemeral_port_allocation_skips_bound_ports() {
        let mut t = Table::new();
        let idx = t.alloc().unwrap();
        let port = t.alloc_ephemeral_port(0).unwrap();
        t.tcbs[idx].port = port;
        let next = t.alloc_ephemeral_port(0).unwrap();
        assert_ne!(port, next);
    }

    #[test]
    fn lookup_with_no_listener_and_no_match_reports_no_listener() {
        let mut t = Table::new();
        let quad = Quad {
            src: super::super::Dual { addr: Ipv4Addr::new(10, 0, 0, 2), port: 1234 },
            dst: super::super::Dual { addr: Ipv4Addr::new(10, 0, 0, 1), port: 80 },
        };
        match t.lookup(quad, IfaceId(0)) {
            Lookup::NoListener => {}
            _ => panic!("expected NoListener"),
        }
    }
}
