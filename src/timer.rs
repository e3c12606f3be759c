//! The 100ms timer driver (C6): retransmission and timeout expiry.
//! Grounded in `original_source/tcp.c`'s `tcp_timer_thread`, simplified
//! to the fixed-interval retransmit model (no SRTT/RTTVAR backoff, which
//! is an explicit non-goal).

use std::time::Instant;

use log::{debug, warn};

use crate::config::StackConfig;
use crate::ip::IpLayer;
use crate::tcp::codec::{self, TcpHeader};
use crate::tcp::tcb::{State, Tcb};

/// Runs one tick against a single TCB: expires it if its timeout has
/// passed, vacuums acknowledged entries out of its retransmit queue, and
/// resends whatever remains and is due. Returns true if the TCB was
/// forced closed by this tick, so the caller can wake its waiters.
pub fn tick_tcb(tcb: &mut Tcb, ip: &dyn IpLayer, now: Instant, cfg: &StackConfig) -> bool {
    if tcb.state == State::Closed {
        return false;
    }

    if let Some(deadline) = tcb.timeout {
        let expired = tcb.snd.una != tcb.snd.nxt || tcb.state == State::TimeWait;
        if expired && now >= deadline {
            debug!("{}:{} timer expiry in {:?}", tcb.peer.addr, tcb.peer.port, tcb.state);
            tcb.reset_to_closed();
            return true;
        }
    }

    tcb.txq.vacuum(tcb.snd.una);

    let Some(iface) = tcb.iface else { return false };
    let local = ip.local_addr(iface);
    let peer = tcb.peer.addr;
    let peer_port = tcb.peer.port;
    let local_port = tcb.port;
    let rcv_nxt = tcb.rcv.nxt;
    let rcv_wnd = tcb.rcv.wnd;
    let snd_wnd = tcb.snd.wnd as u32;
    let retransmit_after = cfg.retransmit_after;

    let mut outstanding = 0u32;
    for entry in tcb.txq.entries_mut() {
        if outstanding >= snd_wnd {
            break;
        }
        let due = match entry.timestamp {
            None => true,
            Some(ts) => now.duration_since(ts) > retransmit_after,
        };
        if due {
            entry.ack = rcv_nxt;
            let mut hdr = TcpHeader {
                src_port: local_port,
                dst_port: peer_port,
                seq: entry.seq,
                ack: entry.ack,
                flags: entry.flags,
                window: rcv_wnd,
                checksum: 0,
                urgent_ptr: 0,
            };
            let mut buf = Vec::with_capacity(TcpHeader::LEN + entry.payload.len());
            hdr.encode_into(&mut buf);
            buf.extend_from_slice(&entry.payload);
            hdr.checksum = codec::checksum(local, peer, &buf);
            buf[16..18].copy_from_slice(&hdr.checksum.to_be_bytes());
            match ip.tx(iface, peer, &buf) {
                Ok(()) => entry.timestamp = Some(now),
                Err(e) => warn!("retransmit to {peer}:{peer_port} failed: {e}"),
            }
        }
        outstanding += entry.payload.len() as u32;
    }

    false
}
