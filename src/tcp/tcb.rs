use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::{Arc, Condvar};
use std::time::Instant;

use log::{debug, trace};

use crate::config::StackConfig;
use crate::err::Result;
use crate::ip::{IfaceId, IpLayer};

use super::codec::{self, TcpHeader, ACK, FIN, PSH, RST, SYN, URG};
use super::txq::{TxEntry, TxQueue};
use super::{is_between_wrapped, wrapping_le, wrapping_lt};

pub const WINDOW_SIZE: usize = 65535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
    CloseWait,
    LastAck,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SendSpace {
    pub una: u32,
    pub nxt: u32,
    pub wnd: u16,
    pub wl1: u32,
    pub wl2: u32,
    pub up: u16,
    pub iss: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RecvSpace {
    pub nxt: u32,
    pub wnd: u16,
    pub up: u16,
    pub irs: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PeerEndpoint {
    pub addr: Ipv4Addr,
    pub port: u16,
}

/// What the caller (the connection table / RX dispatcher) must do after
/// `Tcb::on_segment` returns. The state machine only ever touches its own
/// fields and its own `cond`; anything that reaches into another table
/// slot (a parent listener's backlog) is reported back here, since only
/// the caller holds the whole table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing observable happened; no waiter needs to be woken.
    Noop,
    /// Progress was made on this connection (data arrived, snd.una
    /// advanced, a FIN was processed, ...). Wake this TCB's cond.
    Wake,
    /// A SYN_RCVD child (or a SYN_SENT active open) reached ESTABLISHED.
    /// If this TCB has a parent, the caller pushes this TCB's table index
    /// onto the parent's backlog and notifies the parent's cond too.
    Established,
    /// Forced back to CLOSED by an RST or a protocol violation.
    Reset,
    /// LAST_ACK's FIN was acknowledged; reached CLOSED via the normal
    /// four-way teardown.
    ClosedByPeerAck,
}

#[derive(Debug)]
pub struct Tcb {
    pub used: bool,
    pub state: State,

    pub iface: Option<IfaceId>,
    pub port: u16,
    pub peer: PeerEndpoint,

    pub snd: SendSpace,
    pub rcv: RecvSpace,

    pub window_buffer: Box<[u8; WINDOW_SIZE]>,

    pub txq: TxQueue,

    pub parent: Option<usize>,
    pub backlog: VecDeque<usize>,

    pub cond: Arc<Condvar>,
    pub timeout: Option<Instant>,
}

impl Tcb {
    pub fn free() -> Self {
        Tcb {
            used: false,
            state: State::Closed,
            iface: None,
            port: 0,
            peer: PeerEndpoint::default(),
            snd: SendSpace::default(),
            rcv: RecvSpace::default(),
            window_buffer: Box::new([0u8; WINDOW_SIZE]),
            txq: TxQueue::new(),
            parent: None,
            backlog: VecDeque::new(),
            cond: Arc::new(Condvar::new()),
            timeout: None,
        }
    }

    /// Drives the TCB back to CLOSED without touching `used` — that flag
    /// is owned by the application-facing API, not the state machine.
    pub fn reset_to_closed(&mut self) {
        debug!("{}:{} -> Closed", self.peer.addr, self.peer.port);
        self.state = State::Closed;
        self.snd = SendSpace::default();
        self.rcv = RecvSpace::default();
        self.txq.clear();
        self.parent = None;
        self.timeout = None;
    }

    fn bytes_queued(&self) -> usize {
        WINDOW_SIZE - self.rcv.wnd as usize
    }

    /// Drains up to `buf.len()` bytes of already-arrived data out of the
    /// receive window, opening the window back up by the same amount.
    pub fn recv(&mut self, buf: &mut [u8]) -> usize {
        let avail = self.bytes_queued();
        let len = buf.len().min(avail);
        buf[..len].copy_from_slice(&self.window_buffer[..len]);
        self.window_buffer.copy_within(len..avail, 0);
        self.rcv.wnd += len as u16;
        len
    }

    fn append_to_window(&mut self, data: &[u8]) {
        let avail = self.bytes_queued();
        let len = data.len().min(self.rcv.wnd as usize);
        self.window_buffer[avail..avail + len].copy_from_slice(&data[..len]);
        self.rcv.wnd -= len as u16;
    }

    fn arm_user_timeout(&mut self, now: Instant, cfg: &StackConfig) {
        self.timeout = Some(now + cfg.user_timeout);
    }

    /// RFC 793 Table, Page 26: segment acceptability test.
    pub fn is_segment_valid(&self, seg_seq: u32, seg_len: u32) -> bool {
        let rcv_wnd = self.rcv.wnd as u32;
        let rcv_nxt = self.rcv.nxt;
        match (seg_len, rcv_wnd) {
            (0, 0) => seg_seq == rcv_nxt,
            (0, w) if w > 0 => {
                is_between_wrapped(rcv_nxt.wrapping_sub(1), seg_seq, rcv_nxt.wrapping_add(rcv_wnd))
                    || seg_seq == rcv_nxt
            }
            (l, 0) if l > 0 => false,
            (_, w) if w > 0 => {
                let first = seg_seq;
                let last = seg_seq.wrapping_add(seg_len).wrapping_sub(1);
                is_between_wrapped(rcv_nxt.wrapping_sub(1), first, rcv_nxt.wrapping_add(rcv_wnd))
                    || is_between_wrapped(rcv_nxt.wrapping_sub(1), last, rcv_nxt.wrapping_add(rcv_wnd))
                    || first == rcv_nxt
            }
            _ => false,
        }
    }

    /// Builds and transmits (or defers into `txq`) a segment. Control- or
    /// data-bearing segments are always enqueued into `txq`, whether or
    /// not they go out immediately — spec.md §4.3.
    pub fn tx(&mut self, seq: u32, ack: u32, flags: u8, payload: &[u8], ip: &dyn IpLayer) -> Result<()> {
        let control_bearing = flags & (SYN | FIN) != 0 || !payload.is_empty();
        if control_bearing {
            let have_unsent = self.txq.has_unsent_tail();
            let would_exceed =
                flags & SYN == 0 && self.txq.snt + payload.len() as u32 > self.snd.wnd as u32;
            self.txq.push(TxEntry {
                seq,
                ack,
                flags,
                payload: payload.to_vec(),
                timestamp: None,
            });
            if have_unsent || would_exceed {
                trace!("deferring seq={seq} flags={flags:#x} len={}", payload.len());
                return Ok(());
            }
        }
        self.send_now(seq, ack, flags, payload, ip)?;
        if control_bearing {
            self.txq.mark_tail_sent(Instant::now());
        }
        Ok(())
    }

    fn send_now(&self, seq: u32, ack: u32, flags: u8, payload: &[u8], ip: &dyn IpLayer) -> Result<()> {
        let iface = self.iface.expect("tx on a tcb with no bound interface");
        let local = ip.local_addr(iface);
        let mut hdr = TcpHeader {
            src_port: self.port,
            dst_port: self.peer.port,
            seq,
            ack,
            flags,
            window: self.rcv.wnd,
            checksum: 0,
            urgent_ptr: 0,
        };
        let mut buf = Vec::with_capacity(TcpHeader::LEN + payload.len());
        hdr.encode_into(&mut buf);
        buf.extend_from_slice(payload);
        hdr.checksum = codec::checksum(local, self.peer.addr, &buf);
        buf[16..18].copy_from_slice(&hdr.checksum.to_be_bytes());
        trace!(
            "tx {}:{} -> {}:{} seq={seq} ack={ack} flags={flags:#x} len={}",
            local, self.port, self.peer.addr, self.peer.port, payload.len()
        );
        ip.tx(iface, self.peer.addr, &buf)?;
        Ok(())
    }

    fn send_rst_direct(&self, seq: u32, ack: u32, ip: &dyn IpLayer) -> Result<()> {
        self.send_now(seq, ack, RST, &[], ip)
    }

    /// `close()` per spec.md §4.7; does not touch `used`.
    pub fn close(&mut self, ip: &dyn IpLayer) -> Result<()> {
        match self.state {
            State::Closed | State::Listen | State::SynSent => {
                self.reset_to_closed();
                Ok(())
            }
            State::SynRcvd | State::Established => {
                self.tx(self.snd.nxt, self.rcv.nxt, FIN | ACK, &[], ip)?;
                self.snd.nxt = self.snd.nxt.wrapping_add(1);
                self.state = State::FinWait1;
                Ok(())
            }
            State::CloseWait => {
                // Decision (DESIGN.md / SPEC_FULL.md §9 #2): LAST_ACK, not
                // CLOSING.
                self.tx(self.snd.nxt, self.rcv.nxt, FIN | ACK, &[], ip)?;
                self.snd.nxt = self.snd.nxt.wrapping_add(1);
                self.state = State::LastAck;
                Ok(())
            }
            State::FinWait1 | State::FinWait2 | State::Closing | State::TimeWait | State::LastAck => {
                Err(crate::err::Error::ConnectionClosing)
            }
        }
    }

    pub fn on_segment(
        &mut self,
        hdr: &TcpHeader,
        payload: &[u8],
        ip: &dyn IpLayer,
        now: Instant,
        cfg: &StackConfig,
    ) -> Action {
        match self.state {
            State::Closed => Action::Noop,
            State::Listen => self.on_segment_listen(hdr, ip, now, cfg),
            State::SynSent => self.on_segment_syn_sent(hdr, ip, now, cfg),
            _ => self.on_segment_synchronized(hdr, payload, ip, now, cfg),
        }
    }

    fn on_segment_listen(&mut self, hdr: &TcpHeader, ip: &dyn IpLayer, now: Instant, cfg: &StackConfig) -> Action {
        if hdr.flags & RST != 0 {
            return Action::Noop;
        }
        if hdr.flags & ACK != 0 {
            let _ = self.send_rst_direct(hdr.ack, 0, ip);
            return Action::Noop;
        }
        if hdr.flags & SYN != 0 {
            self.rcv.irs = hdr.seq;
            self.rcv.nxt = hdr.seq.wrapping_add(1);
            self.rcv.wnd = WINDOW_SIZE as u16;
            self.snd.iss = rand::random();
            self.snd.una = self.snd.iss;
            self.snd.nxt = self.snd.iss.wrapping_add(1);
            self.state = State::SynRcvd;
            self.arm_user_timeout(now, cfg);
            debug!("{}:{} LISTEN -> SYN_RCVD", self.peer.addr, self.peer.port);
            let _ = self.tx(self.snd.iss, self.rcv.nxt, SYN | ACK, &[], ip);
        }
        Action::Noop
    }

    fn on_segment_syn_sent(
        &mut self,
        hdr: &TcpHeader,
        ip: &dyn IpLayer,
        now: Instant,
        cfg: &StackConfig,
    ) -> Action {
        let mut ack_acceptable = false;
        if hdr.flags & ACK != 0 {
            let unacceptable =
                !wrapping_lt(self.snd.iss, hdr.ack) || wrapping_lt(self.snd.nxt, hdr.ack);
            if unacceptable {
                if hdr.flags & RST == 0 {
                    let _ = self.send_rst_direct(hdr.ack, 0, ip);
                }
                return Action::Noop;
            }
            ack_acceptable = wrapping_le(self.snd.una, hdr.ack) && wrapping_le(hdr.ack, self.snd.nxt);
        }

        if hdr.flags & RST != 0 {
            if ack_acceptable {
                self.reset_to_closed();
                return Action::Reset;
            }
            return Action::Noop;
        }

        if hdr.flags & SYN != 0 {
            self.rcv.nxt = hdr.seq.wrapping_add(1);
            self.rcv.irs = hdr.seq;
            if hdr.flags & ACK != 0 {
                self.snd.una = hdr.ack;
                self.txq.vacuum(self.snd.una);
            }
            if wrapping_lt(self.snd.iss, self.snd.una) {
                self.snd.wnd = hdr.window;
                self.snd.wl1 = hdr.seq;
                self.snd.wl2 = hdr.ack;
                self.state = State::Established;
                self.arm_user_timeout(now, cfg);
                debug!("{}:{} SYN_SENT -> ESTABLISHED", self.peer.addr, self.peer.port);
                let _ = self.tx(self.snd.nxt, self.rcv.nxt, ACK, &[], ip);
                return Action::Established;
            }
            self.state = State::SynRcvd;
            let _ = self.tx(self.snd.iss, self.rcv.nxt, SYN | ACK, &[], ip);
            return Action::Wake;
        }
        Action::Noop
    }

    fn on_segment_synchronized(
        &mut self,
        hdr: &TcpHeader,
        payload: &[u8],
        ip: &dyn IpLayer,
        now: Instant,
        cfg: &StackConfig,
    ) -> Action {
        let seg_len = payload.len() as u32
            + u32::from(hdr.flags & SYN != 0)
            + u32::from(hdr.flags & FIN != 0);

        if !self.is_segment_valid(hdr.seq, seg_len) {
            if hdr.flags & RST != 0 {
                return Action::Noop;
            }
            let _ = self.tx(self.snd.nxt, self.rcv.nxt, ACK, &[], ip);
            return Action::Noop;
        }

        if hdr.flags & RST != 0 {
            self.reset_to_closed();
            return Action::Reset;
        }

        if hdr.flags & SYN != 0 {
            let _ = self.tx(0, self.rcv.nxt, RST, &[], ip);
            self.reset_to_closed();
            return Action::Reset;
        }

        if hdr.flags & ACK == 0 {
            return Action::Noop;
        }

        let mut result = Action::Noop;

        match self.state {
            State::SynRcvd => {
                if wrapping_le(self.snd.una, hdr.ack) && wrapping_le(hdr.ack, self.snd.nxt) {
                    self.state = State::Established;
                    self.snd.wnd = hdr.window;
                    self.snd.wl1 = hdr.seq;
                    self.snd.wl2 = hdr.ack;
                    self.arm_user_timeout(now, cfg);
                    debug!("{}:{} SYN_RCVD -> ESTABLISHED", self.peer.addr, self.peer.port);
                    result = Action::Established;
                } else {
                    let _ = self.send_rst_direct(hdr.ack, 0, ip);
                    return Action::Noop;
                }
            }
            State::Established
            | State::FinWait1
            | State::FinWait2
            | State::CloseWait
            | State::Closing => {
                if wrapping_le(self.snd.una, hdr.ack) && wrapping_le(hdr.ack, self.snd.nxt) {
                    if wrapping_lt(self.snd.una, hdr.ack) {
                        self.snd.una = hdr.ack;
                        self.txq.vacuum(self.snd.una);
                        self.arm_user_timeout(now, cfg);
                        result = Action::Wake;
                    }
                    if wrapping_lt(self.snd.wl1, hdr.seq)
                        || (self.snd.wl1 == hdr.seq && wrapping_le(self.snd.wl2, hdr.ack))
                    {
                        self.snd.wnd = hdr.window;
                        self.snd.wl1 = hdr.seq;
                        self.snd.wl2 = hdr.ack;
                    }
                } else if wrapping_lt(self.snd.nxt, hdr.ack) {
                    let _ = self.tx(self.snd.nxt, self.rcv.nxt, ACK, &[], ip);
                    return Action::Noop;
                }

                if self.state == State::FinWait1 && hdr.ack == self.snd.nxt {
                    self.state = State::FinWait2;
                } else if self.state == State::Closing && hdr.ack == self.snd.nxt {
                    self.state = State::TimeWait;
                    self.timeout = Some(now + cfg.time_wait_timeout);
                }
            }
            State::LastAck => {
                if hdr.ack == self.snd.nxt {
                    self.reset_to_closed();
                    return Action::ClosedByPeerAck;
                }
                return Action::Noop;
            }
            State::TimeWait => {
                // Any ACK here is a duplicate; step 10 below restarts the
                // quiet timer if it also carries a retransmitted FIN.
            }
            State::Closed | State::Listen | State::SynSent => unreachable!(),
        }

        if hdr.flags & URG != 0 {
            if matches!(self.state, State::Established | State::FinWait1 | State::FinWait2) {
                self.rcv.up = self.rcv.up.max(hdr.urgent_ptr);
            }
        }

        if matches!(self.state, State::Established | State::FinWait1 | State::FinWait2) {
            if !payload.is_empty() && hdr.seq == self.rcv.nxt {
                self.append_to_window(payload);
                self.rcv.nxt = self.rcv.nxt.wrapping_add(payload.len() as u32);
                let _ = self.tx(self.snd.nxt, self.rcv.nxt, ACK, &[], ip);
                result = Action::Wake;
            } else if hdr.flags & PSH != 0 && !payload.is_empty() {
                let _ = self.tx(self.snd.nxt, self.rcv.nxt, ACK, &[], ip);
            }
        }

        if hdr.flags & FIN != 0 {
            self.rcv.nxt = self.rcv.nxt.wrapping_add(1);
            let _ = self.tx(self.snd.nxt, self.rcv.nxt, ACK, &[], ip);
            match self.state {
                State::SynRcvd | State::Established => self.state = State::CloseWait,
                State::FinWait1 => self.state = State::Closing,
                State::FinWait2 => {
                    self.state = State::TimeWait;
                    self.timeout = Some(now + cfg.time_wait_timeout);
                }
                State::TimeWait => self.timeout = Some(now + cfg.time_wait_timeout),
                _ => {}
            }
            result = Action::Wake;
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank() -> Tcb {
        let mut t = Tcb::free();
        t.used = true;
        t.port = 80;
        t.peer = PeerEndpoint { addr: "10.0.0.2".parse().unwrap(), port: 4000 };
        t
    }

    #[test]
    fn is_segment_valid_rejects_outside_window() {
        let mut t = blank();
        t.rcv.nxt = 1000;
        t.rcv.wnd = 100;
        assert!(t.is_segment_valid(1000, 10));
        assert!(!t.is_segment_valid(1200, 10));
    }

    #[test]
    fn zero_len_zero_window_only_accepts_exact_seq() {
        let mut t = blank();
        t.rcv.nxt = 50;
        t.rcv.wnd = 0;
        assert!(t.is_segment_valid(50, 0));
        assert!(!t.is_segment_valid(51, 0));
    }

    #[test]
    fn recv_window_reopens_after_drain() {
        let mut t = blank();
        t.rcv.wnd = WINDOW_SIZE as u16;
        t.append_to_window(b"hello");
        assert_eq!(t.rcv.wnd as usize, WINDOW_SIZE - 5);
        let mut buf = [0u8; 5];
        let n = t.recv(&mut buf);
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(t.rcv.wnd as usize, WINDOW_SIZE);
    }
}
