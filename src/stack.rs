//! The application-facing interface (C7): `NetStack`, an integer socket
//! handle space, and the blocking open/bind/listen/accept/connect/send/
//! recv/close calls, all serialized through one table-wide mutex plus
//! per-TCB condition variables.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{error, trace, warn};

use crate::config::StackConfig;
use crate::err::{Error, Result};
use crate::ip::{IfaceId, IpLayer, TunIpLayer};
use crate::tcp::codec::TcpHeader;
use crate::tcp::tcb::{Action, PeerEndpoint, State};
use crate::tcp::table::{self, Lookup, Table};
use crate::tcp::{Dual, Quad};
use crate::timer;

const SND_BUF_SIZE: u32 = 10 * 1024;

struct Inner {
    table: Mutex<Table>,
    ip: Arc<dyn IpLayer>,
    cfg: StackConfig,
}

/// The running engine: an RX thread decoding inbound segments and
/// driving the state machine, a timer thread retransmitting and expiring
/// connections, and the blocking API surface below.
pub struct NetStack {
    inner: Arc<Inner>,
    rx: thread::JoinHandle<()>,
    timer: thread::JoinHandle<()>,
}

impl NetStack {
    /// Brings up a real TUN device and wires it in as the IP layer.
    pub fn over_tun(name: &str, addr: Ipv4Addr, mask: Ipv4Addr, cfg: StackConfig) -> Result<Self> {
        let ip = Arc::new(TunIpLayer::new(name, addr, mask)?);
        Ok(Self::new(ip, cfg))
    }

    /// Generic constructor over any `IpLayer` — used directly by tests
    /// and demos against `LoopbackIpLayer`.
    pub fn new(ip: Arc<dyn IpLayer>, cfg: StackConfig) -> Self {
        let inner = Arc::new(Inner {
            table: Mutex::new(Table::new()),
            ip,
            cfg,
        });

        let rx = {
            let inner = inner.clone();
            thread::spawn(move || rx_loop(inner))
        };

        let timer = {
            let inner = inner.clone();
            thread::spawn(move || timer_loop(inner))
        };

        NetStack { inner, rx, timer }
    }

    pub fn join(self) {
        self.rx.join().unwrap();
        self.timer.join().unwrap();
    }

    fn validate(&self, table: &Table, sock: usize) -> Result<()> {
        if sock >= table.tcbs.len() {
            return Err(Error::InvalidSocket(sock as i32));
        }
        if !table.tcbs[sock].used {
            return Err(Error::IllegalForState);
        }
        Ok(())
    }

    pub fn open(&self) -> Result<usize> {
        let mut table = self.inner.table.lock().unwrap();
        table.alloc().ok_or(Error::NoFreeSocket)
    }

    pub fn bind(&self, sock: usize, port: u16) -> Result<()> {
        let mut table = self.inner.table.lock().unwrap();
        self.validate(&table, sock)?;
        if table.tcbs[sock].state != State::Closed {
            return Err(Error::IllegalForState);
        }
        if table.is_port_bound(port) {
            return Err(Error::PortInUse(port));
        }
        table.tcbs[sock].port = port;
        Ok(())
    }

    pub fn listen(&self, sock: usize) -> Result<()> {
        let mut table = self.inner.table.lock().unwrap();
        self.validate(&table, sock)?;
        if table.tcbs[sock].state != State::Closed || table.tcbs[sock].port == 0 {
            return Err(Error::IllegalForState);
        }
        table.tcbs[sock].state = State::Listen;
        Ok(())
    }

    pub fn accept(&self, sock: usize) -> Result<usize> {
        let mut table = self.inner.table.lock().unwrap();
        self.validate(&table, sock)?;
        if table.tcbs[sock].state != State::Listen {
            return Err(Error::IllegalForState);
        }
        let cond = table.tcbs[sock].cond.clone();
        loop {
            if let Some(child) = table.tcbs[sock].backlog.pop_front() {
                table.tcbs[child].used = true;
                return Ok(child);
            }
            if table.tcbs[sock].state != State::Listen {
                return Err(Error::IllegalForState);
            }
            table = cond.wait(table).unwrap();
        }
    }

    pub fn connect(&self, sock: usize, addr: Ipv4Addr, port: u16) -> Result<()> {
        let mut table = self.inner.table.lock().unwrap();
        self.validate(&table, sock)?;
        if table.tcbs[sock].state != State::Closed {
            return Err(Error::IllegalForState);
        }
        let iface = self.inner.ip.route(addr).ok_or(Error::NoRoute)?;

        if table.tcbs[sock].port == 0 {
            let now_secs = unix_now_secs();
            let ephemeral = table
                .alloc_ephemeral_port(now_secs)
                .ok_or(Error::NoFreeEphemeralPort)?;
            table.tcbs[sock].port = ephemeral;
        }

        let cond = table.tcbs[sock].cond.clone();
        {
            let tcb = &mut table.tcbs[sock];
            tcb.iface = Some(iface);
            tcb.peer = PeerEndpoint { addr, port };
            tcb.rcv.wnd = crate::tcp::tcb::WINDOW_SIZE as u16;
            tcb.snd.iss = rand::random();
            tcb.snd.una = tcb.snd.iss;
            tcb.snd.nxt = tcb.snd.iss.wrapping_add(1);
            tcb.state = State::SynSent;
            tcb.timeout = Some(Instant::now() + self.inner.cfg.user_timeout);
            tcb.tx(tcb.snd.iss, 0, crate::tcp::codec::SYN, &[], self.inner.ip.as_ref())?;
        }

        loop {
            match table.tcbs[sock].state {
                State::SynSent | State::SynRcvd => {
                    table = cond.wait(table).unwrap();
                }
                State::Established => return Ok(()),
                _ => return Err(Error::Reset),
            }
        }
    }

    pub fn send(&self, sock: usize, buf: &[u8]) -> Result<usize> {
        let mut table = self.inner.table.lock().unwrap();
        self.validate(&table, sock)?;
        let mss = self.mss(table.tcbs[sock].iface);
        let mut sent = 0usize;

        while sent < buf.len() {
            match table.tcbs[sock].state {
                State::Established | State::CloseWait => {}
                State::Listen | State::SynSent | State::SynRcvd => {
                    return Err(Error::IllegalForState)
                }
                _ => return if sent > 0 { Ok(sent) } else { Err(Error::ConnectionClosing) },
            }

            let una = table.tcbs[sock].snd.una;
            let nxt = table.tcbs[sock].snd.nxt;
            let outstanding = nxt.wrapping_sub(una);
            if outstanding >= SND_BUF_SIZE {
                let cond = table.tcbs[sock].cond.clone();
                table = cond.wait(table).unwrap();
                continue;
            }

            let room = (SND_BUF_SIZE - outstanding) as usize;
            let chunk = (buf.len() - sent).min(room).min(mss);

            let tcb = &mut table.tcbs[sock];
            let seq = tcb.snd.nxt;
            let ack = tcb.rcv.nxt;
            tcb.tx(
                seq,
                ack,
                crate::tcp::codec::PSH | crate::tcp::codec::ACK,
                &buf[sent..sent + chunk],
                self.inner.ip.as_ref(),
            )?;
            tcb.snd.nxt = tcb.snd.nxt.wrapping_add(chunk as u32);
            tcb.timeout = Some(Instant::now() + self.inner.cfg.user_timeout);
            sent += chunk;
        }
        Ok(sent)
    }

    pub fn recv(&self, sock: usize, buf: &mut [u8]) -> Result<usize> {
        let mut table = self.inner.table.lock().unwrap();
        self.validate(&table, sock)?;
        loop {
            let bytes_queued =
                crate::tcp::tcb::WINDOW_SIZE - table.tcbs[sock].rcv.wnd as usize;
            match table.tcbs[sock].state {
                State::Listen | State::SynSent | State::SynRcvd | State::Closed => {
                    return Err(Error::IllegalForState)
                }
                State::Established | State::FinWait1 | State::FinWait2 => {
                    if bytes_queued == 0 {
                        let cond = table.tcbs[sock].cond.clone();
                        table = cond.wait(table).unwrap();
                        continue;
                    }
                    return Ok(table.tcbs[sock].recv(buf));
                }
                State::CloseWait => {
                    if bytes_queued == 0 {
                        return Err(Error::ConnectionClosing);
                    }
                    return Ok(table.tcbs[sock].recv(buf));
                }
                State::Closing | State::TimeWait | State::LastAck => {
                    return Err(Error::ConnectionClosing)
                }
            }
        }
    }

    pub fn close(&self, sock: usize) -> Result<()> {
        let mut table = self.inner.table.lock().unwrap();
        self.validate(&table, sock)?;
        table.tcbs[sock].used = false;

        if table.tcbs[sock].state == State::Listen {
            let children: Vec<usize> = table.tcbs[sock].backlog.drain(..).collect();
            for child in children {
                table.tcbs[child].used = false;
                let _ = table.tcbs[child].close(self.inner.ip.as_ref());
            }
        }

        table.tcbs[sock].close(self.inner.ip.as_ref())
    }

    fn mss(&self, iface: Option<IfaceId>) -> usize {
        let mtu = iface.map_or(1500, |i| self.inner.ip.mtu(i));
        mtu.saturating_sub(crate::ip::IP_HDR_MAX).saturating_sub(TcpHeader::LEN)
    }
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn rx_loop(inner: Arc<Inner>) {
    loop {
        let dgram = match inner.ip.recv(Duration::from_millis(200)) {
            Ok(Some(d)) => d,
            Ok(None) => continue,
            Err(e) => {
                error!("ip recv error: {e}");
                continue;
            }
        };

        let Some((hdr, header_len)) = TcpHeader::decode(&dgram.payload) else {
            trace!("dropping unparsable segment from {}", dgram.src);
            continue;
        };
        let payload = &dgram.payload[header_len..];

        if !crate::tcp::codec::verify(dgram.dst, dgram.src, &dgram.payload) {
            warn!("checksum mismatch from {}:{}", dgram.src, hdr.src_port);
            continue;
        }

        let quad = Quad {
            src: Dual { addr: dgram.src, port: hdr.src_port },
            dst: Dual { addr: dgram.dst, port: hdr.dst_port },
        };

        let mut table = inner.table.lock().unwrap();
        match table.lookup(quad, dgram.iface) {
            Lookup::Existing(idx) | Lookup::Promoted(idx) => {
                let action = {
                    let tcb = &mut table.tcbs[idx];
                    tcb.on_segment(&hdr, payload, inner.ip.as_ref(), Instant::now(), &inner.cfg)
                };
                match action {
                    Action::Noop => {}
                    Action::Wake | Action::Reset | Action::ClosedByPeerAck => {
                        table.tcbs[idx].cond.notify_all();
                    }
                    Action::Established => {
                        let parent = table.tcbs[idx].parent;
                        table.tcbs[idx].cond.notify_all();
                        if let Some(p) = parent {
                            table.tcbs[p].backlog.push_back(idx);
                            table.tcbs[p].cond.notify_all();
                        }
                    }
                }
            }
            Lookup::NoListener => {
                table::reply_closed(&hdr, payload.len(), dgram.dst, dgram.src, dgram.iface, inner.ip.as_ref());
            }
            Lookup::ResourceExhausted => {
                warn!("connection table full, dropping SYN from {}:{}", dgram.src, hdr.src_port);
            }
        }
    }
}

fn timer_loop(inner: Arc<Inner>) {
    loop {
        {
            let mut table = inner.table.lock().unwrap();
            let now = Instant::now();
            for idx in 0..table.tcbs.len() {
                if table.tcbs[idx].state == State::Closed {
                    continue;
                }
                let expired = timer::tick_tcb(&mut table.tcbs[idx], inner.ip.as_ref(), now, &inner.cfg);
                if expired {
                    table.tcbs[idx].cond.notify_all();
                }
            }
        }
        thread::sleep(inner.cfg.tick_interval);
    }
}
