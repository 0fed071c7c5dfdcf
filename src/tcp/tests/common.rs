use std::{
    collections::VecDeque,
    io,
    net::{Ipv4Addr, SocketAddr},
    ops::{Deref, DerefMut},
};

use bytes::Bytes;
use tcp_types::tcp::{TcpOption, TcpPacket};
use tracing::instrument;

use crate::tcp::{
    sender::TcpSender, stats::Counter, Config, Connection, Quad, State, TcpContext,
};

pub(in crate::tcp::tests) const WIN_4KB: u16 = 4096;
pub(in crate::tcp::tests) const MSS: u16 = 1000;

/// Default configuration of the tests: fixed ISS and a 4 KiB receive
/// buffer, so segments can be compared field by field.
pub(in crate::tcp::tests) fn test_cfg() -> Config {
    Config {
        mss: MSS,
        recv_buffer_cap: u32::from(WIN_4KB),
        iss: Some(0),
        ..Default::default()
    }
}

pub(in crate::tcp::tests) fn local() -> SocketAddr {
    SocketAddr::new(Ipv4Addr::new(10, 0, 1, 104).into(), 80)
}

pub(in crate::tcp::tests) fn peer() -> SocketAddr {
    SocketAddr::new(Ipv4Addr::new(20, 0, 2, 204).into(), 1808)
}

/// Drives a single connection and captures what it sends.
pub(in crate::tcp::tests) struct TcpTestUnit {
    pub tx: VecDeque<TcpPacket>,
    pub quad: Quad,
    pub con: Option<Connection>,
    pub cfg: Config,
    pub ctx: TcpContext,
}

impl TcpTestUnit {
    pub fn new(src: SocketAddr, dst: SocketAddr) -> Self {
        Self {
            tx: VecDeque::new(),
            quad: Quad { src, dst },
            con: None,
            cfg: test_cfg(),
            ctx: TcpContext::new(),
        }
    }

    /// The usual pair of endpoints, seen from port 80.
    pub fn server() -> Self {
        Self::new(local(), peer())
    }

    /// The usual pair of endpoints, seen from port 1808.
    pub fn client() -> Self {
        Self::new(peer(), local())
    }

    pub fn cfg(&mut self, cfg: Config) {
        self.cfg = cfg;
    }

    pub fn connect(&mut self) {
        assert!(self.con.is_none());
        self.con = Some(Connection::connect(
            &mut TcpSender::new(&mut self.tx),
            self.quad,
            self.cfg.clone(),
            self.ctx.clone(),
        ));
    }

    /// Delivers `pkt`. Without a connection, one is created in LISTEN.
    pub fn incoming(&mut self, pkt: TcpPacket) {
        let quad = self.quad;
        let (cfg, ctx) = (self.cfg.clone(), self.ctx.clone());
        self.con
            .get_or_insert_with(|| Connection::listen(quad, cfg, ctx))
            .on_packet(&mut TcpSender::new(&mut self.tx), pkt);
    }

    /// A segment from the peer, with ACK set.
    pub fn from_peer(&self, seq_no: u32, ack_no: u32, window: u16, content: &[u8]) -> TcpPacket {
        TcpPacket::new(
            self.quad.dst.port(),
            self.quad.src.port(),
            seq_no,
            ack_no,
            window,
            content.to_vec(),
        )
    }

    pub fn pipe(&mut self, peer: &mut Self, n: usize) {
        for pkt in self.tx.drain(..n).collect::<Vec<_>>() {
            peer.incoming(pkt);
        }
    }

    pub fn pipe_all(&mut self, peer: &mut Self) {
        let n = self.tx.len();
        self.pipe(peer, n);
    }

    pub fn send(&mut self, buf: &[u8]) -> io::Result<()> {
        let con = self.con.as_mut().expect("no connection exists: cannot send");
        con.send(
            &mut TcpSender::new(&mut self.tx),
            Bytes::copy_from_slice(buf),
        )
    }

    pub fn pull(&mut self) -> Option<Bytes> {
        self.con
            .as_mut()
            .expect("no connection exists: cannot pull")
            .pull(&mut TcpSender::new(&mut self.tx))
    }

    pub fn pull_all(&mut self) -> Vec<u8> {
        let mut buf = Vec::new();
        while let Some(chunk) = self.pull() {
            buf.extend_from_slice(&chunk);
        }
        buf
    }

    pub fn close(&mut self) {
        self.con
            .as_mut()
            .expect("no connection exists: cannot close")
            .close(&mut TcpSender::new(&mut self.tx));
    }

    pub fn abort(&mut self) {
        self.con
            .as_mut()
            .expect("no connection exists: cannot abort")
            .abort(&mut TcpSender::new(&mut self.tx));
    }

    pub fn fast_tick(&mut self) {
        self.con
            .as_mut()
            .expect("no connection exists: cannot tick")
            .fast_tick(&mut TcpSender::new(&mut self.tx));
    }

    /// One slow timer pass, followed by a clock tick.
    #[instrument(skip_all)]
    pub fn slow_tick(&mut self) {
        self.con
            .as_mut()
            .expect("no connection exists: cannot tick")
            .slow_tick(&mut TcpSender::new(&mut self.tx));
        self.ctx.clock.tick();
    }

    pub fn slow_ticks(&mut self, n: usize) {
        for _ in 0..n {
            self.slow_tick();
        }
    }

    pub fn stat(&self, counter: Counter) -> u64 {
        self.ctx.stats.get(counter)
    }

    pub fn clear_outgoing(&mut self) {
        self.tx.clear();
    }

    pub fn take_outgoing(&mut self) -> Vec<TcpPacket> {
        self.tx.drain(..).collect()
    }

    pub fn assert_connection_exists(&self) {
        assert!(
            self.con.is_some(),
            "no connection exists: handshake must have failed"
        );
    }

    pub fn assert_outgoing_eq(&mut self, pkts: &[TcpPacket]) {
        self.assert_connection_exists();
        let outgoing = self.take_outgoing();
        assert_eq!(outgoing, pkts);
    }

    /// Passive open against a scripted peer whose ISS is `remote_seq_no`.
    pub fn handshake(&mut self, remote_seq_no: u32, remote_recv_window: u16) {
        self.incoming(TcpPacket::syn(
            self.quad.dst.port(),
            self.quad.src.port(),
            remote_seq_no,
            remote_recv_window,
        ));
        self.assert_connection_exists();
        self.clear_outgoing();

        self.incoming(self.from_peer(
            remote_seq_no.wrapping_add(1),
            1,
            remote_recv_window,
            &[],
        ));
        self.clear_outgoing();
        assert_eq!(self.state, State::Estab);
    }

    /// Active open against `server`, both sides must end up established.
    pub fn handshake_pipe(&mut self, server: &mut Self) {
        self.connect();
        self.pipe(server, 1);
        server.pipe(self, 1);
        self.pipe(server, 1);

        assert_eq!(self.state, State::Estab);
        assert_eq!(server.state, State::Estab);
    }
}

impl Deref for TcpTestUnit {
    type Target = Connection;
    fn deref(&self) -> &Self::Target {
        self.con
            .as_ref()
            .expect("Deref can only be used on existing connections")
    }
}

impl DerefMut for TcpTestUnit {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.con
            .as_mut()
            .expect("DerefMut can only be used on existing connections")
    }
}

/// The SYN of an active open with the test configuration.
pub(in crate::tcp::tests) fn syn_with_mss(src_port: u16, dest_port: u16, seq_no: u32) -> TcpPacket {
    TcpPacket::syn(src_port, dest_port, seq_no, WIN_4KB)
        .with_option(TcpOption::MaximumSegmentSize(MSS))
}
