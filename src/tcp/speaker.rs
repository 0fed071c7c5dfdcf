use bytes::Bytes;
use fxhash::FxHashMap;
use std::{
    io::{self, Error, ErrorKind},
    sync::Arc,
};
use tcp_types::tcp::TcpPacket;
use tracing::{debug, instrument, trace, warn};

use super::{
    connection::{Config, Connection, Direction, TcpContext},
    sender::TcpSenderBuffer,
    stats::{Counter, TcpStats, TcpStatsSnapshot},
    Quad, TcpClock,
};

/// Drives a set of connections that share one clock, one counter set and
/// one ISS secret.
///
/// Inbound segments are demultiplexed by [`Quad`], seen from the local end.
/// Outbound segments collect per flow until [`Speaker::poll_transmit`]
/// hands them out. The owner calls [`Speaker::fast_tick`] every 200 ms and
/// [`Speaker::slow_tick`] every 500 ms.
#[derive(Debug)]
pub struct Speaker {
    cfg: Config,
    ctx: TcpContext,
    connections: FxHashMap<Quad, Connection>,
    tx: TcpSenderBuffer,
}

impl Speaker {
    pub fn new(cfg: Config) -> Self {
        Self::with_context(cfg, TcpContext::new())
    }

    pub fn with_context(cfg: Config, ctx: TcpContext) -> Self {
        Self {
            cfg,
            ctx,
            connections: FxHashMap::default(),
            tx: TcpSenderBuffer::default(),
        }
    }

    pub fn clock(&self) -> &TcpClock {
        &self.ctx.clock
    }

    pub fn stats(&self) -> &Arc<TcpStats> {
        &self.ctx.stats
    }

    pub fn stats_snapshot(&self) -> TcpStatsSnapshot {
        self.ctx.stats.snapshot()
    }

    /// Opens a connection to `quad.dst`.
    pub fn open(&mut self, quad: Quad) -> io::Result<()> {
        if self.connections.contains_key(&quad) {
            return Err(Error::new(
                ErrorKind::AddrInUse,
                format!("flow {quad} already exists"),
            ));
        }
        let con = Connection::new(
            &mut self.tx.sender(quad),
            quad,
            Direction::Outgoing,
            self.cfg.clone(),
            self.ctx.clone(),
        );
        debug!(%quad, "opened connection");
        self.connections.insert(quad, con);
        Ok(())
    }

    /// Hands an inbound segment to its connection.
    ///
    /// A pure SYN for an unknown flow creates a connection. Any other segment
    /// of an unknown flow is answered with a reset.
    #[instrument(level = "trace", skip_all, fields(quad = %quad))]
    pub fn incoming(&mut self, quad: Quad, pkt: TcpPacket) {
        if !self.connections.contains_key(&quad) {
            if !pkt.flags.is_pure_syn() {
                trace!("segment for unknown flow");
                self.ctx.stats.inc(Counter::RcvTotal);
                if !pkt.flags.rst {
                    self.tx.sender(quad).send(TcpPacket::rst_for(&pkt));
                }
                return;
            }
            let con = Connection::listen(quad, self.cfg.clone(), self.ctx.clone());
            self.connections.insert(quad, con);
        }

        if let Some(con) = self.connections.get_mut(&quad) {
            con.on_packet(&mut self.tx.sender(quad), pkt);
        }
    }

    /// Decodes a TCP header plus payload and hands it to [`Speaker::incoming`].
    pub fn incoming_bytes(&mut self, quad: Quad, buf: &[u8]) -> io::Result<()> {
        let pkt = TcpPacket::from_slice(buf).map_err(|e| {
            warn!(%quad, "malformed segment: {e}");
            self.ctx.stats.inc(Counter::RcvBadOff);
            Error::new(ErrorKind::InvalidData, e)
        })?;
        self.incoming(quad, pkt);
        Ok(())
    }

    pub fn send(&mut self, quad: Quad, payload: Bytes) -> io::Result<()> {
        let con = self
            .connections
            .get_mut(&quad)
            .ok_or_else(|| no_flow(quad))?;
        con.send(&mut self.tx.sender(quad), payload)
    }

    pub fn close(&mut self, quad: Quad) -> io::Result<()> {
        let con = self
            .connections
            .get_mut(&quad)
            .ok_or_else(|| no_flow(quad))?;
        con.close(&mut self.tx.sender(quad));
        Ok(())
    }

    pub fn abort(&mut self, quad: Quad) -> io::Result<()> {
        let con = self
            .connections
            .get_mut(&quad)
            .ok_or_else(|| no_flow(quad))?;
        con.abort(&mut self.tx.sender(quad));
        Ok(())
    }

    /// Next block of in-order payload of `quad`, if any.
    pub fn pull(&mut self, quad: Quad) -> Option<Bytes> {
        let con = self.connections.get_mut(&quad)?;
        con.pull(&mut self.tx.sender(quad))
    }

    /// Flows with payload ready to be pulled.
    pub fn pullable(&self) -> Vec<Quad> {
        self.connections
            .iter()
            .filter(|(_, con)| con.is_pullable())
            .map(|(quad, _)| *quad)
            .collect()
    }

    /// The next segment for the wire.
    pub fn poll_transmit(&mut self) -> Option<(Quad, TcpPacket)> {
        self.tx.next()
    }

    pub fn fast_tick(&mut self) {
        for (quad, con) in &mut self.connections {
            con.fast_tick(&mut self.tx.sender(*quad));
        }
    }

    /// Runs every connection's timers, reclaims the closed ones and advances
    /// the clock. Returns the flows that were reclaimed, with the error they
    /// failed with.
    pub fn slow_tick(&mut self) -> Vec<(Quad, Option<io::Error>)> {
        let mut closed = Vec::new();
        for (quad, con) in &mut self.connections {
            con.slow_tick(&mut self.tx.sender(*quad));
            if con.is_closed() {
                closed.push(*quad);
            }
        }

        let events = closed
            .into_iter()
            .filter_map(|quad| {
                let mut con = self.connections.remove(&quad)?;
                debug!(%quad, "reclaiming closed connection");
                Some((quad, con.take_error()))
            })
            .collect();

        self.ctx.clock.tick();
        events
    }

    pub fn connection(&self, quad: Quad) -> Option<&Connection> {
        self.connections.get(&quad)
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

fn no_flow(quad: Quad) -> Error {
    Error::new(ErrorKind::NotConnected, format!("no flow {quad}"))
}
