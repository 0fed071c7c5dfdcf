use std::collections::VecDeque;

use fxhash::FxHashMap;
use tcp_types::tcp::TcpPacket;

use super::Quad;

/// Outbound segments of all connections, queued per flow until the
/// caller polls them.
#[derive(Debug, Clone, Default)]
pub struct TcpSenderBuffer {
    pub pending: FxHashMap<Quad, VecDeque<TcpPacket>>,
}

/// Write handle onto the queue of a single flow.
#[derive(Debug)]
pub struct TcpSender<'a> {
    buffer: &'a mut VecDeque<TcpPacket>,
}

impl TcpSenderBuffer {
    pub fn sender(&mut self, quad: Quad) -> TcpSender<'_> {
        TcpSender {
            buffer: self.pending.entry(quad).or_default(),
        }
    }

    /// Pops one segment of any flow, with the flow it belongs to.
    pub fn next(&mut self) -> Option<(Quad, TcpPacket)> {
        let quad = self
            .pending
            .iter()
            .find_map(|(quad, queue)| (!queue.is_empty()).then_some(*quad))?;
        let queue = self.pending.get_mut(&quad)?;
        let pkt = queue.pop_front()?;
        if queue.is_empty() {
            self.pending.remove(&quad);
        }
        Some((quad, pkt))
    }

    pub fn is_empty(&self) -> bool {
        self.pending.values().all(VecDeque::is_empty)
    }

    pub fn len(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }
}

impl<'a> TcpSender<'a> {
    /// A sender writing into a caller-owned queue.
    pub fn new(buffer: &'a mut VecDeque<TcpPacket>) -> Self {
        Self { buffer }
    }

    pub fn send(&mut self, pkt: TcpPacket) {
        self.buffer.push_back(pkt);
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
