use std::{
    fmt::Display,
    io::{Error, ErrorKind, Result},
};

use byteorder::{ByteOrder, WriteBytesExt, BE};
use bytes::Bytes;

pub const PROTO_TCP: u8 = 0x06;

/// Length of a TCP header without options.
pub const TCP_HEADER_LEN: usize = 20;

/// Maximum number of option bytes a header can carry.
pub const TCP_MAX_OPTIONS_LEN: usize = 40;

/// A TCP segment assosciated with an end-to-end connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpPacket {
    pub src_port: u16,
    pub dest_port: u16,
    pub seq_no: u32,
    pub ack_no: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub urgent_ptr: u16,
    pub options: Vec<TcpOption>,

    pub content: Bytes,
}

/// Flags of a [`TcpPacket`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(clippy::struct_excessive_bools)]
pub struct TcpFlags {
    pub cwr: bool,
    pub ece: bool,
    pub urg: bool,
    pub ack: bool,
    pub psh: bool,
    pub rst: bool,
    pub syn: bool,
    pub fin: bool,
}

/// Options of a [`TcpPacket`].
///
/// Only the options the engine understands are represented. NOP padding is
/// consumed by the decoder and emitted as needed by the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpOption {
    MaximumSegmentSize(u16),
    WindowScaling(u8),
    Timestamp(u32, u32),
    EndOfOptionsList(),
}

macro_rules! fimpl {
    ($i:ident) => {
        #[must_use]
        pub fn $i(mut self, value: bool) -> Self {
            self.$i = value;
            self
        }
    };
}

impl TcpPacket {
    /// A plain ACK segment carrying `content`.
    #[must_use]
    pub fn new(
        src_port: u16,
        dest_port: u16,
        seq_no: u32,
        ack_no: u32,
        window: u16,
        content: Vec<u8>,
    ) -> TcpPacket {
        TcpPacket {
            src_port,
            dest_port,
            seq_no,
            ack_no,
            flags: TcpFlags::new().ack(true),
            window,
            urgent_ptr: 0,
            options: Vec::new(),
            content: Bytes::from(content),
        }
    }

    /// A bare SYN without options.
    #[must_use]
    pub fn syn(src_port: u16, dest_port: u16, seq_no: u32, window: u16) -> TcpPacket {
        TcpPacket {
            src_port,
            dest_port,
            seq_no,
            ack_no: 0,
            flags: TcpFlags::new().syn(true),
            window,
            urgent_ptr: 0,
            options: Vec::new(),
            content: Bytes::new(),
        }
    }

    /// The SYN-ACK answering `syn`.
    #[must_use]
    pub fn syn_ack(syn: &TcpPacket, seq_no: u32, window: u16) -> TcpPacket {
        TcpPacket {
            src_port: syn.dest_port,
            dest_port: syn.src_port,
            seq_no,
            ack_no: syn.seq_no.wrapping_add(1),
            flags: TcpFlags::new().syn(true).ack(true),
            window,
            urgent_ptr: 0,
            options: Vec::new(),
            content: Bytes::new(),
        }
    }

    /// The reset a receiver sends for a segment that does not belong to any
    /// connection (RFC 793, "Reset Generation").
    #[must_use]
    pub fn rst_for(pkt: &TcpPacket) -> TcpPacket {
        let (seq_no, ack_no, flags) = if pkt.flags.ack {
            (pkt.ack_no, 0, TcpFlags::new().rst(true))
        } else {
            (
                0,
                pkt.seq_no.wrapping_add(pkt.seq_len()),
                TcpFlags::new().rst(true).ack(true),
            )
        };
        TcpPacket {
            src_port: pkt.dest_port,
            dest_port: pkt.src_port,
            seq_no,
            ack_no,
            flags,
            window: 0,
            urgent_ptr: 0,
            options: Vec::new(),
            content: Bytes::new(),
        }
    }

    /// Sequence space occupied by this segment, SYN and FIN included.
    #[must_use]
    pub fn seq_len(&self) -> u32 {
        self.content.len() as u32 + u32::from(self.flags.syn) + u32::from(self.flags.fin)
    }

    #[must_use]
    pub fn with_option(mut self, option: TcpOption) -> Self {
        self.options.push(option);
        self
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut options = Vec::with_capacity(TCP_MAX_OPTIONS_LEN);
        for option in &self.options {
            option.write_to(&mut options)?;
        }
        while options.len() % 4 != 0 {
            options.push(0);
        }
        if options.len() > TCP_MAX_OPTIONS_LEN {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "tcp options exceed the maximum header length",
            ));
        }

        let hlen = TCP_HEADER_LEN + options.len();
        let mut buf = Vec::with_capacity(hlen + self.content.len());
        buf.write_u16::<BE>(self.src_port)?;
        buf.write_u16::<BE>(self.dest_port)?;
        buf.write_u32::<BE>(self.seq_no)?;
        buf.write_u32::<BE>(self.ack_no)?;
        buf.write_u8(((hlen / 4) as u8) << 4)?;
        buf.write_u8(self.flags.to_byte())?;
        buf.write_u16::<BE>(self.window)?;
        buf.write_u16::<BE>(0)?;
        buf.write_u16::<BE>(self.urgent_ptr)?;
        buf.extend_from_slice(&options);
        buf.extend_from_slice(&self.content);

        Ok(buf)
    }

    /// Decodes a segment.
    ///
    /// Fails with [`ErrorKind::InvalidData`] if the buffer is too short or
    /// the data offset points below the fixed header or past the buffer.
    pub fn from_slice(buf: &[u8]) -> Result<Self> {
        if buf.len() < TCP_HEADER_LEN {
            return Err(Error::new(ErrorKind::InvalidData, "truncated tcp header"));
        }

        let hlen = usize::from(buf[12] >> 4) * 4;
        if hlen < TCP_HEADER_LEN {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "tcp data offset shorter than minimum header",
            ));
        }
        if hlen > buf.len() {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "tcp data offset exceeds segment",
            ));
        }

        Ok(TcpPacket {
            src_port: BE::read_u16(&buf[0..2]),
            dest_port: BE::read_u16(&buf[2..4]),
            seq_no: BE::read_u32(&buf[4..8]),
            ack_no: BE::read_u32(&buf[8..12]),
            flags: TcpFlags::from_byte(buf[13]),
            window: BE::read_u16(&buf[14..16]),
            urgent_ptr: BE::read_u16(&buf[18..20]),
            options: TcpOption::parse_all(&buf[TCP_HEADER_LEN..hlen]),
            content: Bytes::copy_from_slice(&buf[hlen..]),
        })
    }
}

impl Display for TcpPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} -> {} [{}] seq={} ack={} win={} len={}",
            self.src_port,
            self.dest_port,
            self.flags,
            self.seq_no,
            self.ack_no,
            self.window,
            self.content.len()
        )
    }
}

impl TcpFlags {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
    fimpl!(cwr);
    fimpl!(ece);
    fimpl!(urg);
    fimpl!(ack);
    fimpl!(psh);
    fimpl!(rst);
    fimpl!(syn);
    fimpl!(fin);

    /// A SYN that carries none of ACK, RST or FIN.
    #[must_use]
    pub fn is_pure_syn(&self) -> bool {
        self.syn && !self.ack && !self.rst && !self.fin
    }

    #[must_use]
    pub fn to_byte(self) -> u8 {
        let mut byte = 0u8;
        if self.cwr {
            byte |= 0b1000_0000;
        }
        if self.ece {
            byte |= 0b0100_0000;
        }
        if self.urg {
            byte |= 0b0010_0000;
        }
        if self.ack {
            byte |= 0b0001_0000;
        }
        if self.psh {
            byte |= 0b0000_1000;
        }
        if self.rst {
            byte |= 0b0000_0100;
        }
        if self.syn {
            byte |= 0b0000_0010;
        }
        if self.fin {
            byte |= 0b0000_0001;
        }
        byte
    }

    #[must_use]
    pub fn from_byte(byte: u8) -> Self {
        TcpFlags {
            cwr: byte & 0b1000_0000 != 0,
            ece: byte & 0b0100_0000 != 0,
            urg: byte & 0b0010_0000 != 0,
            ack: byte & 0b0001_0000 != 0,
            psh: byte & 0b0000_1000 != 0,
            rst: byte & 0b0000_0100 != 0,
            syn: byte & 0b0000_0010 != 0,
            fin: byte & 0b0000_0001 != 0,
        }
    }
}

impl Display for TcpFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.cwr {
            write!(f, "CWR")?;
        }
        if self.ece {
            write!(f, "ECE")?;
        }
        if self.urg {
            write!(f, "URG")?;
        }
        if self.ack {
            write!(f, "ACK")?;
        }

        if self.psh {
            write!(f, "PSH")?;
        }
        if self.rst {
            write!(f, "RST")?;
        }
        if self.syn {
            write!(f, "SYN")?;
        }
        if self.fin {
            write!(f, "FIN")?;
        }

        Ok(())
    }
}

impl TcpOption {
    const KIND_EOL: u8 = 0;
    const KIND_NOP: u8 = 1;
    const KIND_MSS: u8 = 2;
    const KIND_WSCALE: u8 = 3;
    const KIND_TIMESTAMP: u8 = 8;

    fn write_to(&self, buf: &mut Vec<u8>) -> Result<()> {
        match self {
            Self::MaximumSegmentSize(mss) => {
                buf.write_u8(Self::KIND_MSS)?;
                buf.write_u8(4)?;
                buf.write_u16::<BE>(*mss)
            }
            Self::WindowScaling(cnt) => {
                buf.write_u8(Self::KIND_NOP)?;
                buf.write_u8(Self::KIND_WSCALE)?;
                buf.write_u8(3)?;
                buf.write_u8(*cnt)
            }
            Self::Timestamp(send, recv) => {
                buf.write_u8(Self::KIND_NOP)?;
                buf.write_u8(Self::KIND_NOP)?;
                buf.write_u8(Self::KIND_TIMESTAMP)?;
                buf.write_u8(10)?;
                buf.write_u32::<BE>(*send)?;
                buf.write_u32::<BE>(*recv)
            }
            Self::EndOfOptionsList() => buf.write_u8(Self::KIND_EOL),
        }
    }

    /// Parses an option block leniently: unknown kinds and known kinds with
    /// an unexpected length are skipped, a malformed length byte ends the
    /// walk, EOL terminates it.
    fn parse_all(mut raw: &[u8]) -> Vec<TcpOption> {
        let mut options = Vec::new();
        while let Some(&kind) = raw.first() {
            match kind {
                Self::KIND_EOL => break,
                Self::KIND_NOP => {
                    raw = &raw[1..];
                    continue;
                }
                _ => {}
            }

            let Some(&len) = raw.get(1) else {
                break;
            };
            let len = usize::from(len);
            if len < 2 || len > raw.len() {
                break;
            }

            let body = &raw[2..len];
            match (kind, body.len()) {
                (Self::KIND_MSS, 2) => options.push(Self::MaximumSegmentSize(BE::read_u16(body))),
                (Self::KIND_WSCALE, 1) => options.push(Self::WindowScaling(body[0])),
                (Self::KIND_TIMESTAMP, 8) => options.push(Self::Timestamp(
                    BE::read_u32(&body[..4]),
                    BE::read_u32(&body[4..]),
                )),
                _ => {}
            }
            raw = &raw[len..];
        }
        options
    }
}
