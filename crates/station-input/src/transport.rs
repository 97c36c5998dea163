//! Packet sources.
//!
//! A [`PacketSource`] hands out one raw RSP packet per call. Datagram sources
//! map one datagram to one packet; byte streams (TCP, recorded files) are
//! framed by reading the header and deriving the payload size from it.
//!
//! Sources are described by strings so they can live in configuration files:
//!
//! | spec | source |
//! |------|--------|
//! | `udp:0.0.0.0:4346` | [`UdpSource`] bound to the address |
//! | `tcp:10.1.2.3:4346` | [`StreamSource`] over a connection to the address |
//! | `file:/data/board0.raw` | [`StreamSource`] over a recorded file |

use std::collections::VecDeque;
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, ErrorKind, Read};
use std::net::{TcpStream, UdpSocket};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::TransportError;
use crate::packet::RspHeader;

/// Something that produces raw RSP packets.
pub trait PacketSource: Send {
    /// Copy the next packet into `buf` and return its length.
    ///
    /// Returns [`TransportError::Timeout`] when nothing arrived within the
    /// source's read timeout, so callers get a chance to check for stop.
    fn next_packet(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Human-readable origin for logs.
    fn describe(&self) -> String;
}

/// Receives one packet per datagram.
#[derive(Debug)]
pub struct UdpSource {
    socket: UdpSocket,
    address: String,
}

impl UdpSource {
    /// Bind to `address`; reads give up after `timeout`.
    pub fn bind(address: &str, timeout: Duration) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(address)?;
        socket.set_read_timeout(Some(timeout))?;
        let local = socket.local_addr()?;
        tracing::info!(address = %local, "Bound UDP source");
        Ok(Self {
            socket,
            address: local.to_string(),
        })
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.socket.local_addr()
    }
}

impl PacketSource for UdpSource {
    fn next_packet(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        match self.socket.recv(buf) {
            Ok(len) => Ok(len),
            Err(e) if is_timeout(&e) => Err(TransportError::Timeout),
            Err(e) => Err(e.into()),
        }
    }

    fn describe(&self) -> String {
        format!("udp:{}", self.address)
    }
}

/// Largest frame a header can announce: 255 beamlets of 255 blocks at 16 bits.
const MAX_FRAME_SIZE: usize = RspHeader::SIZE + 255 * 255 * 4;

/// Frames packets out of a byte stream.
///
/// A frame interrupted by a read timeout is kept and resumed on the next
/// call, so a stalled connection never loses its place in the stream.
pub struct StreamSource<R> {
    inner: R,
    name: String,
    frame: Vec<u8>,
    filled: usize,
}

impl<R> fmt::Debug for StreamSource<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSource")
            .field("name", &self.name)
            .field("filled", &self.filled)
            .finish_non_exhaustive()
    }
}

impl<R: Read + Send> StreamSource<R> {
    /// Wrap a reader; `name` shows up in logs.
    pub fn new(inner: R, name: impl Into<String>) -> Self {
        Self {
            inner,
            name: name.into(),
            frame: vec![0u8; MAX_FRAME_SIZE],
            filled: 0,
        }
    }

    /// Bytes of a partially received frame.
    pub fn pending(&self) -> usize {
        self.filled
    }

    /// Read until the current frame holds `upto` bytes.
    fn fill(&mut self, upto: usize) -> Result<(), TransportError> {
        while self.filled < upto {
            match self.inner.read(&mut self.frame[self.filled..upto]) {
                Ok(0) => {
                    // a clean end between packets is the end of the stream
                    if self.filled > 0 {
                        tracing::warn!(
                            source = %self.name,
                            filled = self.filled,
                            "Stream ended inside a packet"
                        );
                    }
                    self.filled = 0;
                    return Err(TransportError::EndOfStream);
                }
                Ok(n) => self.filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if is_timeout(&e) => return Err(TransportError::Timeout),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl StreamSource<TcpStream> {
    /// Connect to a station (or relay) serving packets over TCP.
    pub fn connect(address: &str, timeout: Duration) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(address)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;
        tracing::info!(address, "Connected TCP source");
        Ok(Self::new(stream, format!("tcp:{address}")))
    }
}

impl StreamSource<BufReader<File>> {
    /// Replay a recorded packet stream.
    pub fn open(path: PathBuf) -> Result<Self, TransportError> {
        let file = File::open(&path)?;
        tracing::info!(path = %path.display(), "Opened file source");
        Ok(Self::new(BufReader::new(file), format!("file:{}", path.display())))
    }
}

impl<R: Read + Send> PacketSource for StreamSource<R> {
    /// Frames larger than `buf` are consumed whole and handed out truncated,
    /// which the reader then drops as malformed.
    fn next_packet(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.fill(RspHeader::SIZE)?;
        let total = RspHeader::SIZE + framed_payload_size(&self.frame[..RspHeader::SIZE]);
        self.fill(total)?;
        self.filled = 0;

        let len = total.min(buf.len());
        if len < total {
            tracing::debug!(source = %self.name, total, "Truncated oversized frame");
        }
        buf[..len].copy_from_slice(&self.frame[..len]);
        Ok(len)
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

/// Payload size implied by a raw header, without validating it.
///
/// Reserved bit modes frame as 16-bit so the stream stays in sync; the
/// reader rejects the packet afterwards.
fn framed_payload_size(header: &[u8]) -> usize {
    let sample_bytes = match header[2] & 0x03 {
        1 => 2,
        2 => 1,
        _ => 4,
    };
    usize::from(header[6]) * usize::from(header[7]) * sample_bytes
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

/// Packets queued in memory; ends when the queue runs dry.
#[derive(Debug, Default, Clone)]
pub struct MemorySource {
    packets: VecDeque<Vec<u8>>,
}

impl MemorySource {
    /// Queue `packets` in order.
    pub fn new(packets: impl IntoIterator<Item = Vec<u8>>) -> Self {
        Self {
            packets: packets.into_iter().collect(),
        }
    }

    /// Append one packet.
    pub fn push(&mut self, packet: Vec<u8>) {
        self.packets.push_back(packet);
    }

    /// Packets not yet handed out.
    pub fn remaining(&self) -> usize {
        self.packets.len()
    }
}

impl PacketSource for MemorySource {
    fn next_packet(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let packet = self.packets.pop_front().ok_or(TransportError::EndOfStream)?;
        let len = packet.len().min(buf.len());
        buf[..len].copy_from_slice(&packet[..len]);
        Ok(len)
    }

    fn describe(&self) -> String {
        format!("memory ({} queued)", self.packets.len())
    }
}

/// Parsed source description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSpec {
    /// Bind a UDP socket
    Udp(String),
    /// Connect to a TCP server
    Tcp(String),
    /// Read a recorded stream
    File(PathBuf),
}

impl SourceSpec {
    /// Open the source; network reads time out after `timeout`.
    pub fn open(&self, timeout: Duration) -> Result<Box<dyn PacketSource>, TransportError> {
        let source: Box<dyn PacketSource> = match self {
            Self::Udp(address) => Box::new(UdpSource::bind(address, timeout)?),
            Self::Tcp(address) => Box::new(StreamSource::connect(address, timeout)?),
            Self::File(path) => Box::new(StreamSource::open(path.clone())?),
        };
        Ok(source)
    }
}

impl FromStr for SourceSpec {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TransportError::InvalidSource(s.to_string());
        let (scheme, rest) = s.split_once(':').ok_or_else(invalid)?;
        if rest.is_empty() {
            return Err(invalid());
        }
        match scheme {
            "udp" => Ok(Self::Udp(rest.to_string())),
            "tcp" => Ok(Self::Tcp(rest.to_string())),
            "file" => Ok(Self::File(PathBuf::from(rest))),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for SourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp(address) => write!(f, "udp:{address}"),
            Self::Tcp(address) => write!(f, "tcp:{address}"),
            Self::File(path) => write!(f, "file:{}", path.display()),
        }
    }
}
