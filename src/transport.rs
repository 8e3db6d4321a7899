//! Non-blocking byte transports the engine drives

use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;

/// Outcome of a non-blocking read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recv {
    Data(usize),
    /// Nothing available right now.
    Pending,
    /// Peer closed the stream.
    Closed,
}

/// A connection the engine can poll without blocking.
pub trait Transport {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Recv>;
    /// Returns how many bytes were accepted; 0 means try again later.
    fn send(&mut self, buf: &[u8]) -> io::Result<usize>;
    fn shutdown(&mut self);
    fn peer(&self) -> String;
}

pub struct TcpTransport {
    stream: TcpStream,
    peer: String,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_else(|_| "unknown".to_string());
        Ok(Self { stream, peer })
    }
}

impl Transport for TcpTransport {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Recv> {
        match self.stream.read(buf) {
            Ok(0) => Ok(Recv::Closed),
            Ok(n) => Ok(Recv::Data(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => {
                Ok(Recv::Pending)
            }
            Err(e) => Err(e),
        }
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.stream.write(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn shutdown(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

#[derive(Default)]
struct Pipe {
    inbound: Vec<u8>,
    outbound: Vec<u8>,
    eof: bool,
    closed: bool,
    max_write: Option<usize>,
    fail_reads: bool,
}

/// Scripted in-memory transport. The engine owns one end; clones act as the
/// peer, feeding inbound bytes and collecting what the engine sent.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    pipe: Arc<Mutex<Pipe>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_inbound(&self, data: &[u8]) {
        self.pipe.lock().inbound.extend_from_slice(data);
    }

    /// Everything sent so far, draining the buffer.
    pub fn take_outbound(&self) -> Vec<u8> {
        std::mem::take(&mut self.pipe.lock().outbound)
    }

    /// Cap each `send` at `n` bytes to exercise partial writes.
    pub fn set_max_write(&self, n: usize) {
        self.pipe.lock().max_write = Some(n);
    }

    /// Reads return `Closed` once the inbound buffer drains.
    pub fn close_inbound(&self) {
        self.pipe.lock().eof = true;
    }

    pub fn fail_reads(&self) {
        self.pipe.lock().fail_reads = true;
    }

    pub fn is_closed(&self) -> bool {
        self.pipe.lock().closed
    }
}

impl Transport for MemoryTransport {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Recv> {
        let mut pipe = self.pipe.lock();
        if pipe.closed {
            return Ok(Recv::Closed);
        }
        if pipe.fail_reads {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "scripted failure"));
        }
        if pipe.inbound.is_empty() {
            return Ok(if pipe.eof { Recv::Closed } else { Recv::Pending });
        }
        let n = buf.len().min(pipe.inbound.len());
        buf[..n].copy_from_slice(&pipe.inbound[..n]);
        pipe.inbound.drain(..n);
        Ok(Recv::Data(n))
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut pipe = self.pipe.lock();
        if pipe.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "transport closed"));
        }
        let n = pipe.max_write.map_or(buf.len(), |m| m.min(buf.len()));
        pipe.outbound.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn shutdown(&mut self) {
        self.pipe.lock().closed = true;
    }

    fn peer(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_transport_reads_in_pieces() {
        let peer = MemoryTransport::new();
        let mut end = peer.clone();
        peer.push_inbound(b"hello");
        let mut buf = [0u8; 3];
        assert_eq!(end.recv(&mut buf).unwrap(), Recv::Data(3));
        assert_eq!(&buf, b"hel");
        assert_eq!(end.recv(&mut buf).unwrap(), Recv::Data(2));
        assert_eq!(end.recv(&mut buf).unwrap(), Recv::Pending);
        peer.close_inbound();
        assert_eq!(end.recv(&mut buf).unwrap(), Recv::Closed);
    }

    #[test]
    fn test_memory_transport_partial_writes() {
        let peer = MemoryTransport::new();
        let mut end = peer.clone();
        peer.set_max_write(4);
        assert_eq!(end.send(b"abcdefgh").unwrap(), 4);
        assert_eq!(peer.take_outbound(), b"abcd");
        end.shutdown();
        assert!(peer.is_closed());
        assert!(end.send(b"x").is_err());
    }
}
