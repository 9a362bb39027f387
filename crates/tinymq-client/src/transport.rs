//! Transport abstraction consumed by the client.
//!
//! The client performs all I/O through this trait: reads and writes that
//! take an explicit timeout and may complete partially. Methods take
//! `&self` so one thread can drain the socket while others transmit, each
//! side serialized by the client's own locks.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::error::{ClientError, Result};

/// A bidirectional byte stream with per-call timeouts.
pub trait Transport: Send + Sync {
    /// Read up to `buf.len()` bytes.
    ///
    /// Returns the number of bytes read (at least 1), `ClientError::Timeout`
    /// if nothing arrived within `timeout`, or `ClientError::ConnectionClosed`
    /// on end-of-stream.
    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Write up to `buf.len()` bytes, returning how many were accepted.
    fn write(&self, buf: &[u8], timeout: Duration) -> Result<usize>;

    /// Tear the connection down.
    fn disconnect(&self) -> Result<()>;
}

/// TCP transport over a blocking socket with per-call timeouts.
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    /// Resolve `address` (host:port) and connect within `timeout`.
    pub fn connect(address: &str, timeout: Duration) -> Result<Self> {
        let addr = address.to_socket_addrs()?.next().ok_or_else(|| {
            ClientError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "Could not resolve address",
            ))
        })?;

        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nodelay(true)?;

        Ok(Self { stream })
    }
}

// A zero Duration would mean "no timeout" to the socket API; clamp to the
// smallest effective value instead.
fn effective(timeout: Duration) -> Duration {
    timeout.max(Duration::from_millis(1))
}

fn is_timeout(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

impl Transport for TcpTransport {
    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.stream.set_read_timeout(Some(effective(timeout)))?;
        match (&self.stream).read(buf) {
            Ok(0) => Err(ClientError::ConnectionClosed),
            Ok(n) => Ok(n),
            Err(e) if is_timeout(&e) => Err(ClientError::Timeout),
            Err(e) => Err(ClientError::Io(e)),
        }
    }

    fn write(&self, buf: &[u8], timeout: Duration) -> Result<usize> {
        self.stream.set_write_timeout(Some(effective(timeout)))?;
        match (&self.stream).write(buf) {
            Ok(0) => Err(ClientError::ConnectionClosed),
            Ok(n) => Ok(n),
            Err(e) if is_timeout(&e) => Err(ClientError::Timeout),
            Err(e) => Err(ClientError::Io(e)),
        }
    }

    fn disconnect(&self) -> Result<()> {
        // Already-closed sockets are fine here
        let _ = self.stream.shutdown(Shutdown::Both);
        Ok(())
    }
}
