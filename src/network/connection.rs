//! Capability traits for the non-I/O part of a duplex connection.
//!
//! Reading, writing, flushing and shutting down are covered by the standard
//! `std::io` and `tokio::io` traits. Addresses and timeouts have no common
//! trait, so wrappers that must stay interchangeable with a raw socket forward
//! them through these.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

/// Local and remote endpoints of a connected socket.
pub trait Connection {
    fn local_addr(&self) -> io::Result<SocketAddr>;
    fn peer_addr(&self) -> io::Result<SocketAddr>;
}

/// Blocking read/write timeouts of a socket.
pub trait Deadlines {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
    fn read_timeout(&self) -> io::Result<Option<Duration>>;
    fn write_timeout(&self) -> io::Result<Option<Duration>>;
}

impl Connection for tokio::net::TcpStream {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        tokio::net::TcpStream::local_addr(self)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        tokio::net::TcpStream::peer_addr(self)
    }
}

impl Connection for std::net::TcpStream {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        std::net::TcpStream::local_addr(self)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        std::net::TcpStream::peer_addr(self)
    }
}

impl Deadlines for std::net::TcpStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        std::net::TcpStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        std::net::TcpStream::set_write_timeout(self, timeout)
    }

    fn read_timeout(&self) -> io::Result<Option<Duration>> {
        std::net::TcpStream::read_timeout(self)
    }

    fn write_timeout(&self) -> io::Result<Option<Duration>> {
        std::net::TcpStream::write_timeout(self)
    }
}
