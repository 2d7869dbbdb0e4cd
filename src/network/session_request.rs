use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use uuid::Uuid;

use super::conn_sniffer::{SnifferHandle, SniffingStream};

/// An accepted connection, already wrapped for sniffing, on its way to a handler.
pub struct SessionRequest<S = TcpStream> {
    pub session_id: Uuid,
    pub stream: SniffingStream<S>,
    pub client_addr: SocketAddr,
    pub timestamp: DateTime<Utc>,
}

impl<S> SessionRequest<S> {
    /// Handle that keeps reporting diagnostics after `stream` was moved away.
    pub fn handle(&self) -> SnifferHandle {
        self.stream.handle()
    }
}
