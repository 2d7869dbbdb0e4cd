//! # Network Listener Module
//!
//! Accepts TCP connections, wraps each one in a [`SniffingStream`] and forwards
//! it as a [`SessionRequest`] through an async channel.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌──────────────────┐    ┌─────────────────┐
//! │ Incoming        │───▶│ NetworkListener  │───▶│ Controller      │
//! │ Connections     │    │                  │    │ (via mpsc)      │
//! └─────────────────┘    │ - SniffingStream │    └─────────────────┘
//!                        │   wrapping       │
//!                        └──────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tokio::sync::mpsc;
//! use connsniff::configuration::types::SnifferConfig;
//! use connsniff::network::network_listener::NetworkListener;
//! use connsniff::error_handling::types::NetworkError;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), NetworkError> {
//!     let (tx, mut rx) = mpsc::channel(100);
//!
//!     let listener = NetworkListener::bind("127.0.0.1:8080", tx, SnifferConfig::default()).await?;
//!     tokio::spawn(async move { listener.start_listening().await });
//!
//!     while let Some(request) = rx.recv().await {
//!         println!("connection from {}", request.client_addr);
//!     }
//!     Ok(())
//! }
//! ```

use chrono::Utc;
use log::{debug, error, info};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::mpsc::Sender;
use uuid::Uuid;

use super::conn_sniffer::SniffingStream;
use super::session_request::SessionRequest;
use crate::configuration::types::SnifferConfig;
use crate::error_handling::types::NetworkError;

/// A TCP listener that hands every accepted connection, wrapped for sniffing,
/// to the session channel.
///
/// The listener does not look at the bytes of a connection; deciding what to
/// do with the sniffed prefix is up to the receiver of the channel.
pub struct NetworkListener {
    /// Bound listening socket
    listener: TcpListener,

    /// Channel sender for forwarding accepted connections
    session_tx: Sender<SessionRequest>,

    /// Settings applied to every wrapped connection
    sniffer_config: SnifferConfig,
}

impl NetworkListener {
    /// Binds a listener to `address`.
    ///
    /// # Errors
    ///
    /// Returns `NetworkError::BindError` if the address cannot be bound, e.g. when it is already
    /// in use or binding requires privileges the process lacks.
    pub async fn bind(
        address: &str,
        session_tx: Sender<SessionRequest>,
        sniffer_config: SnifferConfig,
    ) -> Result<Self, NetworkError> {
        let listener = TcpListener::bind(address).await.map_err(|err| {
            error!("[!] Unable to bind {}: {:?}", address, err);
            NetworkError::BindError(err)
        })?;

        info!("Listening on {}", address);
        Ok(Self {
            listener,
            session_tx,
            sniffer_config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        self.listener.local_addr().map_err(NetworkError::BindError)
    }

    /// Accepts a single connection and forwards it to the session channel.
    pub async fn accept_one(&self) -> Result<(), NetworkError> {
        let (socket, client_addr) = self
            .listener
            .accept()
            .await
            .map_err(NetworkError::AcceptError)?;

        let session_id = Uuid::new_v4();
        debug!("[{}] accepted connection from {}", session_id, client_addr);

        let request = SessionRequest {
            session_id,
            stream: SniffingStream::with_id(socket, session_id, &self.sniffer_config),
            client_addr,
            timestamp: Utc::now(),
        };

        self.session_tx
            .send(request)
            .await
            .map_err(|_| NetworkError::ChannelFailed)
    }

    /// Runs the accept loop until the session channel is closed.
    ///
    /// Accept failures are logged and the loop keeps going; they are usually transient (e.g. the
    /// process ran out of file descriptors).
    ///
    /// # Errors
    ///
    /// Returns `NetworkError::ChannelFailed` once the receiving side of the session channel was
    /// dropped.
    pub async fn start_listening(&self) -> Result<(), NetworkError> {
        loop {
            match self.accept_one().await {
                Ok(()) => {}
                Err(NetworkError::AcceptError(err)) => {
                    error!("[!] Accept failed: {:?}", err);
                }
                Err(err) => return Err(err),
            }
        }
    }
}
