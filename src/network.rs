pub mod conn_sniffer;
pub mod connection;
pub mod network_listener;
mod replay_buffer;
pub mod session_request;

pub use conn_sniffer::{ConnDiagnostics, SnifferHandle, SniffingStream};
pub use connection::{Connection, Deadlines};
pub use network_listener::NetworkListener;
pub use session_request::SessionRequest;
