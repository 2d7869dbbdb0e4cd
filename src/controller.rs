//! Relay controller: accepts connections, sniffs their leading bytes and
//! forwards them, prefix included, to the configured upstream.

pub mod controller_handler;

pub use controller_handler::{relay_session, Controller, RelaySettings};
