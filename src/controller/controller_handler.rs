use log::{debug, error, info, warn};
use std::time::Duration;
use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio::time::timeout;
use uuid::Uuid;

use crate::configuration::config::Config;
use crate::error_handling::types::*;
use crate::network::conn_sniffer::{ConnDiagnostics, SnifferHandle};
use crate::network::network_listener::NetworkListener;
use crate::network::session_request::SessionRequest;

const SESSION_CHANNEL_CAPACITY: usize = 100;

/// Per-session knobs of the relay, extracted from [`Config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySettings {
    pub sniff_bytes: usize,
    pub sniff_timeout: Duration,
    pub keep_mirrors: bool,
}

impl From<&Config> for RelaySettings {
    fn from(config: &Config) -> Self {
        Self {
            sniff_bytes: config.sniff_bytes,
            sniff_timeout: config.sniff_timeout(),
            keep_mirrors: config.sniffer.keep_mirrors,
        }
    }
}

pub struct Controller {
    pub config: Config,
}

impl Controller {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Binds the listener and relays every accepted connection to the
    /// configured upstream until the accept loop ends.
    pub async fn run(self) -> Result<(), ControllerError> {
        let (tx, mut rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
        let listener = NetworkListener::bind(
            &self.config.listen_address,
            tx,
            self.config.sniffer.clone(),
        )
        .await?;

        let accept_loop = tokio::spawn(async move { listener.start_listening().await });
        let settings = RelaySettings::from(&self.config);

        // Ends once the accept loop dropped the sender.
        while let Some(request) = rx.recv().await {
            let upstream_address = self.config.upstream_address.clone();
            tokio::spawn(async move {
                let session_id = request.session_id;
                if let Err(e) = handle_session(request, &upstream_address, settings).await {
                    error!("[{}] Session failed: {}", session_id, e);
                }
            });
        }

        accept_loop_outcome(accept_loop.await)
    }
}

/// Maps the joined accept loop to the controller result, keeping a task
/// failure apart from the listener's own errors.
fn accept_loop_outcome(
    joined: Result<Result<(), NetworkError>, JoinError>,
) -> Result<(), ControllerError> {
    match joined {
        Ok(result) => result.map_err(ControllerError::from),
        Err(e) => {
            error!("[!] Accept loop task failed: {}", e);
            Err(ControllerError::TaskFailed(e))
        }
    }
}

async fn handle_session(
    request: SessionRequest,
    upstream_address: &str,
    settings: RelaySettings,
) -> Result<(), NetworkError> {
    let upstream = TcpStream::connect(upstream_address).await.map_err(|e| {
        request.handle().stop_mirroring();
        NetworkError::UpstreamConnectFailed(e)
    })?;
    debug!("[{}] Connected to upstream {}", request.session_id, upstream_address);

    relay_session(request, upstream, settings).await.map(|_| ())
}

/// Sniffs the leading bytes of `request`, hands the connection off and relays
/// it to `upstream` in both directions.
///
/// The upstream receives the whole client stream, sniffed prefix included. A
/// client that does not deliver `sniff_bytes` within `sniff_timeout` is
/// handed off with whatever was sniffed so far.
///
/// Returns the number of bytes copied client to upstream and upstream to
/// client.
pub async fn relay_session<S, U>(
    request: SessionRequest<S>,
    mut upstream: U,
    settings: RelaySettings,
) -> Result<(u64, u64), NetworkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let SessionRequest {
        session_id,
        mut stream,
        client_addr,
        ..
    } = request;
    let handle = stream.handle();

    match timeout(settings.sniff_timeout, stream.sniff(settings.sniff_bytes)).await {
        Ok(Ok(prefix)) => {
            info!(
                "[{}] {} opened with {} leading bytes",
                session_id,
                client_addr,
                prefix.len()
            );
            debug!("[{}] leading bytes: \"{}\"", session_id, prefix.escape_ascii());
        }
        Ok(Err(e)) => {
            warn!("[{}] Read failed while sniffing: {}", session_id, e);
            log_diagnostics(session_id, &handle);
            return Err(NetworkError::RelayError(e));
        }
        Err(_) => {
            warn!(
                "[{}] {} sent fewer than {} bytes within {:?}, handing off anyway",
                session_id, client_addr, settings.sniff_bytes, settings.sniff_timeout
            );
        }
    }

    stream.stop_sniffing();
    if !settings.keep_mirrors {
        handle.stop_mirroring();
    }

    match copy_bidirectional(&mut stream, &mut upstream).await {
        Ok((to_upstream, to_client)) => {
            info!(
                "[{}] Relay finished: {} bytes to upstream, {} bytes to client",
                session_id, to_upstream, to_client
            );
            Ok((to_upstream, to_client))
        }
        Err(e) => {
            log_diagnostics(session_id, &handle);
            Err(NetworkError::RelayError(e))
        }
    }
}

fn log_diagnostics(session_id: Uuid, handle: &SnifferHandle) {
    let Some(snapshot) = handle.snapshot() else {
        return;
    };
    match snapshot.to_json() {
        Ok(json) => error!("[{}] Connection diagnostics: {}", session_id, json),
        Err(e) => warn!("[{}] Unable to serialize diagnostics: {}", session_id, e),
    }
}
