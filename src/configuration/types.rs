use serde::Deserialize;

fn default_true() -> bool {
    true
}

/// Per-connection sniffer behavior.
#[derive(Debug, PartialEq, Clone, Deserialize)]
#[serde(default)]
pub struct SnifferConfig {
    /// Whether read/write mirroring starts enabled for new connections.
    #[serde(default = "default_true")]
    pub mirror: bool,

    /// Whether per-sniff log records include the raw sniffed bytes.
    #[serde(default = "default_true")]
    pub log_payload: bool,

    /// Keep mirroring after the connection was handed off. When `false` the
    /// mirrors are released right after the sniffed prefix was logged.
    pub keep_mirrors: bool,
}

impl Default for SnifferConfig {
    fn default() -> Self {
        Self {
            mirror: true,
            log_payload: true,
            keep_mirrors: false,
        }
    }
}
