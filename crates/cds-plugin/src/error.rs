use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to spawn plugin '{plugin}': {reason}")]
    Spawn { plugin: String, reason: String },

    #[error("plugin '{plugin}' did not become ready within {timeout:?}")]
    HandshakeTimeout { plugin: String, timeout: Duration },

    #[error("plugin handshake failed: {0}")]
    Handshake(String),

    #[error("plugin transport failure: {0}")]
    Transport(String),

    #[error("malformed plugin message: {source}\n  line: {line}")]
    Protocol {
        line: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("plugin returned an error: {0}")]
    Remote(String),

    #[error("plugin manifest is invalid: {0}")]
    Manifest(#[from] serde_yaml::Error),
}
