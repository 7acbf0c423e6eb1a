//! Node configuration file.

use dst_channel::{AdapterConfig, SessionConfig, WsConfig};
use dst_core::{Address, Credentials, OffChainId, SignatureError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid private key: {0}")]
    Key(#[from] SignatureError),
    #[error("private key controls {derived}, but on_chain_id is {configured}")]
    AddressMismatch { configured: Address, derived: Address },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// WebSocket timings, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WsSection {
    pub write_wait_ms: u64,
    pub pong_wait_ms: u64,
    pub max_message_size: usize,
}

impl Default for WsSection {
    fn default() -> Self {
        let ws = WsConfig::default();
        Self {
            write_wait_ms: ws.write_wait.as_millis() as u64,
            pong_wait_ms: ws.pong_wait.as_millis() as u64,
            max_message_size: ws.max_message_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// `host:port` peers dial to reach this node.
    pub listener_addr: String,
    pub endpoint: String,
    /// Expected on-chain address. Derived from the key when unset.
    pub on_chain_id: Option<Address>,
    /// Hex private key. A random key is generated when unset.
    pub private_key: Option<String>,
    pub max_conn: usize,
    /// Default tracing filter, overridden by `RUST_LOG`.
    pub log_filter: String,
    pub read_write_logging: bool,
    pub ws: WsSection,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listener_addr: "127.0.0.1:9605".into(),
            endpoint: "/dst".into(),
            on_chain_id: None,
            private_key: None,
            max_conn: SessionConfig::default().max_conn,
            log_filter: "info".into(),
            read_write_logging: false,
            ws: WsSection::default(),
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Own identity with credentials attached.
    pub fn identity(&self) -> Result<OffChainId, ConfigError> {
        let credentials = match &self.private_key {
            Some(key) => Credentials::from_hex(key)?,
            None => {
                tracing::warn!("no private_key configured, using a random key");
                Credentials::random()
            }
        };
        if let Some(configured) = self.on_chain_id {
            let derived = credentials.address();
            if derived != configured {
                return Err(ConfigError::AddressMismatch { configured, derived });
            }
        }
        Ok(OffChainId::from_credentials(
            credentials,
            self.listener_addr.clone(),
            self.endpoint.clone(),
        ))
    }

    pub fn session_config(&self) -> Result<SessionConfig, ConfigError> {
        for (field, value) in [
            ("ws.write_wait_ms", self.ws.write_wait_ms),
            ("ws.pong_wait_ms", self.ws.pong_wait_ms),
            ("ws.max_message_size", self.ws.max_message_size as u64),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(field));
            }
        }
        let ws = WsConfig::default()
            .with_write_wait(Duration::from_millis(self.ws.write_wait_ms))
            .with_pong_wait(Duration::from_millis(self.ws.pong_wait_ms))
            .with_max_message_size(self.ws.max_message_size);
        Ok(SessionConfig::default()
            .with_ws(ws)
            .with_adapter(AdapterConfig::default().with_read_write_logging(self.read_write_logging))
            .with_max_conn(self.max_conn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
listener_addr = "10.0.0.5:9700"
max_conn = 4

[ws]
pong_wait_ms = 2000
"#
        )
        .unwrap();

        let config = NodeConfig::load(file.path()).unwrap();
        assert_eq!(config.listener_addr, "10.0.0.5:9700");
        assert_eq!(config.endpoint, "/dst");
        assert_eq!(config.max_conn, 4);
        assert_eq!(config.ws.write_wait_ms, 10_000);

        let session = config.session_config().unwrap();
        assert_eq!(session.max_conn, 4);
        assert_eq!(session.ws.pong_wait, Duration::from_secs(2));
        assert_eq!(session.ws.ping_period, Duration::from_millis(1800));
    }

    #[test]
    fn load_reports_parse_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_conn = \"many\"").unwrap();
        assert!(matches!(
            NodeConfig::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
        assert!(matches!(
            NodeConfig::load(Path::new("/nonexistent/dst-node.toml")),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn zero_timings_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[ws]\npong_wait_ms = 0").unwrap();

        let config = NodeConfig::load(file.path()).unwrap();
        assert!(matches!(
            config.session_config(),
            Err(ConfigError::Zero("ws.pong_wait_ms"))
        ));

        let config = NodeConfig {
            ws: WsSection {
                write_wait_ms: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            config.session_config(),
            Err(ConfigError::Zero("ws.write_wait_ms"))
        ));
    }

    #[test]
    fn identity_from_key() {
        let key = Credentials::random();
        let config = NodeConfig {
            private_key: Some(key.to_hex()),
            on_chain_id: Some(key.address()),
            ..Default::default()
        };
        let id = config.identity().unwrap();
        assert_eq!(id.on_chain_id, key.address());
        assert!(id.credentials().is_some());

        let mismatched = NodeConfig {
            on_chain_id: Some(Address::repeat_byte(1)),
            ..config
        };
        assert!(matches!(
            mismatched.identity(),
            Err(ConfigError::AddressMismatch { .. })
        ));
    }
}
