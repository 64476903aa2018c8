//! Configuration for a tunnel agent, loadable from a TOML file.

use {
    anyhow::Context,
    serde::{Deserialize, Serialize},
    std::{fmt, path::Path, sync::Arc, time::Duration},
    thiserror::Error,
};

use crate::identity::{InvalidPrivateKey, PrivateKey};

/// A caller-supplied transform applied to each chunk flowing from the remote
/// toward the local service, after the Host-header rewrite.
pub type ByteTransform = Arc<dyn Fn(Vec<u8>) -> Vec<u8> + Send + Sync>;

/// Everything needed to run one tunnel agent.
///
/// All fields are fixed once the [`Tunnel`](crate::Tunnel) is constructed.
/// Only the addresses and ports are required in a configuration file; every
/// other field has the default given by [`defaults`].
#[derive(Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
#[non_exhaustive]
pub struct TunnelConfig {
    /// Hostname or IP of the local service to expose.
    pub local_address: String,
    /// Port of the local service.
    pub local_port: u16,
    /// Hostname of the remote tunnel server.
    pub remote_address: String,
    /// Port of the remote tunnel endpoint.
    pub remote_port: u16,
    /// How many pool connections to hold open to the remote.
    #[serde(default = "defaults::max_connections")]
    pub max_connections: usize,
    /// The tunnel's secp256k1 private key; freshly random when omitted.
    #[serde(default)]
    pub private_key: PrivateKey,
    /// Dial the local service over TLS instead of plain TCP.
    #[serde(default = "defaults::secure_local_connection")]
    pub secure_local_connection: bool,
    /// Whether to re-dial after connection loss.
    #[serde(default = "defaults::auto_reconnect")]
    pub auto_reconnect: bool,
    /// Delay before a reconnection attempt, and the period of the pool
    /// refresh heartbeat.
    #[serde(with = "humantime_serde", default = "defaults::auto_reconnect_interval")]
    pub auto_reconnect_interval: Duration,
    /// Optional transform over the remote-to-local byte stream.
    #[serde(skip)]
    pub transform: Option<ByteTransform>,
}

/// The error returned when a configuration fails validation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("local address must not be empty")]
    MissingLocalAddress,
    #[error("remote address must not be empty")]
    MissingRemoteAddress,
    #[error("local port must be nonzero")]
    InvalidLocalPort,
    #[error("remote port must be nonzero")]
    InvalidRemotePort,
    #[error("max_connections must be at least 1")]
    InvalidMaxConnections,
    #[error(transparent)]
    InvalidPrivateKey(#[from] InvalidPrivateKey),
}

impl TunnelConfig {
    /// Read and validate a configuration file.
    pub async fn load(config_path: impl AsRef<Path>) -> Result<TunnelConfig, anyhow::Error> {
        let config: TunnelConfig = toml::from_str(
            &tokio::fs::read_to_string(&config_path)
                .await
                .with_context(|| {
                    format!(
                        "Could not read configuration file: {:?}",
                        config_path.as_ref()
                    )
                })?,
        )?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants that cannot be expressed in the types: nonzero
    /// ports, a nonempty pool, and a private key on the curve.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.local_address.is_empty() {
            return Err(ConfigError::MissingLocalAddress);
        }
        if self.remote_address.is_empty() {
            return Err(ConfigError::MissingRemoteAddress);
        }
        if self.local_port == 0 {
            return Err(ConfigError::InvalidLocalPort);
        }
        if self.remote_port == 0 {
            return Err(ConfigError::InvalidRemotePort);
        }
        if self.max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections);
        }
        self.private_key.signing_key()?;
        Ok(())
    }
}

impl fmt::Debug for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TunnelConfig")
            .field("local_address", &self.local_address)
            .field("local_port", &self.local_port)
            .field("remote_address", &self.remote_address)
            .field("remote_port", &self.remote_port)
            .field("max_connections", &self.max_connections)
            .field("secure_local_connection", &self.secure_local_connection)
            .field("auto_reconnect", &self.auto_reconnect)
            .field("auto_reconnect_interval", &self.auto_reconnect_interval)
            .field("transform", &self.transform.as_ref().map(|_| ".."))
            .finish()
    }
}

pub mod defaults {
    use directories::ProjectDirs;
    use std::{path::PathBuf, time::Duration};

    pub const ORGANIZATION: &str = "Burrow";

    pub const APPLICATION: &str = "burrow";

    pub const CONFIG_FILE: &str = "Burrow.toml";

    pub const fn max_connections() -> usize {
        24
    }

    pub const fn secure_local_connection() -> bool {
        false
    }

    pub const fn auto_reconnect() -> bool {
        true
    }

    pub const fn auto_reconnect_interval() -> Duration {
        Duration::from_secs(30)
    }

    pub fn config_path() -> Result<PathBuf, anyhow::Error> {
        let project_dirs = ProjectDirs::from("", ORGANIZATION, APPLICATION)
            .ok_or_else(|| anyhow::anyhow!("Could not open user's home directory"))?;
        Ok(project_dirs.config_dir().join(CONFIG_FILE))
    }
}
