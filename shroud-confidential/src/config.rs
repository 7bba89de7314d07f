use std::path::Path;

use config::{Config, ConfigError};
use serde::{Deserialize, Serialize};
use x25519_dalek::PublicKey;

use crate::key_management::{parse_public_key_hex, KeyManagementError};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ShroudConfidentialConfig {
    /// Hex-encoded public keys of the cluster nodes, in fold order
    pub cluster_public_keys: Vec<String>,

    /// Whether the client keeps one session key pair across requests instead
    /// of generating a fresh pair for each of them
    #[serde(default)]
    pub reuse_session_key: bool,
}

impl ShroudConfidentialConfig {
    #[must_use]
    pub const fn new(cluster_public_keys: Vec<String>, reuse_session_key: bool) -> Self {
        Self {
            cluster_public_keys,
            reuse_session_key,
        }
    }

    /// Parses the configured cluster keys, preserving their order
    ///
    /// # Errors
    ///
    /// Returns `KeyManagementError::EmptyPeerSet` if no key is configured and
    /// `KeyManagementError::InvalidKey` for a malformed key
    pub fn cluster_keys(&self) -> Result<Vec<PublicKey>, KeyManagementError> {
        if self.cluster_public_keys.is_empty() {
            return Err(KeyManagementError::EmptyPeerSet);
        }
        self.cluster_public_keys
            .iter()
            .map(|key| parse_public_key_hex(key))
            .collect()
    }

    /// Loads the configuration from a file path
    ///
    /// Values can be overridden with `SHROUD_CONFIDENTIAL__*` environment
    /// variables.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the file cannot be read or the
    /// `shroud_confidential` section is missing or malformed.
    pub fn from_file_path<P: AsRef<Path>>(config_file_path: P) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(config::File::from(config_file_path.as_ref()))
            .add_source(
                config::Environment::with_prefix("SHROUD_CONFIDENTIAL")
                    .keep_prefix(true)
                    .separator("__"),
            );

        builder.build()?.get::<Self>("shroud_confidential")
    }
}
