use crate::discovery::DiscoveryError;
use crate::rpc::RpcError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PluginErrorCode {
    Discovery,
    NotFound,
    Disabled,
    PathValidation,
    SpawnFailed,
    HandshakeTimeout,
    HandshakeFailed,
    Transport,
    Application,
    Timeout,
    HookContract,
    InvalidConfig,
}

impl PluginErrorCode {
    pub const fn as_tag(self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::NotFound => "not_found",
            Self::Disabled => "disabled",
            Self::PathValidation => "path_validation",
            Self::SpawnFailed => "spawn_failed",
            Self::HandshakeTimeout => "handshake_timeout",
            Self::HandshakeFailed => "handshake_failed",
            Self::Transport => "transport",
            Self::Application => "application",
            Self::Timeout => "timeout",
            Self::HookContract => "hook_contract",
            Self::InvalidConfig => "invalid_config",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PluginError {
    #[error("bundle {path} could not be loaded: {source}")]
    Discovery {
        path: PathBuf,
        #[source]
        source: DiscoveryError,
    },

    #[error("plugin '{0}' is not installed")]
    NotFound(String),

    #[error("plugin '{plugin_id}' is disabled: {reason}")]
    Disabled { plugin_id: String, reason: String },

    #[error("plugin '{plugin_id}' executable rejected: {reason}")]
    PathValidation { plugin_id: String, reason: String },

    #[error("plugin '{plugin_id}' failed to spawn: {reason}")]
    Spawn { plugin_id: String, reason: String },

    #[error("plugin '{plugin_id}' did not complete the handshake within {timeout:?}")]
    HandshakeTimeout { plugin_id: String, timeout: Duration },

    #[error("plugin '{plugin_id}' handshake failed: {reason}")]
    Handshake { plugin_id: String, reason: String },

    #[error("plugin '{plugin_id}' connection lost: {reason}")]
    Transport { plugin_id: String, reason: String },

    #[error("plugin '{plugin_id}' returned an error: {message}")]
    Application { plugin_id: String, message: String },

    #[error("plugin '{plugin_id}' did not answer within {timeout:?}")]
    Timeout { plugin_id: String, timeout: Duration },

    #[error("hook call rejected: {0}")]
    HookContract(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PluginError {
    pub fn code(&self) -> PluginErrorCode {
        match self {
            Self::Discovery { .. } => PluginErrorCode::Discovery,
            Self::NotFound(_) => PluginErrorCode::NotFound,
            Self::Disabled { .. } => PluginErrorCode::Disabled,
            Self::PathValidation { .. } => PluginErrorCode::PathValidation,
            Self::Spawn { .. } => PluginErrorCode::SpawnFailed,
            Self::HandshakeTimeout { .. } => PluginErrorCode::HandshakeTimeout,
            Self::Handshake { .. } => PluginErrorCode::HandshakeFailed,
            Self::Transport { .. } => PluginErrorCode::Transport,
            Self::Application { .. } => PluginErrorCode::Application,
            Self::Timeout { .. } => PluginErrorCode::Timeout,
            Self::HookContract(_) => PluginErrorCode::HookContract,
            Self::Config(_) => PluginErrorCode::InvalidConfig,
        }
    }

    /// Maps a bridge failure onto the plugin-level taxonomy, keeping the
    /// "plugin is dead" and "plugin said no" cases apart.
    pub fn from_rpc(plugin_id: &str, err: RpcError) -> Self {
        match err {
            RpcError::Transport(reason) => Self::Transport {
                plugin_id: plugin_id.to_string(),
                reason,
            },
            RpcError::Application(message) => Self::Application {
                plugin_id: plugin_id.to_string(),
                message,
            },
            RpcError::Timeout(timeout) => Self::Timeout {
                plugin_id: plugin_id.to_string(),
                timeout,
            },
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

pub type Result<T, E = PluginError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_errors_keep_their_category() {
        let dead = PluginError::from_rpc("x", RpcError::Transport("eof".to_string()));
        let said_no = PluginError::from_rpc("x", RpcError::Application("nope".to_string()));

        assert!(dead.is_transport());
        assert_eq!(dead.code(), PluginErrorCode::Transport);
        assert!(!said_no.is_transport());
        assert_eq!(said_no.code().as_tag(), "application");
        assert!(said_no.to_string().contains("nope"));
    }
}
