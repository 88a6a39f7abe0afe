// Application configuration.
// Logging can only be switched off in development builds.

use crate::error::SessionError;
use serde::{Deserialize, Serialize};

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true;

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false;

#[cfg(debug_assertions)]
pub mod dev {
    // Flip to false to silence logging entirely in a debug build.
    // Only honoured in debug builds.
    pub const ENABLE_LOGGING: bool = true;
}

#[cfg(not(debug_assertions))]
pub mod dev {
    pub const ENABLE_LOGGING: bool = false;
}

/// Label of the single data channel the initiator opens.
pub const DEFAULT_CHANNEL_LABEL: &str = "messages";

/// Pause between file chunks so the channel's send buffer is not flooded.
pub const DEFAULT_CHUNK_DELAY_MS: u64 = 10;

pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// ICE server entry ('stun' or 'turn').
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub id: String,
    pub r#type: String,
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl ServerConfig {
    pub fn stun(id: &str, url: &str) -> Self {
        Self {
            id: id.into(),
            r#type: "stun".into(),
            url: url.into(),
            username: None,
            credential: None,
        }
    }

    pub fn turn(id: &str, url: &str, username: &str, credential: &str) -> Self {
        Self {
            id: id.into(),
            r#type: "turn".into(),
            url: url.into(),
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }
}

/// Public STUN servers used when no custom list is configured.
pub fn default_ice_servers() -> Vec<ServerConfig> {
    vec![
        ServerConfig::stun("default-stun-0", "stun:stun.l.google.com:19302"),
        ServerConfig::stun("default-stun-1", "stun:stun1.l.google.com:19302"),
        ServerConfig::stun("default-stun-2", "stun:stun2.l.google.com:19302"),
    ]
}

/// Settings for one [`PeerSession`](crate::session::PeerSession).
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SessionConfig {
    pub ice_servers: Vec<ServerConfig>,
    pub channel_label: String,
    pub chunk_delay_ms: u64,
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            channel_label: DEFAULT_CHANNEL_LABEL.into(),
            chunk_delay_ms: DEFAULT_CHUNK_DELAY_MS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl SessionConfig {
    /// Rejects configurations the transport would choke on later.
    pub fn validate(&self) -> Result<(), SessionError> {
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(SessionError::Config(format!(
                    "ICE server '{}' has an empty url",
                    server.id
                )));
            }

            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(SessionError::Config(format!(
                    "TURN server '{}' requires username and credential",
                    server.id
                )));
            }
        }

        if self.channel_label.is_empty() {
            return Err(SessionError::Config("channel label cannot be empty".into()));
        }

        if self.event_capacity == 0 {
            return Err(SessionError::Config("event capacity must be positive".into()));
        }

        Ok(())
    }

    pub fn chunk_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.chunk_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ice_servers.len(), 3);
        assert_eq!(config.channel_label, "messages");
    }

    #[test]
    fn turn_without_credentials_is_rejected() {
        let mut turn = ServerConfig::turn("t", "turn.example.org:3478", "u", "p");
        turn.credential = None;
        let config = SessionConfig {
            ice_servers: vec![turn],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(SessionError::Config(_))));
    }

    #[test]
    fn empty_url_is_rejected() {
        let config = SessionConfig {
            ice_servers: vec![ServerConfig::stun("s", "")],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(SessionError::Config(_))));
    }

    #[test]
    fn zero_event_capacity_is_rejected() {
        let config = SessionConfig {
            event_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: SessionConfig = serde_json::from_str(r#"{"chunk_delay_ms": 0}"#).unwrap();
        assert_eq!(config.chunk_delay_ms, 0);
        assert_eq!(config.channel_label, DEFAULT_CHANNEL_LABEL);
        assert!(!config.ice_servers.is_empty());
    }
}
