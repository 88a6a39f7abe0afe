use crate::config::ServerConfig;
use rand::Rng;

/// One 64-bit random token, hex encoded.
pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

/// Session identifiers are two independent tokens back to back, so a
/// collision needs both 64-bit draws to repeat.
pub fn generate_session_id() -> String {
    format!("{}{}", random_id(), random_id())
}

/// Wall clock in milliseconds, used for frame and relay timestamps.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// Prefix a scheme to an ICE server url when it is missing.
pub fn add_ice_url_scheme(config: &ServerConfig) -> String {
    if config.url.starts_with("turn:")
        || config.url.starts_with("turns:")
        || config.url.starts_with("stun:")
    {
        config.url.clone()
    } else {
        let scheme = if config.r#type == "turn" {
            "turn:"
        } else {
            "stun:"
        };
        format!("{}{}", scheme, config.url)
    }
}
