//! Capability manifest declared by every connector implementation.
//!
//! The gateway consults the manifest when routing (max payload size, media
//! support) and validates it when a plugin is loaded.

use serde::{Deserialize, Serialize};

/// The platform a connector speaks for, e.g. `"telegram"`, `"sms"`, `"api"`.
///
/// Free-form rather than a closed enum so third-party connectors can register
/// platforms the gateway has never heard of.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlatformKind(pub String);

impl PlatformKind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A connector's self-declared rate limit, advisory for the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitHint {
    pub messages_per_minute: u32,
}

/// The capability set a connector declares at registration time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    pub platform: PlatformKind,
    #[serde(default)]
    pub supports_typing_indicator: bool,
    #[serde(default)]
    pub supports_media: bool,
    /// Largest outbound message body the platform accepts, in bytes.
    pub max_message_bytes: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitHint>,
}

impl Capabilities {
    /// A minimal text-only manifest for the given platform.
    pub fn text_only(platform: impl Into<String>, max_message_bytes: usize) -> Self {
        Self {
            platform: PlatformKind::new(platform),
            supports_typing_indicator: false,
            supports_media: false,
            max_message_bytes,
            rate_limit: None,
        }
    }
}
