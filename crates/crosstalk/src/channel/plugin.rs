//! Plugin registry for connector factories.
//!
//! Third-party connectors register a [`ConnectorFactory`] declaring their
//! platform kind and capability manifest. Manifests are validated here, at
//! load time, so a broken plugin is a descriptive registration error rather
//! than a crash on the first message.

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tracing::info;

use crosstalk_connector_protocol::{Capabilities, PlatformKind};

use super::connector::{Channel, Connector, Credentials};

// ============================================================================
// ConnectorFactory
// ============================================================================

/// Produces connector instances for one platform kind.
pub trait ConnectorFactory: Send + Sync {
    /// The platform this factory builds connectors for.
    fn platform(&self) -> PlatformKind;

    /// The capability manifest every produced connector honors.
    fn manifest(&self) -> Capabilities;

    /// Build a connector for one account.
    fn create(&self, account: &str, credentials: &Credentials)
        -> Result<Box<dyn Connector>, PluginError>;
}

// ============================================================================
// PluginError
// ============================================================================

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("no connector registered for platform '{0}'")]
    UnknownPlatform(PlatformKind),

    #[error("a connector for platform '{0}' is already registered")]
    DuplicatePlatform(PlatformKind),

    #[error("invalid capability manifest for platform '{platform}': {reason}")]
    InvalidManifest {
        platform: PlatformKind,
        reason: String,
    },

    #[error("connector construction failed: {0}")]
    Construction(String),
}

// ============================================================================
// PluginRegistry
// ============================================================================

#[derive(Clone, Default)]
pub struct PluginRegistry {
    factories: Arc<DashMap<String, Arc<dyn ConnectorFactory>>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory after validating its manifest.
    pub fn register(&self, factory: Arc<dyn ConnectorFactory>) -> Result<(), PluginError> {
        let platform = factory.platform();
        validate_manifest(&platform, &factory.manifest())?;

        if self.factories.contains_key(platform.as_str()) {
            return Err(PluginError::DuplicatePlatform(platform));
        }
        info!(platform = %platform, "Registered connector factory");
        self.factories.insert(platform.as_str().to_string(), factory);
        Ok(())
    }

    /// Build a channel and its connector for a platform + account pair.
    pub fn create(
        &self,
        platform: &str,
        account: &str,
        credentials: &Credentials,
    ) -> Result<(Channel, Box<dyn Connector>), PluginError> {
        let factory = self
            .factories
            .get(platform)
            .ok_or_else(|| PluginError::UnknownPlatform(PlatformKind::new(platform)))?;
        let connector = factory.create(account, credentials)?;
        let channel = Channel::new(factory.platform(), account, factory.manifest());
        Ok((channel, connector))
    }

    pub fn platforms(&self) -> Vec<PlatformKind> {
        self.factories
            .iter()
            .map(|e| e.value().platform())
            .collect()
    }
}

fn validate_manifest(platform: &PlatformKind, manifest: &Capabilities) -> Result<(), PluginError> {
    if platform.as_str().is_empty() {
        return Err(PluginError::InvalidManifest {
            platform: platform.clone(),
            reason: "platform kind must not be empty".to_string(),
        });
    }
    if manifest.platform != *platform {
        return Err(PluginError::InvalidManifest {
            platform: platform.clone(),
            reason: format!(
                "manifest declares platform '{}' but factory declares '{}'",
                manifest.platform, platform
            ),
        });
    }
    if manifest.max_message_bytes == 0 {
        return Err(PluginError::InvalidManifest {
            platform: platform.clone(),
            reason: "max_message_bytes must be greater than zero".to_string(),
        });
    }
    if let Some(limit) = manifest.rate_limit {
        if limit.messages_per_minute == 0 {
            return Err(PluginError::InvalidManifest {
                platform: platform.clone(),
                reason: "rate_limit.messages_per_minute must be greater than zero".to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LoopbackFactory;

    #[test]
    fn register_and_create() {
        let registry = PluginRegistry::new();
        registry
            .register(Arc::new(LoopbackFactory::default()))
            .unwrap();

        let (channel, _connector) = registry
            .create("loopback", "demo", &Credentials::default())
            .unwrap();
        assert_eq!(channel.id.as_str(), "loopback:demo");
        assert_eq!(registry.platforms().len(), 1);
    }

    #[test]
    fn duplicate_platform_rejected() {
        let registry = PluginRegistry::new();
        registry
            .register(Arc::new(LoopbackFactory::default()))
            .unwrap();
        let err = registry
            .register(Arc::new(LoopbackFactory::default()))
            .unwrap_err();
        assert!(matches!(err, PluginError::DuplicatePlatform(_)));
    }

    #[test]
    fn unknown_platform_rejected() {
        let registry = PluginRegistry::new();
        let err = registry
            .create("carrier-pigeon", "a", &Credentials::default())
            .err()
            .expect("unregistered platform must not produce a connector");
        assert!(matches!(err, PluginError::UnknownPlatform(_)));
    }

    #[test]
    fn invalid_manifest_rejected() {
        struct BadFactory;
        impl ConnectorFactory for BadFactory {
            fn platform(&self) -> PlatformKind {
                PlatformKind::new("bad")
            }
            fn manifest(&self) -> Capabilities {
                // Zero max size is never a valid platform limit.
                Capabilities::text_only("bad", 0)
            }
            fn create(
                &self,
                _account: &str,
                _credentials: &Credentials,
            ) -> Result<Box<dyn Connector>, PluginError> {
                unreachable!("registration must fail before create")
            }
        }

        let registry = PluginRegistry::new();
        let err = registry.register(Arc::new(BadFactory)).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("invalid capability manifest"));
        assert!(msg.contains("max_message_bytes"));
    }

    #[test]
    fn mismatched_manifest_platform_rejected() {
        struct MismatchedFactory;
        impl ConnectorFactory for MismatchedFactory {
            fn platform(&self) -> PlatformKind {
                PlatformKind::new("alpha")
            }
            fn manifest(&self) -> Capabilities {
                Capabilities::text_only("beta", 4096)
            }
            fn create(
                &self,
                _account: &str,
                _credentials: &Credentials,
            ) -> Result<Box<dyn Connector>, PluginError> {
                unreachable!()
            }
        }

        let registry = PluginRegistry::new();
        let err = registry.register(Arc::new(MismatchedFactory)).unwrap_err();
        assert!(matches!(err, PluginError::InvalidManifest { .. }));
    }
}
