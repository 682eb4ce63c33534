//! Unified server configuration

use anyhow::Result;

use greetline_core::config::{CoreConfig, DeliveryConfig};

/// Everything the unified server process needs
#[derive(Debug, Clone)]
pub struct UnifiedConfig {
    pub core: CoreConfig,
    pub delivery: DeliveryConfig,
}

impl UnifiedConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            core: CoreConfig::from_env()?,
            delivery: DeliveryConfig::from_env()?,
        })
    }
}
