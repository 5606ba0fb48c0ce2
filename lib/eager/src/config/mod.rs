// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Eager runtime configuration.
//!
//! Sources in priority order (lowest to highest):
//! 1. Code defaults
//! 2. System config file at /opt/dynamo/etc/eager.toml
//! 3. TOML file from the `DYN_EAGER_CONFIG_PATH` environment variable
//! 4. Environment variables (`DYN_EAGER_<SECTION>_*`)
//!
//! Example:
//! ```toml
//! [tokio]
//! worker_threads = 4
//!
//! [client]
//! request_timeout_ms = 30000
//!
//! [executor]
//! max_pending_nodes = 4096
//! ```

mod client;
mod executor;
mod tokio;

pub use client::ClientConfig;
pub use executor::ExecutorConfig;
pub use tokio::TokioConfig;

use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    value::{Dict, Map},
    Figment, Metadata, Profile, Provider,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::{Validate, ValidationErrors};

/// ENV naming an extra TOML config file
const CONFIG_PATH_ENV: &str = "DYN_EAGER_CONFIG_PATH";

const SYSTEM_CONFIG_PATH: &str = "/opt/dynamo/etc/eager.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to extract configuration: {0}")]
    Extraction(#[from] Box<figment::Error>),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("Configuration error: {0}")]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct EagerConfig {
    #[validate(nested)]
    #[serde(default)]
    pub tokio: TokioConfig,

    #[validate(nested)]
    #[serde(default)]
    pub client: ClientConfig,

    #[validate(nested)]
    #[serde(default)]
    pub executor: ExecutorConfig,
}

impl EagerConfig {
    /// Figment with every configuration source merged.
    pub fn figment() -> Figment {
        let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();

        Figment::new()
            .merge(Serialized::defaults(EagerConfig::default()))
            .merge(Toml::file(SYSTEM_CONFIG_PATH))
            .merge(Toml::file(&config_path))
            // DYN_EAGER_TOKIO_WORKER_THREADS, DYN_EAGER_TOKIO_MAX_BLOCKING_THREADS
            .merge(section_env("DYN_EAGER_TOKIO_", "tokio"))
            // DYN_EAGER_CLIENT_REQUEST_TIMEOUT_MS
            .merge(section_env("DYN_EAGER_CLIENT_", "client"))
            // DYN_EAGER_EXECUTOR_MAX_PENDING_NODES
            .merge(section_env("DYN_EAGER_EXECUTOR_", "executor"))
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment())
    }

    /// Extract and validate configuration from any provider.
    ///
    /// ```rust,ignore
    /// let config = EagerConfig::extract_from(
    ///     EagerConfig::figment().merge(("client.request_timeout_ms", 5000u64)),
    /// )?;
    /// ```
    pub fn extract_from<T: Provider>(provider: T) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(provider)
            .extract()
            .map_err(|e| ConfigError::Extraction(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults and environment, with `extra` merged at the highest priority.
    pub fn figment_with<T: Provider>(extra: T) -> Figment {
        Self::figment().merge(extra)
    }

    /// JSON overrides take priority over env vars, TOML files and defaults.
    pub fn from_figment_with_json(json: &str) -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment().merge(Json::string(json)))
    }
}

/// Lets an `EagerConfig` seed another figment, so embedding applications can
/// extract their own sections from the same sources.
impl Provider for EagerConfig {
    fn metadata(&self) -> Metadata {
        Metadata::named("EagerConfig")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, figment::Error> {
        Serialized::defaults(self).data()
    }
}

fn section_env(prefix: &str, section: &'static str) -> Env {
    Env::prefixed(prefix).map(move |k| format!("{section}.{}", k.as_str().to_lowercase()).into())
}

fn env_is_truthy(name: &str) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "on" | "yes"
        ),
        Err(_) => false,
    }
}

/// Emit logs as JSON lines (`DYN_LOGGING_JSONL`).
pub fn jsonl_logging_enabled() -> bool {
    env_is_truthy("DYN_LOGGING_JSONL")
}

/// Disable ANSI colors in readable logs (`DYN_SDK_DISABLE_ANSI_LOGGING`).
pub fn disable_ansi_logging() -> bool {
    env_is_truthy("DYN_SDK_DISABLE_ANSI_LOGGING")
}

/// Local instead of UTC log timestamps (`DYN_LOG_USE_LOCAL_TZ`).
pub fn use_local_timezone() -> bool {
    env_is_truthy("DYN_LOG_USE_LOCAL_TZ")
}
