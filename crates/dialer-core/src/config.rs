//! ============================================================================
//! Dialer Configuration
//! ============================================================================
//! All settings come from the environment (optionally seeded from `.env`).
//! Gateway settings may be missing at start-up; the gap only surfaces as a
//! ConfigurationError when a call is actually dispatched.
//! ============================================================================

use std::time::Duration;

use crate::types::{DialerError, DialerResult};

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_SIP_PORT: u16 = 5060;
pub const DEFAULT_GATEWAY_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CAMPAIGN_PARALLELISM: usize = 4;

/// Optional SIP trunk the gateway originates through
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipTrunk {
    pub address: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Voice gateway connection settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub transfer_destination: Option<String>,
    pub sip_trunk: Option<SipTrunk>,
    pub timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            transfer_destination: None,
            sip_trunk: None,
            timeout: Duration::from_secs(DEFAULT_GATEWAY_TIMEOUT_SECS),
        }
    }
}

impl GatewayConfig {
    /// Endpoint, credential and transfer destination, or the first missing one
    pub fn require(&self) -> DialerResult<(url::Url, &str, &str)> {
        let endpoint = self
            .endpoint
            .as_deref()
            .ok_or_else(|| DialerError::Configuration("VOICE_GATEWAY_URL is not set".into()))?;
        let endpoint = url::Url::parse(endpoint).map_err(|e| {
            DialerError::Configuration(format!("VOICE_GATEWAY_URL is not a valid URL: {}", e))
        })?;
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| DialerError::Configuration("VOICE_GATEWAY_API_KEY is not set".into()))?;
        let transfer_to = self
            .transfer_destination
            .as_deref()
            .ok_or_else(|| DialerError::Configuration("TRANSFER_DESTINATION is not set".into()))?;
        Ok((endpoint, api_key, transfer_to))
    }
}

/// Process-wide settings
#[derive(Debug, Clone)]
pub struct DialerConfig {
    pub bind_addr: String,
    pub db_path: Option<String>,
    pub gateway: GatewayConfig,
    pub webhook_secret: Option<String>,
    pub campaign_parallelism: usize,
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            db_path: None,
            gateway: GatewayConfig::default(),
            webhook_secret: None,
            campaign_parallelism: DEFAULT_CAMPAIGN_PARALLELISM,
        }
    }
}

impl DialerConfig {
    /// Read settings from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup; blank values count as unset
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let sip_trunk = get("SIP_TRUNK_ADDRESS").map(|address| SipTrunk {
            address,
            port: parse_or(get("SIP_TRUNK_PORT"), "SIP_TRUNK_PORT", DEFAULT_SIP_PORT),
            username: get("SIP_TRUNK_USERNAME"),
            password: get("SIP_TRUNK_PASSWORD"),
        });

        let timeout_secs = parse_or(
            get("VOICE_GATEWAY_TIMEOUT_SECS"),
            "VOICE_GATEWAY_TIMEOUT_SECS",
            DEFAULT_GATEWAY_TIMEOUT_SECS,
        );

        Self {
            bind_addr: get("DIALER_BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            db_path: get("DIALER_DB_PATH"),
            gateway: GatewayConfig {
                endpoint: get("VOICE_GATEWAY_URL"),
                api_key: get("VOICE_GATEWAY_API_KEY"),
                transfer_destination: get("TRANSFER_DESTINATION"),
                sip_trunk,
                timeout: Duration::from_secs(timeout_secs.max(1)),
            },
            webhook_secret: get("WEBHOOK_SECRET"),
            campaign_parallelism: parse_or(
                get("DISPATCH_CAMPAIGN_PARALLELISM"),
                "DISPATCH_CAMPAIGN_PARALLELISM",
                DEFAULT_CAMPAIGN_PARALLELISM,
            )
            .max(1),
        }
    }
}

fn parse_or<T: std::str::FromStr + Copy + std::fmt::Display>(value: Option<String>, key: &str, default: T) -> T {
    match value {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring invalid {}={:?}, using {}", key, raw, default);
            default
        }),
        None => default,
    }
}
