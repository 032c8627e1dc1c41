use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::codec::{EncryptedCodec, PlainCodec, ProviderCodec, SignedCodec};
use crate::db::IdempotencyGuard;
use crate::domain::Provider;
use crate::services::PollingConfig;
use crate::utils::sanitize::mask_str;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Where and how to reach a provider's status-query API.
#[derive(Clone, PartialEq, Eq)]
pub struct StatusEndpoint {
    pub base_url: String,
    pub api_key: Option<String>,
}

impl fmt::Debug for StatusEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusEndpoint")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_deref().map(mask_str))
            .finish()
    }
}

#[derive(Clone)]
pub struct GatewayAConfig {
    pub merchant_key: String,
    pub status: Option<StatusEndpoint>,
}

#[derive(Clone)]
pub struct GatewayBConfig {
    pub webhook_secret: String,
    pub status: Option<StatusEndpoint>,
}

#[derive(Debug, Clone)]
pub struct GatewayCConfig {
    pub status: Option<StatusEndpoint>,
}

impl fmt::Debug for GatewayAConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayAConfig")
            .field("merchant_key", &"****")
            .field("status", &self.status)
            .finish()
    }
}

impl fmt::Debug for GatewayBConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayBConfig")
            .field("webhook_secret", &"****")
            .field("status", &self.status)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server_port: u16,
    pub database_url: Option<String>,
    pub reconcile_guard: IdempotencyGuard,
    pub live_heartbeat: Duration,
    pub log_format: LogFormat,
    pub log_request_body: bool,
    pub gateway_a: Option<GatewayAConfig>,
    pub gateway_b: Option<GatewayBConfig>,
    pub gateway_c: Option<GatewayCConfig>,
    pub polling: PollingConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok(); // Load .env file if present
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_vars(&vars)
    }

    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| {
            vars.get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let gateway_a = match get("GATEWAY_A_MERCHANT_KEY") {
            Some(merchant_key) => Some(GatewayAConfig {
                merchant_key,
                status: status_endpoint(vars, "GATEWAY_A")?,
            }),
            None => None,
        };
        let gateway_b = match get("GATEWAY_B_WEBHOOK_SECRET") {
            Some(webhook_secret) => Some(GatewayBConfig {
                webhook_secret,
                status: status_endpoint(vars, "GATEWAY_B")?,
            }),
            None => None,
        };
        let gateway_c_status = status_endpoint(vars, "GATEWAY_C")?;
        let gateway_c_enabled = parse_or(vars, "GATEWAY_C_ENABLED", false)?;
        let gateway_c = (gateway_c_enabled || gateway_c_status.is_some()).then(|| GatewayCConfig {
            status: gateway_c_status,
        });

        let log_format = match get("LOG_FORMAT").as_deref() {
            None | Some("text") | Some("pretty") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => anyhow::bail!("LOG_FORMAT must be 'text' or 'json', got '{}'", other),
        };

        let reconcile_guard = match get("RECONCILE_GUARD") {
            Some(raw) => raw.parse().map_err(anyhow::Error::msg)?,
            None => IdempotencyGuard::default(),
        };

        let defaults = PollingConfig::default();
        let interval_secs: u64 = parse_or(vars, "POLL_INTERVAL_SECS", defaults.interval.as_secs())?;
        if interval_secs == 0 {
            anyhow::bail!("POLL_INTERVAL_SECS must be greater than zero");
        }
        let batch_limit: i64 = parse_or(vars, "POLL_BATCH_LIMIT", defaults.batch_limit)?;
        if batch_limit <= 0 {
            anyhow::bail!("POLL_BATCH_LIMIT must be greater than zero");
        }
        let denial_threshold: u32 = parse_or(vars, "POLL_DENIAL_THRESHOLD", defaults.denial_threshold)?;
        if denial_threshold == 0 {
            anyhow::bail!("POLL_DENIAL_THRESHOLD must be greater than zero");
        }
        let window_hours: i64 = parse_or(vars, "POLL_WINDOW_HOURS", defaults.window.num_hours())?;
        if window_hours <= 0 {
            anyhow::bail!("POLL_WINDOW_HOURS must be greater than zero");
        }
        let window = chrono::Duration::try_hours(window_hours)
            .with_context(|| format!("POLL_WINDOW_HOURS is out of range: {}", window_hours))?;
        let polling = PollingConfig {
            interval: Duration::from_secs(interval_secs),
            window,
            batch_limit,
            call_delay: Duration::from_millis(parse_or(
                vars,
                "POLL_CALL_DELAY_MS",
                defaults.call_delay.as_millis() as u64,
            )?),
            denial_threshold,
        };

        let heartbeat_secs: u64 = parse_or(vars, "LIVE_HEARTBEAT_SECS", 30)?;
        if heartbeat_secs == 0 {
            anyhow::bail!("LIVE_HEARTBEAT_SECS must be greater than zero");
        }

        Ok(Config {
            server_port: parse_or(vars, "SERVER_PORT", 3000)?,
            database_url: get("DATABASE_URL"),
            reconcile_guard,
            live_heartbeat: Duration::from_secs(heartbeat_secs),
            log_format,
            log_request_body: parse_or(vars, "LOG_REQUEST_BODY", false)?,
            gateway_a,
            gateway_b,
            gateway_c,
            polling,
        })
    }

    /// Codecs for every configured provider.
    pub fn codecs(&self) -> HashMap<Provider, ProviderCodec> {
        self.providers()
            .into_iter()
            .map(|(codec, _)| (codec.provider(), codec))
            .collect()
    }

    /// Providers that have a status API to poll, with their codec.
    pub fn status_endpoints(&self) -> Vec<(ProviderCodec, StatusEndpoint)> {
        self.providers()
            .into_iter()
            .filter_map(|(codec, status)| status.map(|endpoint| (codec, endpoint)))
            .collect()
    }

    fn providers(&self) -> Vec<(ProviderCodec, Option<StatusEndpoint>)> {
        let mut providers = Vec::new();
        if let Some(a) = &self.gateway_a {
            providers.push((
                ProviderCodec::GatewayA(EncryptedCodec::new(a.merchant_key.clone())),
                a.status.clone(),
            ));
        }
        if let Some(b) = &self.gateway_b {
            providers.push((
                ProviderCodec::GatewayB(SignedCodec::new(b.webhook_secret.clone())),
                b.status.clone(),
            ));
        }
        if let Some(c) = &self.gateway_c {
            providers.push((ProviderCodec::GatewayC(PlainCodec), c.status.clone()));
        }
        providers
    }
}

fn status_endpoint(vars: &HashMap<String, String>, prefix: &str) -> Result<Option<StatusEndpoint>> {
    let url_key = format!("{}_STATUS_URL", prefix);
    let Some(raw) = vars.get(&url_key).map(|v| v.trim()).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };

    let url = Url::parse(raw).with_context(|| format!("{} is not a valid URL", url_key))?;
    if !matches!(url.scheme(), "http" | "https") {
        anyhow::bail!("{} must use http or https, got '{}'", url_key, url.scheme());
    }

    Ok(Some(StatusEndpoint {
        base_url: raw.trim_end_matches('/').to_string(),
        api_key: vars
            .get(&format!("{}_API_KEY", prefix))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty()),
    }))
}

fn parse_or<T>(vars: &HashMap<String, String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("{} has an invalid value '{}'", key, raw)),
        None => Ok(default),
    }
}
