//! Configuration types.
//!
//! Every component receives its configuration at construction; nothing
//! reads ambient globals after startup.

use secrecy::SecretString;

/// Policy for timestamp fields updated by repeated delivery events.
///
/// The provider delivers events at-least-once, so the same `opened` event
/// can arrive more than once. `FirstWins` keeps the earliest observed
/// timestamp; `LastWins` overwrites on every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampPolicy {
    FirstWins,
    LastWins,
}

impl Default for TimestampPolicy {
    fn default() -> Self {
        Self::FirstWins
    }
}

/// Core engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Mailbox poll interval in seconds.
    pub poll_interval_secs: u64,
    /// Follow-up due-sweep interval in seconds.
    pub sweep_interval_secs: u64,
    /// Follow-up cadence as day offsets from the original send.
    pub cadence_days: Vec<i64>,
    /// Base URL for tracking redirect links (no trailing slash).
    pub tracking_base_url: String,
    /// Scheduling-link domain that must never be rewritten.
    pub scheduling_domain: String,
    /// HTTP bind port for tracking + webhook endpoints.
    pub http_port: u16,
    /// Path to the local database file.
    pub db_path: String,
    /// How repeated delivery events treat already-set timestamps.
    pub timestamp_policy: TimestampPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            sweep_interval_secs: 300,
            cadence_days: vec![3, 7, 14],
            tracking_base_url: "http://localhost:8080".to_string(),
            scheduling_domain: "calendly.com".to_string(),
            http_port: 8080,
            db_path: "./data/outreach.db".to_string(),
            timestamp_policy: TimestampPolicy::FirstWins,
        }
    }
}

impl EngineConfig {
    /// Build config from `OUTREACH_*` environment variables, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let cadence_days = std::env::var("OUTREACH_CADENCE_DAYS")
            .ok()
            .map(|s| {
                s.split(',')
                    .filter_map(|p| p.trim().parse().ok())
                    .collect::<Vec<i64>>()
            })
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.cadence_days);

        let timestamp_policy = match std::env::var("OUTREACH_TIMESTAMP_POLICY").as_deref() {
            Ok("last-wins") => TimestampPolicy::LastWins,
            _ => TimestampPolicy::FirstWins,
        };

        Self {
            poll_interval_secs: env_parse("OUTREACH_POLL_INTERVAL_SECS", defaults.poll_interval_secs),
            sweep_interval_secs: env_parse(
                "OUTREACH_SWEEP_INTERVAL_SECS",
                defaults.sweep_interval_secs,
            ),
            cadence_days,
            tracking_base_url: std::env::var("OUTREACH_TRACKING_BASE_URL")
                .unwrap_or(defaults.tracking_base_url),
            scheduling_domain: std::env::var("OUTREACH_SCHEDULING_DOMAIN")
                .unwrap_or(defaults.scheduling_domain),
            http_port: env_parse("OUTREACH_HTTP_PORT", defaults.http_port),
            db_path: std::env::var("OUTREACH_DB_PATH").unwrap_or(defaults.db_path),
            timestamp_policy,
        }
    }
}

/// Mailbox (IMAP + SMTP) configuration.
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

impl MailboxConfig {
    /// Build config from environment variables.
    /// Returns `None` if `EMAIL_IMAP_HOST` is not set (mailbox disabled).
    pub fn from_env() -> Option<Self> {
        let imap_host = std::env::var("EMAIL_IMAP_HOST").ok()?;

        let imap_port: u16 = env_parse("EMAIL_IMAP_PORT", 993);

        let smtp_host =
            std::env::var("EMAIL_SMTP_HOST").unwrap_or_else(|_| imap_host.replace("imap", "smtp"));

        let smtp_port: u16 = env_parse("EMAIL_SMTP_PORT", 587);

        let username = std::env::var("EMAIL_USERNAME").unwrap_or_default();
        let password =
            SecretString::from(std::env::var("EMAIL_PASSWORD").unwrap_or_default());
        let from_address = std::env::var("EMAIL_FROM_ADDRESS").unwrap_or_else(|_| username.clone());

        Some(Self {
            imap_host,
            imap_port,
            smtp_host,
            smtp_port,
            username,
            password,
            from_address,
        })
    }
}

/// Transactional-delivery provider configuration (HTTP API).
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Sending domain registered with the provider.
    pub domain: String,
    pub api_key: SecretString,
    pub from_address: String,
    /// Provider API base, e.g. `https://api.mailgun.net/v3`.
    pub api_base: String,
}

impl DeliveryConfig {
    /// Build config from environment variables.
    /// Returns `None` if `DELIVERY_DOMAIN` is not set (provider disabled).
    /// Returns an error when the domain is set but the API key is missing,
    /// so a half-configured provider fails fast instead of failing on the
    /// first send.
    pub fn from_env() -> Result<Option<Self>, crate::error::ConfigError> {
        let Ok(domain) = std::env::var("DELIVERY_DOMAIN") else {
            return Ok(None);
        };

        let api_key = std::env::var("DELIVERY_API_KEY").map_err(|_| {
            crate::error::ConfigError::MissingRequired {
                key: "DELIVERY_API_KEY".to_string(),
                hint: "set the provider API key or unset DELIVERY_DOMAIN".to_string(),
            }
        })?;

        let from_address = std::env::var("DELIVERY_FROM_ADDRESS").map_err(|_| {
            crate::error::ConfigError::MissingRequired {
                key: "DELIVERY_FROM_ADDRESS".to_string(),
                hint: "set the verified sender address for the provider".to_string(),
            }
        })?;

        let api_base = std::env::var("DELIVERY_API_BASE")
            .unwrap_or_else(|_| "https://api.mailgun.net/v3".to_string());

        Ok(Some(Self {
            domain,
            api_key: SecretString::from(api_key),
            from_address,
            api_base,
        }))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
