use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::token::issuer::DEFAULT_TOKEN_TTL;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Redis,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "postgres" | "pg" => Ok(StoreBackend::Postgres),
            "redis" => Ok(StoreBackend::Redis),
            "memory" => Ok(StoreBackend::Memory),
            other => anyhow::bail!("unknown RBOX_STORE '{}': expected postgres, redis or memory", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportKind {
    /// Log messages instead of sending them.
    Log,
    /// POST messages to an HTTP mail relay.
    Webhook {
        url: String,
        signing_secret: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL the action links point at.
    pub app_url: Url,
    pub token_ttl: Duration,
    pub store: StoreBackend,
    pub database_url: String,
    pub redis_url: String,
    /// Upper bound on any single store round trip.
    pub store_timeout: Duration,
    pub transport: TransportKind,
    pub mail_from: String,
}

impl Config {
    /// Build from an arbitrary key lookup. `load` passes the process
    /// environment; tests pass a map.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let app_url = var("APP_URL").unwrap_or_else(|| "https://example.com".into());
        let app_url = Url::parse(&app_url)
            .map_err(|e| anyhow::anyhow!("APP_URL '{}' is not a valid URL: {}", app_url, e))?;
        if !matches!(app_url.scheme(), "http" | "https") {
            anyhow::bail!("APP_URL must be an http(s) URL, got '{}'", app_url);
        }

        let token_ttl = match var("RBOX_TOKEN_TTL") {
            Some(raw) => parse_ttl(&raw)
                .ok_or_else(|| anyhow::anyhow!("RBOX_TOKEN_TTL '{}' is not a duration like 30m, 12h or 7d", raw))?,
            None => DEFAULT_TOKEN_TTL,
        };

        let store = var("RBOX_STORE")
            .map(|s| s.parse::<StoreBackend>())
            .transpose()?
            .unwrap_or(StoreBackend::Postgres);

        let store_timeout = Duration::from_millis(
            var("RBOX_STORE_TIMEOUT_MS")
                .and_then(|v| v.parse().ok())
                .filter(|ms: &u64| *ms > 0)
                .unwrap_or(5000),
        );

        let transport = match var("RBOX_TRANSPORT").as_deref().unwrap_or("log") {
            "log" => TransportKind::Log,
            "webhook" => {
                let url = var("RBOX_TRANSPORT_URL").ok_or_else(|| {
                    anyhow::anyhow!("RBOX_TRANSPORT=webhook requires RBOX_TRANSPORT_URL")
                })?;
                TransportKind::Webhook {
                    url,
                    signing_secret: var("RBOX_TRANSPORT_SECRET"),
                }
            }
            other => anyhow::bail!("unknown RBOX_TRANSPORT '{}': expected log or webhook", other),
        };

        Ok(Config {
            app_url,
            token_ttl,
            store,
            database_url: var("DATABASE_URL")
                .unwrap_or_else(|| "postgres://localhost/reimbursement".into()),
            redis_url: var("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".into()),
            store_timeout,
            transport,
            mail_from: var("RBOX_MAIL_FROM")
                .unwrap_or_else(|| "noreply@reimbursementbox.com".into()),
        })
    }
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();
    Config::from_lookup(|key| std::env::var(key).ok())
}

/// Parse `90s`, `30m`, `12h` or `7d`. A bare number is seconds.
/// Zero is rejected.
pub fn parse_ttl(s: &str) -> Option<Duration> {
    let s = s.trim();
    let secs = if let Some(val) = s.strip_suffix('s') {
        val.parse::<u64>().ok()
    } else if let Some(val) = s.strip_suffix('m') {
        val.parse::<u64>().ok().map(|v| v * 60)
    } else if let Some(val) = s.strip_suffix('h') {
        val.parse::<u64>().ok().map(|v| v * 3600)
    } else if let Some(val) = s.strip_suffix('d') {
        val.parse::<u64>().ok().map(|v| v * 86400)
    } else {
        s.parse::<u64>().ok()
    }?;
    (secs > 0).then(|| Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> anyhow::Result<Config> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| env.get(k).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.app_url.as_str(), "https://example.com/");
        assert_eq!(cfg.token_ttl, Duration::from_secs(7 * 86400));
        assert_eq!(cfg.store, StoreBackend::Postgres);
        assert_eq!(cfg.store_timeout, Duration::from_millis(5000));
        assert_eq!(cfg.transport, TransportKind::Log);
        assert_eq!(cfg.mail_from, "noreply@reimbursementbox.com");
    }

    #[test]
    fn test_parse_ttl() {
        assert_eq!(parse_ttl("90s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_ttl("30m"), Some(Duration::from_secs(1800)));
        assert_eq!(parse_ttl("12h"), Some(Duration::from_secs(43200)));
        assert_eq!(parse_ttl(" 7d "), Some(Duration::from_secs(604800)));
        assert_eq!(parse_ttl("600"), Some(Duration::from_secs(600)));
        assert_eq!(parse_ttl("0d"), None);
        assert_eq!(parse_ttl("soon"), None);
    }

    #[test]
    fn test_overrides() {
        let cfg = config(&[
            ("APP_URL", "https://rbox.example.com/app"),
            ("RBOX_TOKEN_TTL", "48h"),
            ("RBOX_STORE", "Redis"),
            ("RBOX_TRANSPORT", "webhook"),
            ("RBOX_TRANSPORT_URL", "https://relay.example.com/send"),
            ("RBOX_TRANSPORT_SECRET", "s3cret"),
        ])
        .unwrap();
        assert_eq!(cfg.app_url.path(), "/app");
        assert_eq!(cfg.token_ttl, Duration::from_secs(48 * 3600));
        assert_eq!(cfg.store, StoreBackend::Redis);
        assert_eq!(
            cfg.transport,
            TransportKind::Webhook {
                url: "https://relay.example.com/send".into(),
                signing_secret: Some("s3cret".into()),
            }
        );
    }

    #[test]
    fn test_invalid_values_are_errors() {
        assert!(config(&[("APP_URL", "not a url")]).is_err());
        assert!(config(&[("APP_URL", "ftp://files.example.com")]).is_err());
        assert!(config(&[("RBOX_TOKEN_TTL", "forever")]).is_err());
        assert!(config(&[("RBOX_STORE", "sqlite")]).is_err());
        assert!(config(&[("RBOX_TRANSPORT", "webhook")]).is_err());
    }
}
