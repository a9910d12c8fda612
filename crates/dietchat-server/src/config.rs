use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};

/// VAPID credentials for browser push. All three must be set to enable it.
pub struct VapidConfig {
    pub private_key_pem: String,
    pub public_key: String,
    pub subject: String,
}

pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub app_url: String,
    pub expo_access_token: Option<String>,
    pub vapid: Option<VapidConfig>,
    pub cleanup_interval_secs: u64,
}

impl Config {
    /// Read `DIETCHAT_*` variables (after `.env` has been loaded).
    pub fn from_env() -> Result<Self> {
        let port = var_or("DIETCHAT_PORT", "3000")
            .parse()
            .context("DIETCHAT_PORT must be a port number")?;
        let cleanup_interval_secs =
            parse_cleanup_interval(&var_or("DIETCHAT_CLEANUP_INTERVAL_SECS", "600"))?;

        let vapid = match (
            optional("DIETCHAT_VAPID_PRIVATE_KEY_PEM"),
            optional("DIETCHAT_VAPID_PUBLIC_KEY"),
            optional("DIETCHAT_VAPID_SUBJECT"),
        ) {
            (Some(pem), Some(public_key), Some(subject)) => Some(VapidConfig {
                // Single-line env values carry the PEM with escaped newlines.
                private_key_pem: pem.replace("\\n", "\n"),
                public_key,
                subject,
            }),
            _ => None,
        };

        Ok(Self {
            host: var_or("DIETCHAT_HOST", "0.0.0.0"),
            port,
            db_path: PathBuf::from(var_or("DIETCHAT_DB_PATH", "dietchat.db")),
            jwt_secret: var_or("DIETCHAT_JWT_SECRET", "dev-secret-change-me"),
            app_url: var_or("DIETCHAT_APP_URL", "http://localhost:3000"),
            expo_access_token: optional("DIETCHAT_EXPO_ACCESS_TOKEN"),
            vapid,
            cleanup_interval_secs,
        })
    }
}

fn parse_cleanup_interval(raw: &str) -> Result<u64> {
    let secs: u64 = raw
        .trim()
        .parse()
        .context("DIETCHAT_CLEANUP_INTERVAL_SECS must be a number of seconds")?;
    if secs == 0 {
        bail!("DIETCHAT_CLEANUP_INTERVAL_SECS must be greater than zero");
    }
    Ok(secs)
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_interval_must_be_positive() {
        assert_eq!(parse_cleanup_interval("600").unwrap(), 600);
        assert_eq!(parse_cleanup_interval(" 30 ").unwrap(), 30);

        let err = parse_cleanup_interval("0").unwrap_err();
        assert!(err.to_string().contains("greater than zero"));
        assert!(parse_cleanup_interval("ten").is_err());
        assert!(parse_cleanup_interval("-5").is_err());
    }
}
