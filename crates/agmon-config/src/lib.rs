//! Typed runtime settings loaded from environment variables.
//!
//! Binaries call `dotenvy::from_filename(".env.local")` before
//! [`Settings::from_env`] so local development can override without touching
//! the process environment; production injects env vars directly.

use anyhow::{anyhow, Context, Result};
use chrono_tz::Tz;

/// All environment keys share this prefix.
pub const ENV_PREFIX: &str = "AGMON_";

/// Runtime configuration for the polling engine and its binaries.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Local zone for polling windows and report calendar dates.
    pub app_timezone: Tz,
    /// Scheduler tick period in seconds.
    pub poll_tick_seconds: u64,
    /// Global worker concurrency cap.
    pub max_concurrency: usize,
    /// Master switch for outbound mail.
    pub email_enabled: bool,
    /// Mail transport sender identity.
    pub ses_sender: String,
    /// Mail transport region.
    pub ses_region: String,
    /// Single recipient of operator alert mails.
    pub master_alert_email: String,
    /// Consecutive failures of one report before an alert fires.
    pub alert_failures_threshold: u32,
}

impl Settings {
    /// Load settings from the process environment, applying defaults for
    /// every key that is absent. Fails only on present-but-invalid values.
    pub fn from_env() -> Result<Self> {
        let tz_name = env_or("APP_TIMEZONE", "America/Chicago");
        let app_timezone: Tz = tz_name
            .parse()
            .map_err(|_| anyhow!("invalid {}APP_TIMEZONE: {}", ENV_PREFIX, tz_name))?;

        let poll_tick_seconds = parse_env("POLL_TICK_SECONDS", 60u64)?;
        if poll_tick_seconds == 0 {
            return Err(anyhow!("{}POLL_TICK_SECONDS must be > 0", ENV_PREFIX));
        }
        let max_concurrency = parse_env("MAX_CONCURRENCY", 4usize)?;
        if max_concurrency == 0 {
            return Err(anyhow!("{}MAX_CONCURRENCY must be > 0", ENV_PREFIX));
        }

        Ok(Settings {
            app_timezone,
            poll_tick_seconds,
            max_concurrency,
            email_enabled: parse_env("EMAIL_ENABLED", true)?,
            ses_sender: env_or("SES_SENDER", "noreply@example.com"),
            ses_region: env_or("SES_REGION", "us-east-1"),
            master_alert_email: env_or("MASTER_ALERT_EMAIL", "alerts@example.com"),
            alert_failures_threshold: parse_env("ALERT_FAILURES_THRESHOLD", 3u32)?,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(format!("{ENV_PREFIX}{key}")).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(format!("{ENV_PREFIX}{key}")) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("invalid {ENV_PREFIX}{key}: {raw}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Settings::from_env reads the real process environment, so all env
    // mutation happens inside this single test to avoid cross-test races.
    #[test]
    fn defaults_then_invalid_override() {
        let s = Settings::from_env().unwrap();
        assert_eq!(s.poll_tick_seconds, 60);
        assert_eq!(s.max_concurrency, 4);
        assert_eq!(s.alert_failures_threshold, 3);
        assert!(s.email_enabled);
        assert_eq!(s.app_timezone.name(), "America/Chicago");

        std::env::set_var("AGMON_EMAIL_ENABLED", "definitely");
        let err = Settings::from_env().unwrap_err();
        std::env::remove_var("AGMON_EMAIL_ENABLED");
        assert!(err.to_string().contains("AGMON_EMAIL_ENABLED"));
    }
}
