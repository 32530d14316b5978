use std::str::FromStr;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result, anyhow};
use chrono::Duration;
use dealmint_core::ProgramPolicy;

const MIN_SECRET_BYTES: usize = 32;

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub database_url: String,
    pub redis_url: String,
    pub http_addr: String,
    pub attribution_secret: String,
    pub maturation_interval: StdDuration,
    pub policy: ProgramPolicy,
}

impl ServiceConfig {
    pub fn from_env(default_http_addr: &str) -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok(), default_http_addr)
    }

    /// Worker processes share the gateway's settings but never bind a listener.
    pub fn worker_from_env() -> Result<Self> {
        let mut config = Self::from_lookup(|key| std::env::var(key).ok(), "")?;
        config.http_addr = String::new();
        Ok(config)
    }

    fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
        default_http_addr: &str,
    ) -> Result<Self> {
        let database_url = lookup("DATABASE_URL").context("DATABASE_URL is required")?;
        let redis_url = lookup("REDIS_URL").context("REDIS_URL is required")?;
        let http_addr = lookup("HTTP_ADDR").unwrap_or_else(|| default_http_addr.to_string());

        let attribution_secret =
            lookup("ATTRIBUTION_SECRET").context("ATTRIBUTION_SECRET is required")?;
        if attribution_secret.len() < MIN_SECRET_BYTES {
            anyhow::bail!("ATTRIBUTION_SECRET must be at least {MIN_SECRET_BYTES} bytes");
        }

        let interval_secs: u64 = parsed(&lookup, "MATURATION_INTERVAL_SECS", 300)?;
        if interval_secs == 0 {
            anyhow::bail!("MATURATION_INTERVAL_SECS must be positive");
        }

        Ok(Self {
            database_url,
            redis_url,
            http_addr,
            attribution_secret,
            maturation_interval: StdDuration::from_secs(interval_secs),
            policy: policy_from_lookup(&lookup)?,
        })
    }
}

pub fn program_policy_from_env() -> Result<ProgramPolicy> {
    policy_from_lookup(&|key: &str| std::env::var(key).ok())
}

fn policy_from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<ProgramPolicy> {
    let defaults = ProgramPolicy::default();
    let policy = ProgramPolicy {
        attribution_window: Duration::days(parsed(lookup, "ATTRIBUTION_WINDOW_DAYS", 30)?),
        holding_period: Duration::days(parsed(lookup, "HOLDING_PERIOD_DAYS", 30)?),
        minimum_payout: parsed(lookup, "MINIMUM_PAYOUT", defaults.minimum_payout)?,
        default_commission_rate: parsed(
            lookup,
            "DEFAULT_COMMISSION_RATE",
            defaults.default_commission_rate,
        )?,
        flat_commission: parsed(lookup, "DEFAULT_FLAT_COMMISSION", defaults.flat_commission)?,
    };

    policy
        .validate()
        .map_err(|err| anyhow!("invalid program policy: {err}"))?;
    Ok(policy)
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|err| anyhow!("{key} is not valid: {err}")),
        None => Ok(default),
    }
}
