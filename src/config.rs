use anyhow::{bail, Context, Result};
use std::{env, time::Duration};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    /// Upper bound on every store call.
    pub store_timeout: Duration,
    pub db_max_connections: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = get("DATABASE_URL").context("DATABASE_URL not set")?;
        let port = parse_or(&get, "PORT", 8080u16)?;
        let timeout_secs = parse_or(&get, "STORE_TIMEOUT_SECS", 5u64)?;
        if timeout_secs == 0 {
            bail!("STORE_TIMEOUT_SECS must be at least 1");
        }
        let db_max_connections = parse_or(&get, "DB_MAX_CONNECTIONS", 10u32)?;

        Ok(Config {
            database_url,
            port,
            store_timeout: Duration::from_secs(timeout_secs),
            db_max_connections,
        })
    }
}

fn parse_or<F, T>(get: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw}")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply() {
        let cfg = Config::from_lookup(lookup(&[("DATABASE_URL", "postgres://x")])).unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.store_timeout, Duration::from_secs(5));
        assert_eq!(cfg.db_max_connections, 10);
    }

    #[test]
    fn missing_database_url_is_an_error() {
        assert!(Config::from_lookup(lookup(&[])).is_err());
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let err = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://x"),
            ("STORE_TIMEOUT_SECS", "0"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("STORE_TIMEOUT_SECS"));
    }

    #[test]
    fn bad_port_is_reported() {
        let err = Config::from_lookup(lookup(&[("DATABASE_URL", "postgres://x"), ("PORT", "http")]))
            .unwrap_err();
        assert!(err.to_string().contains("PORT"));
    }
}
