//! Settings read from the environment (after `.env` has been loaded by `main`).

use std::{path::PathBuf, time::Duration};

pub const REQUIRED_VARS: [&str; 5] = ["DB_HOST", "DB_NAME", "DB_USER", "DB_PASS", "SPREADSHEET_ID"];
pub const OPTIONAL_VARS: [&str; 11] = [
    "DB_PORT",
    "SHEETS_TOKEN_COMMAND",
    "SHEETS_WRITES_PER_MINUTE",
    "IUGU_SSH_HOST",
    "IUGU_ACCOUNTS_FILE",
    "IUGU_BATCH_SIZE",
    "IUGU_MAX_RETRIES",
    "IUGU_REQUESTS_PER_MINUTE",
    "IUGU_BATCH_PAUSE_SECS",
    "IUGU_RETRY_BACKOFF_SECS",
    "RUST_LOG",
];

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("Required environment variables not set: {0:?}")]
    Missing(Vec<&'static str>),
    #[error("Environment variable {name} has an invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct SheetsConfig {
    pub spreadsheet_id: String,
    /// Shell command printing an OAuth access token on stdout
    pub token_command: String,
    pub writes_per_minute: usize,
}

#[derive(Debug, Clone)]
pub struct IuguConfig {
    /// Host the curl calls are tunnelled through. `None` runs curl locally.
    pub ssh_host: Option<String>,
    pub accounts_file: PathBuf,
    pub batch_size: usize,
    pub max_retries: u32,
    pub requests_per_minute: usize,
    pub batch_pause: Duration,
    pub retry_backoff: Duration,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub db: DbConfig,
    pub sheets: SheetsConfig,
    pub iugu: IuguConfig,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok().filter(|v| !v.is_empty()))
    }

    /// Builds the settings from any variable source. All missing required variables are
    /// reported together.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let missing: Vec<&'static str> = REQUIRED_VARS
            .into_iter()
            .filter(|name| lookup(name).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }
        let required = |name: &'static str| lookup(name).unwrap_or_default();

        Ok(Settings {
            db: DbConfig {
                host: required("DB_HOST"),
                port: parse_or(&lookup, "DB_PORT", 5432)?,
                name: required("DB_NAME"),
                user: required("DB_USER"),
                password: required("DB_PASS"),
            },
            sheets: SheetsConfig {
                spreadsheet_id: required("SPREADSHEET_ID"),
                token_command: lookup("SHEETS_TOKEN_COMMAND")
                    .unwrap_or_else(|| "gcloud auth print-access-token".to_owned()),
                writes_per_minute: parse_or(&lookup, "SHEETS_WRITES_PER_MINUTE", 60)?,
            },
            iugu: IuguConfig {
                ssh_host: lookup("IUGU_SSH_HOST"),
                accounts_file: lookup("IUGU_ACCOUNTS_FILE")
                    .unwrap_or_else(|| "iugu_accounts.json".to_owned())
                    .into(),
                batch_size: parse_or(&lookup, "IUGU_BATCH_SIZE", 5)?,
                max_retries: parse_or(&lookup, "IUGU_MAX_RETRIES", 3)?,
                requests_per_minute: parse_or(&lookup, "IUGU_REQUESTS_PER_MINUTE", 30)?,
                batch_pause: Duration::from_secs(parse_or(&lookup, "IUGU_BATCH_PAUSE_SECS", 2)?),
                retry_backoff: Duration::from_secs(parse_or(
                    &lookup,
                    "IUGU_RETRY_BACKOFF_SECS",
                    5,
                )?),
            },
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}

/// Logs which variables are set. Secrets are reported as set without their value.
pub fn check_environment(lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
    log::info!("Checking environment variables...");
    let mut missing = Vec::new();
    for name in REQUIRED_VARS {
        if lookup(name).is_some() {
            log::info!("{name}: set");
        } else {
            log::error!("{name}: missing");
            missing.push(name);
        }
    }
    for name in OPTIONAL_VARS {
        match lookup(name) {
            Some(value) => log::info!("{name}: {value}"),
            None => log::warn!("{name}: not set (using default)"),
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Missing(missing))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    const BASE: [(&str, &str); 5] = [
        ("DB_HOST", "db"),
        ("DB_NAME", "nox"),
        ("DB_USER", "u"),
        ("DB_PASS", "p"),
        ("SPREADSHEET_ID", "sheet"),
    ];

    #[test]
    fn defaults_are_applied() {
        let settings = Settings::from_lookup(lookup(&BASE)).unwrap();
        assert_eq!(settings.db.port, 5432);
        assert_eq!(settings.sheets.writes_per_minute, 60);
        assert_eq!(settings.iugu.batch_size, 5);
        assert_eq!(settings.iugu.max_retries, 3);
        assert_eq!(settings.iugu.ssh_host, None);
        assert_eq!(settings.iugu.retry_backoff, Duration::from_secs(5));
    }

    #[test]
    fn all_missing_required_are_reported() {
        let err = Settings::from_lookup(lookup(&[("DB_HOST", "db")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Missing(vec!["DB_NAME", "DB_USER", "DB_PASS", "SPREADSHEET_ID"])
        );
        assert!(check_environment(lookup(&[])).is_err());
        assert!(check_environment(lookup(&BASE)).is_ok());
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let mut vars = BASE.to_vec();
        vars.push(("DB_PORT", "abc"));
        let err = Settings::from_lookup(lookup(&vars)).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid { name: "DB_PORT", value: "abc".into() }
        );
    }
}
