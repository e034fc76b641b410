//! Runtime configuration.
//!
//! Database credentials come from the four `ORCHA_CORE_*` variables and are
//! validated up front so a misconfigured runner fails with a clear message
//! instead of an opaque connection error. Everything else is optional and read
//! from `ORCHA_*` variables (nested keys split on `__`) over built-in defaults.

use crate::error::ConfigError;
use crate::service::scheduler::SchedulerConfig;
use crate::service::task_runner::TaskRunnerConfig;
use figment::Figment;
use figment::providers::{Env, Serialized};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

pub const ENV_USER: &str = "ORCHA_CORE_USER";
pub const ENV_PASSWORD: &str = "ORCHA_CORE_PASSWORD";
pub const ENV_SERVER: &str = "ORCHA_CORE_SERVER";
pub const ENV_DB: &str = "ORCHA_CORE_DB";

pub const DEFAULT_PG_PORT: u16 = 5432;

/// Connection parameters for the orcha database.
#[derive(Clone, PartialEq, Eq)]
pub struct CoreCredentials {
    pub user: String,
    pub password: String,
    /// `host` or `host:port`
    pub server: String,
    pub db: String,
}

impl fmt::Debug for CoreCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreCredentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("server", &self.server)
            .field("db", &self.db)
            .finish()
    }
}

impl CoreCredentials {
    pub fn new(
        user: impl Into<String>,
        password: impl Into<String>,
        server: impl Into<String>,
        db: impl Into<String>,
    ) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
            server: server.into(),
            db: db.into(),
        }
    }

    /// Read and validate `ORCHA_CORE_USER`, `ORCHA_CORE_PASSWORD`,
    /// `ORCHA_CORE_SERVER` and `ORCHA_CORE_DB`.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Raw strings: figment's value parsing would turn a numeric password into an integer.
        let env = Env::prefixed("ORCHA_CORE_");
        let vars = env
            .iter()
            .map(|(k, v)| (k.as_str().to_ascii_uppercase(), v));
        Self::from_pairs(vars)
    }

    /// Build from `(suffix, value)` pairs where suffix is the part after `ORCHA_CORE_`.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = pairs
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_ascii_uppercase(), v.into()))
            .collect();

        let take = |suffix: &str, name: &'static str| -> Result<String, ConfigError> {
            match vars.get(suffix) {
                Some(v) if !v.trim().is_empty() => Ok(v.clone()),
                _ => Err(ConfigError::MissingCredential(name)),
            }
        };

        let creds = Self {
            user: take("USER", ENV_USER)?,
            password: take("PASSWORD", ENV_PASSWORD)?,
            server: take("SERVER", ENV_SERVER)?,
            db: take("DB", ENV_DB)?,
        };
        creds.host_port()?;
        Ok(creds)
    }

    /// Split `server` into host and port, defaulting the port to 5432.
    pub fn host_port(&self) -> Result<(String, u16), ConfigError> {
        let server = self.server.trim();
        match server.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    ConfigError::Invalid(format!("{ENV_SERVER} has an invalid port: {port}"))
                })?;
                if host.is_empty() {
                    return Err(ConfigError::Invalid(format!("{ENV_SERVER} is missing a host")));
                }
                Ok((host.to_string(), port))
            }
            None => Ok((server.to_string(), DEFAULT_PG_PORT)),
        }
    }

    /// Connection string without the password, safe to log.
    pub fn redacted(&self) -> String {
        format!("postgres://{}:***@{}/{}", self.user, self.server, self.db)
    }
}

/// Non-credential settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub loglevel: String,
    pub application_name: String,
    /// How long to wait for the database to accept connections.
    pub readiness_timeout_secs: u64,
    pub scheduler: SchedulerConfig,
    pub runner: TaskRunnerConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            loglevel: "info".to_string(),
            application_name: "orcha".to_string(),
            readiness_timeout_secs: 60,
            scheduler: SchedulerConfig::default(),
            runner: TaskRunnerConfig::default(),
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_figment(Figment::new().merge(
            Env::prefixed("ORCHA_")
                .filter(|k| !k.as_str().starts_with("core_"))
                .split("__"),
        ))
    }

    /// Layer `overrides` over the defaults.
    pub fn from_figment(overrides: Figment) -> Result<Self, ConfigError> {
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(overrides)
            .extract()?;
        Ok(settings)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }
}
