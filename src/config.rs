//! Process-wide settings (SPEC_FULL §10).
//!
//! Loaded once at process start via layered `config` sources (a bundled
//! `default.toml`, an optional environment-specific file, then
//! `AFFILIATE_FEED__`-prefixed environment variables, with `.env` loaded
//! through `dotenvy` for local development) and carried by value from then
//! on — nothing here is re-read mid-run, per SPEC_FULL §9's "no global
//! mutable state" note. Per-feed overrides still live on the `Feed` record
//! itself.

use serde::Deserialize;

fn default_chunk_size() -> usize {
    1000
}

fn default_heartbeat_hours() -> i64 {
    24
}

fn default_worker_pool_size() -> usize {
    4
}

fn default_job_rate_limit_per_minute() -> u32 {
    10
}

fn default_sftp_ready_timeout_secs() -> u64 {
    30
}

fn default_test_connection_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database_url: String,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_heartbeat_hours")]
    pub heartbeat_hours: i64,

    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    #[serde(default = "default_job_rate_limit_per_minute")]
    pub job_rate_limit_per_minute: u32,

    #[serde(default = "default_sftp_ready_timeout_secs")]
    pub sftp_ready_timeout_secs: u64,

    #[serde(default = "default_test_connection_timeout_secs")]
    pub test_connection_timeout_secs: u64,

    /// Store-wide policy flag gating plain (non-SFTP) FTP (SPEC_FULL §4.3).
    #[serde(default)]
    pub allow_plain_ftp: bool,

    #[serde(default)]
    pub notifications: NotificationSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotificationSettings {
    pub smtp_url: Option<String>,
    pub from_address: Option<String>,
    pub operator_email: Option<String>,
    pub slack_webhook_url: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("settings load error: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid settings: {0}")]
    Invalid(String),
}

impl Settings {
    /// Load layered settings: `config/default.toml` < `config/{env}.toml`
    /// (if `APP_ENV` is set) < `AFFILIATE_FEED__`-prefixed environment
    /// variables. Fails fast at startup rather than misbehaving mid-run.
    pub fn load() -> Result<Self, SettingsError> {
        let _ = dotenvy::dotenv();

        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".into());
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("AFFILIATE_FEED")
                    .separator("__")
                    .try_parsing(true),
            );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if self.chunk_size == 0 {
            return Err(SettingsError::Invalid("chunk_size must be > 0".into()));
        }
        if self.worker_pool_size == 0 || self.worker_pool_size > 64 {
            return Err(SettingsError::Invalid(
                "worker_pool_size must be within [1, 64]".into(),
            ));
        }
        if self.database_url.is_empty() {
            return Err(SettingsError::Invalid("database_url must be set".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Settings {
        Settings {
            database_url: "postgres://localhost/affiliate_feed".into(),
            chunk_size: 1000,
            heartbeat_hours: 24,
            worker_pool_size: 4,
            job_rate_limit_per_minute: 10,
            sftp_ready_timeout_secs: 30,
            test_connection_timeout_secs: 10,
            allow_plain_ftp: false,
            notifications: NotificationSettings::default(),
        }
    }

    #[test]
    fn rejects_zero_chunk_size() {
        let mut s = base();
        s.chunk_size = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn rejects_oversized_worker_pool() {
        let mut s = base();
        s.worker_pool_size = 65;
        assert!(s.validate().is_err());
    }

    #[test]
    fn accepts_reasonable_defaults() {
        assert!(base().validate().is_ok());
    }
}
