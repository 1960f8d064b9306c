use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_STATE_DIR: &str = "/srv/container-steward";
pub const DEFAULT_DB_PATH: &str = "data/container-steward.db";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_MAX_CONCURRENT: usize = 4;
pub const DEFAULT_STOP_GRACE_SECS: u64 = 30;
pub const DEFAULT_DIGEST_TTL_SECS: u64 = 600;
pub const DEFAULT_MAX_PULL_RETRIES: u32 = 3;
pub const DEFAULT_PULL_RETRY_DELAY_SECS: u64 = 5;
pub const DEFAULT_HEALTH_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_HEALTH_POLL_SECS: u64 = 2;
pub const DEFAULT_RETENTION_SECS: u64 = 86_400; // 24 hours
pub const DEFAULT_AUTO_UPDATE_COOLDOWN_SECS: u64 = 3_600; // 1 hour
pub const DEFAULT_BACKUP_KEEP: usize = 5;

pub const ENV_STATE_DIR: &str = "STEWARD_STATE_DIR";
pub const ENV_DB_URL: &str = "STEWARD_DB_URL";
pub const ENV_POLL_INTERVAL_SECS: &str = "STEWARD_POLL_INTERVAL_SECS";
pub const ENV_MAX_CONCURRENT: &str = "STEWARD_MAX_CONCURRENT";
pub const ENV_STOP_GRACE_SECS: &str = "STEWARD_STOP_GRACE_SECS";
pub const ENV_DIGEST_TTL_SECS: &str = "STEWARD_DIGEST_TTL_SECS";
pub const ENV_MAX_PULL_RETRIES: &str = "STEWARD_MAX_PULL_RETRIES";
pub const ENV_PULL_RETRY_DELAY_SECS: &str = "STEWARD_PULL_RETRY_DELAY_SECS";
pub const ENV_HEALTH_TIMEOUT_SECS: &str = "STEWARD_HEALTH_TIMEOUT_SECS";
pub const ENV_HEALTH_POLL_SECS: &str = "STEWARD_HEALTH_POLL_SECS";
pub const ENV_RETENTION_SECS: &str = "STEWARD_RETENTION_SECS";
pub const ENV_AUTO_UPDATE_COOLDOWN_SECS: &str = "STEWARD_AUTO_UPDATE_COOLDOWN_SECS";
pub const ENV_BACKUP_KEEP: &str = "STEWARD_BACKUP_KEEP";
pub const ENV_SCHEDULER_MAX_TICKS: &str = "STEWARD_SCHEDULER_MAX_TICKS";
pub const ENV_REGISTRY_AUTH_PATH: &str = "STEWARD_REGISTRY_AUTH_PATH";

#[derive(Debug, Clone)]
pub struct Config {
    pub state_dir: PathBuf,
    pub db_url: String,
    pub poll_interval: Duration,
    pub max_concurrent: usize,
    pub stop_grace: Duration,
    pub digest_ttl_secs: u64,
    pub max_pull_retries: u32,
    pub pull_retry_delay: Duration,
    pub health_timeout: Duration,
    pub health_poll: Duration,
    pub retention_secs: u64,
    pub auto_update_cooldown_secs: u64,
    pub backup_keep: usize,
    /// Stop the poll loop after this many ticks. Test hook only.
    pub max_ticks: Option<u64>,
    pub registry_auth_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            db_url: format!("sqlite://{DEFAULT_DB_PATH}"),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            stop_grace: Duration::from_secs(DEFAULT_STOP_GRACE_SECS),
            digest_ttl_secs: DEFAULT_DIGEST_TTL_SECS,
            max_pull_retries: DEFAULT_MAX_PULL_RETRIES,
            pull_retry_delay: Duration::from_secs(DEFAULT_PULL_RETRY_DELAY_SECS),
            health_timeout: Duration::from_secs(DEFAULT_HEALTH_TIMEOUT_SECS),
            health_poll: Duration::from_secs(DEFAULT_HEALTH_POLL_SECS),
            retention_secs: DEFAULT_RETENTION_SECS,
            auto_update_cooldown_secs: DEFAULT_AUTO_UPDATE_COOLDOWN_SECS,
            backup_keep: DEFAULT_BACKUP_KEEP,
            max_ticks: None,
            registry_auth_path: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Self {
            state_dir: env_string(ENV_STATE_DIR)
                .map(PathBuf::from)
                .unwrap_or(defaults.state_dir),
            db_url: env_string(ENV_DB_URL).unwrap_or(defaults.db_url),
            poll_interval: Duration::from_secs(
                env_u64(ENV_POLL_INTERVAL_SECS).unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
            ),
            max_concurrent: env_u64(ENV_MAX_CONCURRENT)
                .map(|v| v.max(1) as usize)
                .unwrap_or(DEFAULT_MAX_CONCURRENT),
            stop_grace: Duration::from_secs(
                env_u64(ENV_STOP_GRACE_SECS).unwrap_or(DEFAULT_STOP_GRACE_SECS),
            ),
            digest_ttl_secs: env_u64(ENV_DIGEST_TTL_SECS).unwrap_or(DEFAULT_DIGEST_TTL_SECS),
            max_pull_retries: env_u64(ENV_MAX_PULL_RETRIES)
                .map(|v| v as u32)
                .unwrap_or(DEFAULT_MAX_PULL_RETRIES),
            pull_retry_delay: Duration::from_secs(
                env_u64(ENV_PULL_RETRY_DELAY_SECS).unwrap_or(DEFAULT_PULL_RETRY_DELAY_SECS),
            ),
            health_timeout: Duration::from_secs(
                env_u64(ENV_HEALTH_TIMEOUT_SECS).unwrap_or(DEFAULT_HEALTH_TIMEOUT_SECS),
            ),
            health_poll: Duration::from_secs(
                env_u64(ENV_HEALTH_POLL_SECS).unwrap_or(DEFAULT_HEALTH_POLL_SECS),
            ),
            retention_secs: env_u64(ENV_RETENTION_SECS).unwrap_or(DEFAULT_RETENTION_SECS),
            auto_update_cooldown_secs: env_u64(ENV_AUTO_UPDATE_COOLDOWN_SECS)
                .unwrap_or(DEFAULT_AUTO_UPDATE_COOLDOWN_SECS),
            backup_keep: env_u64(ENV_BACKUP_KEEP)
                .map(|v| v as usize)
                .unwrap_or(DEFAULT_BACKUP_KEEP),
            max_ticks: env_u64(ENV_SCHEDULER_MAX_TICKS),
            registry_auth_path: env_string(ENV_REGISTRY_AUTH_PATH).map(PathBuf::from),
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u64(name: &str) -> Option<u64> {
    env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.poll_interval, Duration::from_secs(30));
        assert_eq!(cfg.max_concurrent, 4);
        assert_eq!(cfg.max_pull_retries, 3);
        assert!(cfg.max_ticks.is_none());
    }
}
