use std::path::{Path, PathBuf};

use crate::config::schema::Config;
use crate::error::ConfigError;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_json::from_str(content)?;

    validate_config(&config)?;

    Ok(config)
}

/// Loads the file when one is given (defaults otherwise), applies the
/// process environment on top and validates the result.
pub fn load_effective_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };
    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    validate_config(&config)?;
    Ok(config)
}

/// Applies `REDIS_URL`, `SQLITE_PATH`, `JOBS_DIR`, `BULKRUN_QUEUE`,
/// `BULKRUN_WORKERS` and `BULKRUN_BATCH_SIZE`. Empty values are ignored.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

    if let Some(url) = get("REDIS_URL") {
        config.queue.redis_url = url;
    }
    if let Some(path) = get("SQLITE_PATH") {
        config.database_path = PathBuf::from(path);
    }
    if let Some(dir) = get("JOBS_DIR") {
        config.jobs_dir = PathBuf::from(dir);
    }
    if let Some(name) = get("BULKRUN_QUEUE") {
        config.queue.name = name;
    }
    if let Some(raw) = get("BULKRUN_WORKERS") {
        config.worker_count = parse_env("BULKRUN_WORKERS", &raw)?;
    }
    if let Some(raw) = get("BULKRUN_BATCH_SIZE") {
        config.batching.batch_size = parse_env("BULKRUN_BATCH_SIZE", &raw)?;
    }
    Ok(())
}

fn parse_env(name: &'static str, raw: &str) -> Result<usize, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        name,
        value: raw.to_string(),
    })
}

pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    // Validate version
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    let checks: [(bool, &str); 8] = [
        (config.batching.batch_size > 0, "batching.batch_size must be > 0"),
        (config.worker_count > 0, "worker_count must be > 0"),
        (config.pool.max_size > 0, "pool.max_size must be > 0"),
        (config.retry.max_attempts > 0, "retry.max_attempts must be >= 1"),
        (
            config
                .executor
                .command
                .first()
                .is_some_and(|program| !program.trim().is_empty()),
            "executor.command must name a program",
        ),
        (!config.queue.name.trim().is_empty(), "queue.name must not be empty"),
        (
            config.queue.dequeue_timeout_secs > 0,
            "queue.dequeue_timeout_secs must be > 0",
        ),
        (
            config.queue.claim_lease_secs > config.executor.timeout_secs,
            "queue.claim_lease_secs must be longer than executor.timeout_secs",
        ),
    ];
    if let Some((_, message)) = checks.iter().find(|(ok, _)| !ok) {
        return Err(ConfigError::Validation {
            message: message.to_string(),
        });
    }

    Ok(())
}
