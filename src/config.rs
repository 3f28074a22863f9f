use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub host: IpAddr,
    pub port: u16,
    pub log_level: String,
    pub max_body_size: usize,
    pub worker_count: usize,
    pub poll_interval: Duration,
    pub procedure_timeout: Duration,
    pub retry: RetryPolicy,
    /// `(procedure name, downstream URL)` pairs served by the forwarding procedure.
    pub procedure_routes: Vec<(String, String)>,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let database_url = env_required("DATABASE_URL")?;

        let host: IpAddr = env_or("FIELDSYNC_HOST", "0.0.0.0")
            .parse()
            .map_err(|e| format!("Invalid FIELDSYNC_HOST: {e}"))?;

        let port: u16 = env_parse("FIELDSYNC_PORT", "3000")?;
        let log_level = env_or("FIELDSYNC_LOG_LEVEL", "info");
        let max_body_size: usize = env_parse("FIELDSYNC_MAX_BODY_SIZE", "1048576")?;

        let worker_count: usize = env_parse("FIELDSYNC_WORKER_COUNT", "2")?;
        if worker_count == 0 {
            return Err("FIELDSYNC_WORKER_COUNT must be at least 1".to_string());
        }

        let poll_interval = Duration::from_millis(env_parse("FIELDSYNC_POLL_INTERVAL_MS", "1000")?);
        let procedure_timeout =
            Duration::from_secs(env_parse("FIELDSYNC_PROCEDURE_TIMEOUT_SECS", "30")?);

        let retry = RetryPolicy::new(
            env_parse("FIELDSYNC_MAX_RETRIES", "3")?,
            env_parse("FIELDSYNC_RETRY_INITIAL_DELAY_MS", "5000")?,
            env_parse("FIELDSYNC_RETRY_BACKOFF_MULTIPLIER", "2")?,
            env_parse("FIELDSYNC_RETRY_MAX_DELAY_MS", "300000")?,
        );
        validate_retry_policy(&retry)?;

        let procedure_routes = parse_procedure_routes(&env_or("FIELDSYNC_PROCEDURE_ROUTES", ""))?;

        Ok(Config {
            database_url,
            host,
            port,
            log_level,
            max_body_size,
            worker_count,
            poll_interval,
            procedure_timeout,
            retry,
            procedure_routes,
        })
    }
}

/// Settings for the origin-side queue, dispatcher and monitor.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    pub queue_dir: PathBuf,
    pub queue_key: String,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub max_delay: Duration,
    pub call_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:3000".to_string(),
            queue_dir: PathBuf::from(".fieldsync"),
            queue_key: "offline-actions".to_string(),
            max_retries: 3,
            retry_delay: Duration::from_millis(2_000),
            max_delay: Duration::from_millis(300_000),
            call_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, String> {
        let defaults = ClientConfig::default();

        let server_url = env_or("FIELDSYNC_SERVER_URL", &defaults.server_url)
            .trim_end_matches('/')
            .to_string();
        let queue_dir = std::env::var("FIELDSYNC_QUEUE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.queue_dir);
        let queue_key = env_or("FIELDSYNC_QUEUE_KEY", &defaults.queue_key);
        if queue_key.is_empty() || queue_key.contains(['/', '\\']) {
            return Err(format!("Invalid FIELDSYNC_QUEUE_KEY: {queue_key:?}"));
        }

        Ok(ClientConfig {
            server_url,
            queue_dir,
            queue_key,
            max_retries: env_parse("FIELDSYNC_CLIENT_MAX_RETRIES", "3")?,
            retry_delay: Duration::from_millis(env_parse("FIELDSYNC_CLIENT_RETRY_DELAY_MS", "2000")?),
            max_delay: Duration::from_millis(env_parse("FIELDSYNC_CLIENT_MAX_DELAY_MS", "300000")?),
            call_timeout: Duration::from_secs(env_parse("FIELDSYNC_CLIENT_CALL_TIMEOUT_SECS", "30")?),
            poll_interval: Duration::from_secs(env_parse("FIELDSYNC_CLIENT_POLL_INTERVAL_SECS", "5")?),
        })
    }
}

/// `max_retries` is stored in an INTEGER column next to `retry_count`.
fn validate_retry_policy(retry: &RetryPolicy) -> Result<(), String> {
    if i32::try_from(retry.max_retries).is_err() {
        return Err(format!("FIELDSYNC_MAX_RETRIES must be at most {}", i32::MAX));
    }
    if retry.backoff_multiplier.is_nan() || retry.backoff_multiplier < 1.0 {
        return Err("FIELDSYNC_RETRY_BACKOFF_MULTIPLIER must be >= 1".to_string());
    }
    Ok(())
}

/// `name=url,name=url`
fn parse_procedure_routes(raw: &str) -> Result<Vec<(String, String)>, String> {
    raw.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|entry| {
            let (name, url) = entry
                .trim()
                .split_once('=')
                .ok_or_else(|| format!("Invalid FIELDSYNC_PROCEDURE_ROUTES entry '{entry}'"))?;
            let (name, url) = (name.trim(), url.trim());
            if name.is_empty() || !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(format!("Invalid FIELDSYNC_PROCEDURE_ROUTES entry '{entry}'"));
            }
            Ok((name.to_string(), url.to_string()))
        })
        .collect()
}

fn env_required(key: &str) -> Result<String, String> {
    std::env::var(key).map_err(|_| format!("Missing required environment variable: {key}"))
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str, default: &str) -> Result<T, String>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    env_or(key, default)
        .parse()
        .map_err(|e| format!("Invalid {key}: {e}"))
}
