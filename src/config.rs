//! Environment-driven runtime configuration for the ingestion, mirror and
//! reconciliation subsystems. Every setting has a default so a bare process
//! starts with ingestion and mirroring disabled.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_duration_millis(key: &str, default_millis: u64) -> Duration {
    Duration::from_millis(env_u64(key, default_millis))
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// Settings for the inbound pipeline and its cloud collaborators.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub enabled: bool,
    pub inbox_bucket: String,
    pub object_key_prefix: String,
    pub queue_url: String,
    pub region: Option<String>,
    pub profile: Option<String>,
    /// Domain used when a Message-ID has to be synthesized.
    pub mail_domain: String,
    pub max_attachment_bytes: u64,
    pub attachment_ttl: Duration,
    pub short_code_length: usize,
    pub recipient_concurrency: usize,
    pub poll_batch_size: i32,
    pub poll_wait: Duration,
    pub decode_retry_limit: u32,
    pub page_size: u32,
}

impl IngestConfig {
    pub fn from_env() -> Self {
        Self {
            enabled: env_bool("MAIL_INGEST_ENABLED", false),
            inbox_bucket: env_string("MAIL_INBOX_BUCKET", "mail-inbox"),
            object_key_prefix: env_string("MAIL_OBJECT_KEY_PREFIX", "email/"),
            queue_url: env_string("MAIL_QUEUE_URL", ""),
            region: env_opt_string("AWS_REGION"),
            profile: env_opt_string("AWS_PROFILE"),
            mail_domain: env_string("MAIL_DOMAIN", "localhost"),
            max_attachment_bytes: env_u64("MAIL_MAX_ATTACHMENT_BYTES", 33 * 1024 * 1024),
            attachment_ttl: Duration::from_secs(env_u64("MAIL_ATTACHMENT_TTL_HOURS", 144) * 3600),
            short_code_length: env_usize("MAIL_SHORT_CODE_LENGTH", 17),
            recipient_concurrency: env_usize("MAIL_RECIPIENT_CONCURRENCY", 4).max(1),
            poll_batch_size: env_usize("MAIL_POLL_BATCH_SIZE", 10).clamp(1, 10) as i32,
            poll_wait: Duration::from_secs(env_u64("MAIL_POLL_WAIT_SECS", 10)),
            decode_retry_limit: env_usize("MAIL_DECODE_RETRY_LIMIT", 5) as u32,
            page_size: env_usize("MAIL_PAGE_SIZE", 20).max(1) as u32,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Settings for the IMAP mirror.
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    /// Appended to the account address to form the master-user login.
    pub login_suffix: String,
    pub password: String,
    pub queue_capacity: usize,
}

impl MirrorConfig {
    pub fn from_env() -> Self {
        Self {
            enabled: env_bool("MIRROR_ENABLED", false),
            host: env_string("MIRROR_IMAP_HOST", "localhost"),
            port: env_u64("MIRROR_IMAP_PORT", 993) as u16,
            login_suffix: env_string("MIRROR_LOGIN_SUFFIX", ""),
            password: env_string("MIRROR_PASSWORD", ""),
            queue_capacity: env_usize("MIRROR_QUEUE_CAPACITY", 256).max(1),
        }
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Settings for the log-tail reconciler.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub enabled: bool,
    pub log_path: PathBuf,
    pub checkpoint_path: PathBuf,
    pub poll_interval: Duration,
    /// Root of the per-domain Maildir tree. Renames are tracked when set.
    pub maildir_root: Option<PathBuf>,
}

impl ReconcileConfig {
    pub fn from_env() -> Self {
        Self {
            enabled: env_bool("RECONCILE_ENABLED", false),
            log_path: PathBuf::from(env_string("RECONCILE_LOG_PATH", "/var/log/dovecot/info.log")),
            checkpoint_path: PathBuf::from(env_string(
                "RECONCILE_CHECKPOINT_PATH",
                "./reconciler_checkpoint.json",
            )),
            poll_interval: env_duration_millis("RECONCILE_POLL_INTERVAL_MS", 500),
            maildir_root: env_opt_string("RECONCILE_MAILDIR_ROOT").map(PathBuf::from),
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
