use crate::humanize::ByteSize;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::progress::TransportPolicy;

/// Top-level configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    #[serde(default = "default_fjall_path")]
    pub fjall_path: PathBuf,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: ByteSize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            fjall_path: default_fjall_path(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    "0.0.0.0:8080".parse().unwrap()
}

fn default_fjall_path() -> PathBuf {
    PathBuf::from("data/store")
}

fn default_max_upload_bytes() -> ByteSize {
    ByteSize(512 * 1024 * 1024) // 512 MB
}

/// Conversion queue configuration
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_retry_attempts: default_max_retry_attempts(),
        }
    }
}

fn default_max_concurrent() -> usize {
    2
}

fn default_max_retry_attempts() -> u32 {
    3
}

/// Progress delivery configuration: broadcaster grace periods and the
/// push/fallback transport backoff curves.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProgressConfig {
    #[serde(default = "default_push_base_delay_ms")]
    pub push_base_delay_ms: u64,
    #[serde(default = "default_push_backoff_multiplier")]
    pub push_backoff_multiplier: f64,
    #[serde(default = "default_fallback_base_delay_ms")]
    pub fallback_base_delay_ms: u64,
    #[serde(default = "default_fallback_backoff_multiplier")]
    pub fallback_backoff_multiplier: f64,
    #[serde(default = "default_max_connect_attempts")]
    pub max_connect_attempts: u32,
    #[serde(default = "default_allow_fallback")]
    pub allow_fallback: bool,
    #[serde(default = "default_switch_delay_ms")]
    pub switch_delay_ms: u64,
    #[serde(default = "default_success_grace_ms")]
    pub success_grace_ms: u64,
    #[serde(default = "default_failure_grace_ms")]
    pub failure_grace_ms: u64,
    /// Downstream endpoint progress events are pushed to. No relay
    /// runs when unset.
    pub relay_url: Option<String>,
    /// Secondary endpoint used after the push endpoint exhausts its
    /// connect attempts.
    pub relay_fallback_url: Option<String>,
}

impl ProgressConfig {
    pub fn transport_policy(&self) -> TransportPolicy {
        TransportPolicy {
            push_base_delay: Duration::from_millis(self.push_base_delay_ms),
            push_backoff_multiplier: self.push_backoff_multiplier,
            fallback_base_delay: Duration::from_millis(self.fallback_base_delay_ms),
            fallback_backoff_multiplier: self.fallback_backoff_multiplier,
            max_connect_attempts: self.max_connect_attempts,
            allow_fallback: self.allow_fallback,
            switch_delay: Duration::from_millis(self.switch_delay_ms),
        }
    }

    pub fn success_grace(&self) -> Duration {
        Duration::from_millis(self.success_grace_ms)
    }

    pub fn failure_grace(&self) -> Duration {
        Duration::from_millis(self.failure_grace_ms)
    }
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            push_base_delay_ms: default_push_base_delay_ms(),
            push_backoff_multiplier: default_push_backoff_multiplier(),
            fallback_base_delay_ms: default_fallback_base_delay_ms(),
            fallback_backoff_multiplier: default_fallback_backoff_multiplier(),
            max_connect_attempts: default_max_connect_attempts(),
            allow_fallback: default_allow_fallback(),
            switch_delay_ms: default_switch_delay_ms(),
            success_grace_ms: default_success_grace_ms(),
            failure_grace_ms: default_failure_grace_ms(),
            relay_url: None,
            relay_fallback_url: None,
        }
    }
}

fn default_push_base_delay_ms() -> u64 {
    1000
}

fn default_push_backoff_multiplier() -> f64 {
    2.0
}

fn default_fallback_base_delay_ms() -> u64 {
    1000
}

fn default_fallback_backoff_multiplier() -> f64 {
    1.5
}

fn default_max_connect_attempts() -> u32 {
    5
}

fn default_allow_fallback() -> bool {
    true
}

fn default_switch_delay_ms() -> u64 {
    250
}

fn default_success_grace_ms() -> u64 {
    5_000
}

fn default_failure_grace_ms() -> u64 {
    10_000
}

/// Duplicate detection configuration
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct DedupConfig {
    #[serde(default = "default_dedup_enabled")]
    pub enabled: bool,
    #[serde(default = "default_fuzzy_matching")]
    pub fuzzy_matching: bool,
    /// Minimum blended score for a file to count as "similar"
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    /// Score above which the caller should be asked to decide
    #[serde(default = "default_prompt_threshold")]
    pub prompt_threshold: f64,
    /// Size window for fuzzy candidate lookup, as percent of file size
    #[serde(default = "default_size_window_pct")]
    pub size_window_pct: u8,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: default_dedup_enabled(),
            fuzzy_matching: default_fuzzy_matching(),
            similarity_threshold: default_similarity_threshold(),
            prompt_threshold: default_prompt_threshold(),
            size_window_pct: default_size_window_pct(),
        }
    }
}

fn default_dedup_enabled() -> bool {
    true
}

fn default_fuzzy_matching() -> bool {
    true
}

fn default_similarity_threshold() -> f64 {
    0.7
}

fn default_prompt_threshold() -> f64 {
    0.9
}

fn default_size_window_pct() -> u8 {
    10
}

/// Storage provider type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageProvider {
    #[default]
    Local,
    Memory,
    S3,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub provider: StorageProvider,
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
    pub bucket: Option<String>,
    pub endpoint: Option<String>,
    /// S3 access key (loaded from environment, not from config file)
    #[serde(skip)]
    pub access_key: Option<String>,
    /// S3 secret key (loaded from environment, not from config file)
    #[serde(skip)]
    pub secret_key: Option<String>,
    pub region: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            provider: StorageProvider::Local,
            path: default_storage_path(),
            bucket: None,
            endpoint: None,
            access_key: None,
            secret_key: None,
            region: None,
        }
    }
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("data/blobs")
}

/// Retention configuration
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct RetentionConfig {
    #[serde(default = "default_session_ttl_days")]
    pub session_ttl_days: u32,
    #[serde(default = "default_job_ttl_days")]
    pub job_ttl_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            session_ttl_days: default_session_ttl_days(),
            job_ttl_days: default_job_ttl_days(),
        }
    }
}

fn default_session_ttl_days() -> u32 {
    30
}

fn default_job_ttl_days() -> u32 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.server.bind_addr.to_string(), "0.0.0.0:8080");
        assert_eq!(config.queue.max_concurrent, 2);
        assert_eq!(config.queue.max_retry_attempts, 3);
        assert_eq!(config.progress.push_backoff_multiplier, 2.0);
        assert_eq!(config.progress.fallback_backoff_multiplier, 1.5);
        assert!(config.progress.relay_url.is_none());
        assert_eq!(config.dedup.similarity_threshold, 0.7);
        assert_eq!(config.retention.session_ttl_days, 30);
    }

    #[test]
    fn test_transport_policy_from_config() {
        let policy = ProgressConfig::default().transport_policy();
        assert_eq!(policy.push_base_delay, Duration::from_secs(1));
        assert_eq!(policy.fallback_backoff_multiplier, 1.5);
        assert!(policy.allow_fallback);
    }
}
