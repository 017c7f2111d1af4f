use super::models::{Config, StorageProvider};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("queue.max_concurrent must be at least 1")]
    InvalidMaxConcurrent,

    #[error("queue.max_retry_attempts must be at least 1")]
    InvalidMaxRetryAttempts,

    #[error("dedup.{field} ({value}) must be within [0.0, 1.0]")]
    ThresholdOutOfRange { field: &'static str, value: f64 },

    #[error("dedup.prompt_threshold ({prompt}) must not be below dedup.similarity_threshold ({similarity})")]
    PromptBelowSimilarity { prompt: f64, similarity: f64 },

    #[error("dedup.size_window_pct ({0}) must not exceed 100")]
    SizeWindowTooWide(u8),

    #[error("progress.{field} ({value}) must be greater than 1.0")]
    InvalidBackoffMultiplier { field: &'static str, value: f64 },

    #[error("progress.max_connect_attempts must be at least 1")]
    InvalidConnectAttempts,

    #[error("Storage provider is S3 but missing credentials (access_key or secret_key)")]
    MissingS3Credentials,

    #[error("Storage provider is S3 but no bucket is configured")]
    MissingS3Bucket,

    #[error("Retention TTL must be positive: {field} = {value}")]
    InvalidRetentionTTL { field: String, value: u32 },
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_queue(config)?;
    validate_dedup(config)?;
    validate_progress(config)?;
    validate_storage(config)?;
    validate_retention(config)?;
    Ok(())
}

fn validate_queue(config: &Config) -> Result<(), ValidationError> {
    if config.queue.max_concurrent == 0 {
        return Err(ValidationError::InvalidMaxConcurrent);
    }
    if config.queue.max_retry_attempts == 0 {
        return Err(ValidationError::InvalidMaxRetryAttempts);
    }
    Ok(())
}

fn validate_dedup(config: &Config) -> Result<(), ValidationError> {
    let dedup = &config.dedup;
    for (field, value) in [
        ("similarity_threshold", dedup.similarity_threshold),
        ("prompt_threshold", dedup.prompt_threshold),
    ] {
        if !(0.0..=1.0).contains(&value) {
            return Err(ValidationError::ThresholdOutOfRange { field, value });
        }
    }
    if dedup.prompt_threshold < dedup.similarity_threshold {
        return Err(ValidationError::PromptBelowSimilarity {
            prompt: dedup.prompt_threshold,
            similarity: dedup.similarity_threshold,
        });
    }
    if dedup.size_window_pct > 100 {
        return Err(ValidationError::SizeWindowTooWide(dedup.size_window_pct));
    }
    Ok(())
}

fn validate_progress(config: &Config) -> Result<(), ValidationError> {
    let progress = &config.progress;
    for (field, value) in [
        ("push_backoff_multiplier", progress.push_backoff_multiplier),
        (
            "fallback_backoff_multiplier",
            progress.fallback_backoff_multiplier,
        ),
    ] {
        if value <= 1.0 {
            return Err(ValidationError::InvalidBackoffMultiplier { field, value });
        }
    }
    if progress.max_connect_attempts == 0 {
        return Err(ValidationError::InvalidConnectAttempts);
    }
    Ok(())
}

fn validate_storage(config: &Config) -> Result<(), ValidationError> {
    if config.storage.provider == StorageProvider::S3 {
        if config.storage.bucket.is_none() {
            return Err(ValidationError::MissingS3Bucket);
        }
        if config.storage.access_key.is_none() || config.storage.secret_key.is_none() {
            return Err(ValidationError::MissingS3Credentials);
        }
    }
    Ok(())
}

fn validate_retention(config: &Config) -> Result<(), ValidationError> {
    for (field, value) in [
        ("session_ttl_days", config.retention.session_ttl_days),
        ("job_ttl_days", config.retention.job_ttl_days),
    ] {
        if value == 0 {
            return Err(ValidationError::InvalidRetentionTTL {
                field: field.to_string(),
                value,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut config = Config::default();
        config.queue.max_concurrent = 0;
        assert!(matches!(
            validate(&config),
            Err(ValidationError::InvalidMaxConcurrent)
        ));
    }

    #[test]
    fn prompt_threshold_must_cover_similarity() {
        let mut config = Config::default();
        config.dedup.prompt_threshold = 0.5;
        assert!(matches!(
            validate(&config),
            Err(ValidationError::PromptBelowSimilarity { .. })
        ));
    }

    #[test]
    fn multiplier_at_or_below_one_is_rejected() {
        let mut config = Config::default();
        config.progress.fallback_backoff_multiplier = 1.0;
        assert!(matches!(
            validate(&config),
            Err(ValidationError::InvalidBackoffMultiplier { .. })
        ));
    }

    #[test]
    fn s3_requires_bucket_and_credentials() {
        let mut config = Config::default();
        config.storage.provider = StorageProvider::S3;
        assert!(matches!(
            validate(&config),
            Err(ValidationError::MissingS3Bucket)
        ));

        config.storage.bucket = Some("media".to_string());
        assert!(matches!(
            validate(&config),
            Err(ValidationError::MissingS3Credentials)
        ));

        config.storage.access_key = Some("key".to_string());
        config.storage.secret_key = Some("secret".to_string());
        assert!(validate(&config).is_ok());
    }
}
