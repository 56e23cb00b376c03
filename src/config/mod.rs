use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the dispatch queue
    pub redis_url: String,

    /// YOLO inference service endpoint URL
    pub inference_url: String,

    /// Bearer token for the inference service
    pub inference_api_token: String,

    /// S3-compatible endpoint URL
    pub s3_endpoint: String,

    /// S3 region name
    #[serde(default = "default_s3_region")]
    pub s3_region: String,

    /// S3 access key ID
    pub s3_access_key: String,

    /// S3 secret access key
    pub s3_secret_key: String,

    /// Bucket used for manual uploads
    pub default_store: String,

    /// Minimum confidence for a detection to count
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    /// Smallest acceptable image size in bytes; anything below is
    /// rejected at processing time.
    #[serde(default = "default_min_image_bytes")]
    pub min_image_bytes: usize,

    /// Upper bound on concurrently running item tasks per batch
    #[serde(default = "default_max_concurrent_items")]
    pub max_concurrent_items: usize,

    /// Hard wall-clock budget per item task, in seconds
    #[serde(default = "default_item_timeout_secs")]
    pub item_timeout_secs: u64,

    /// Download attempts per object before giving up
    #[serde(default = "default_download_retries")]
    pub download_retries: u32,

    /// Listing attempts per dispatch before marking the job failed
    #[serde(default = "default_listing_retries")]
    pub listing_retries: u32,

    /// Expiry for presigned read URLs, in seconds
    #[serde(default = "default_url_expiry_secs")]
    pub url_expiry_secs: u32,

    /// Manual (ownerless) records to keep, newest first
    #[serde(default = "default_manual_records_to_keep")]
    pub manual_records_to_keep: i64,

    /// Manual record age limit in days; 0 or negative disables the policy
    #[serde(default)]
    pub days_to_keep_manual_records: i64,

    /// Batch job age limit in days; 0 or negative disables the policy
    #[serde(default = "default_days_to_keep_batches")]
    pub days_to_keep_batches: i64,

    /// Batch jobs to keep, newest first
    #[serde(default = "default_batch_jobs_to_keep")]
    pub batch_jobs_to_keep: i64,

    /// Interval between scheduled retention passes, in seconds
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_s3_region() -> String {
    "us-east-1".to_string()
}

fn default_confidence_threshold() -> f64 {
    0.5
}

fn default_min_image_bytes() -> usize {
    1024
}

fn default_max_concurrent_items() -> usize {
    8
}

fn default_item_timeout_secs() -> u64 {
    300
}

fn default_download_retries() -> u32 {
    3
}

fn default_listing_retries() -> u32 {
    2
}

fn default_url_expiry_secs() -> u32 {
    3600
}

fn default_manual_records_to_keep() -> i64 {
    10
}

fn default_days_to_keep_batches() -> i64 {
    30
}

fn default_batch_jobs_to_keep() -> i64 {
    20
}

fn default_cleanup_interval_secs() -> u64 {
    86400
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config: AppConfig = serde_json::from_value(serde_json::json!({
            "database_url": "postgres://localhost/leafscan",
            "redis_url": "redis://localhost",
            "inference_url": "http://localhost:8500/infer",
            "inference_api_token": "token",
            "s3_endpoint": "http://localhost:9000",
            "s3_access_key": "key",
            "s3_secret_key": "secret",
            "default_store": "leafscan-manual",
        }))
        .expect("config with defaults should deserialize");

        assert_eq!(config.min_image_bytes, 1024);
        assert_eq!(config.item_timeout_secs, 300);
        assert_eq!(config.download_retries, 3);
        assert_eq!(config.listing_retries, 2);
        assert_eq!(config.manual_records_to_keep, 10);
        assert_eq!(config.days_to_keep_manual_records, 0);
        assert_eq!(config.days_to_keep_batches, 30);
        assert_eq!(config.batch_jobs_to_keep, 20);
    }
}
