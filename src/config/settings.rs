use crate::config::env::{self, EnvKey};
use crate::infrastructure::queue::BrokerConfig;
use crate::infrastructure::storage::StorageSettings;
use serde::Deserialize;
use std::time::Duration;

pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 2 * 1024 * 1024 * 1024;

#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    pub server_port: u16,
    pub database_url: String,
    pub rabbitmq_url: String,
    pub s3_bucket: String,
    pub s3_region: String,
    pub s3_endpoint: Option<String>,
    pub aws_access_key: String,
    pub aws_secret_key: String,
    pub cdn_domain: String,
    pub cloudfront_distribution_id: String,
    pub max_retry_count: u32,
    pub retry_delay_ms: u64,
    pub reconnect_delay_ms: u64,
    pub max_upload_bytes: u64,
    pub work_dir: String,
}

impl AppConfig {
    pub fn new() -> Result<Self, std::env::VarError> {
        Ok(Self {
            server_port: env::get_parsed(EnvKey::ServerPort, 3000),
            database_url: env::get(EnvKey::DatabaseUrl)?,
            rabbitmq_url: env::get(EnvKey::RabbitMqUrl)?,
            s3_bucket: env::get(EnvKey::S3BucketName)?,
            s3_region: env::get_or(EnvKey::S3BucketRegion, "us-east-1"),
            s3_endpoint: env::get_optional(EnvKey::S3Endpoint),
            aws_access_key: env::get(EnvKey::AwsAccessKey)?,
            aws_secret_key: env::get(EnvKey::AwsSecretKey)?,
            cdn_domain: env::get(EnvKey::CdnDomain)?,
            cloudfront_distribution_id: env::get(EnvKey::CloudFrontDistributionId)?,
            max_retry_count: env::get_parsed(EnvKey::MaxRetryCount, 3),
            retry_delay_ms: env::get_parsed(EnvKey::RetryDelayMs, 3000),
            reconnect_delay_ms: env::get_parsed(EnvKey::ReconnectDelayMs, 5000),
            max_upload_bytes: env::get_parsed(EnvKey::MaxUploadBytes, DEFAULT_MAX_UPLOAD_BYTES),
            work_dir: env::get_or(EnvKey::WorkDir, "./outputs"),
        })
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            max_retry_count: self.max_retry_count,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            ..BrokerConfig::default()
        }
    }

    pub fn storage_settings(&self) -> StorageSettings {
        StorageSettings {
            bucket: self.s3_bucket.clone(),
            region: self.s3_region.clone(),
            endpoint: self.s3_endpoint.clone(),
            access_key: self.aws_access_key.clone(),
            secret_key: self.aws_secret_key.clone(),
            cdn_domain: self.cdn_domain.clone(),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> AppConfig {
    AppConfig {
        server_port: 3000,
        database_url: "postgres://localhost/transcoding".into(),
        rabbitmq_url: "amqp://localhost:5672".into(),
        s3_bucket: "videos".into(),
        s3_region: "us-east-1".into(),
        s3_endpoint: Some("http://127.0.0.1:9000".into()),
        aws_access_key: "minio".into(),
        aws_secret_key: "minio123".into(),
        cdn_domain: "https://cdn.example.com".into(),
        cloudfront_distribution_id: "E123".into(),
        max_retry_count: 3,
        retry_delay_ms: 3000,
        reconnect_delay_ms: 5000,
        max_upload_bytes: 1024,
        work_dir: "./outputs".into(),
    }
}
