use std::env;
use std::str::FromStr;

pub enum EnvKey {
    ServerPort,
    DatabaseUrl,
    RabbitMqUrl,
    S3BucketName,
    S3BucketRegion,
    S3Endpoint,
    AwsAccessKey,
    AwsSecretKey,
    CdnDomain,
    CloudFrontDistributionId,
    MaxRetryCount,
    RetryDelayMs,
    ReconnectDelayMs,
    MaxUploadBytes,
    WorkDir,
}

impl EnvKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvKey::ServerPort => "APP_PORT",
            EnvKey::DatabaseUrl => "DATABASE_URL",
            EnvKey::RabbitMqUrl => "RABBITMQ_URL",
            EnvKey::S3BucketName => "S3_BUCKET_NAME",
            EnvKey::S3BucketRegion => "S3_BUCKET_REGION",
            EnvKey::S3Endpoint => "S3_ENDPOINT",
            EnvKey::AwsAccessKey => "AWS_ACCESS_KEY_ID",
            EnvKey::AwsSecretKey => "AWS_SECRET_ACCESS_KEY",
            EnvKey::CdnDomain => "CDN_DOMAIN",
            EnvKey::CloudFrontDistributionId => "CLOUDFRONT_DISTRIBUTION_ID",
            EnvKey::MaxRetryCount => "MAX_RETRY_COUNT",
            EnvKey::RetryDelayMs => "RETRY_DELAY_MS",
            EnvKey::ReconnectDelayMs => "RECONNECT_DELAY_MS",
            EnvKey::MaxUploadBytes => "MAX_UPLOAD_BYTES",
            EnvKey::WorkDir => "WORK_DIR",
        }
    }
}

pub fn get(key: EnvKey) -> Result<String, env::VarError> {
    env::var(key.as_str())
}

/// `None` when unset or blank.
pub fn get_optional(key: EnvKey) -> Option<String> {
    env::var(key.as_str()).ok().filter(|v| !v.trim().is_empty())
}

pub fn get_or(key: EnvKey, default: &str) -> String {
    env::var(key.as_str()).unwrap_or_else(|_| default.to_string())
}

pub fn get_parsed<T: FromStr>(key: EnvKey, default: T) -> T {
    match get(key) {
        Ok(val) => val.parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}
