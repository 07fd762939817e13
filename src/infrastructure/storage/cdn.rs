use super::{CdnInvalidator, StorageError, StorageResult};
use async_trait::async_trait;
use aws_sdk_cloudfront::config::{BehaviorVersion, Builder, Credentials, Region};
use aws_sdk_cloudfront::error::DisplayErrorContext;
use aws_sdk_cloudfront::types::{InvalidationBatch, Paths};
use aws_sdk_cloudfront::Client;
use tracing::{debug, info};

/// CloudFront is global; requests are signed against us-east-1.
const CLOUDFRONT_REGION: &str = "us-east-1";

#[derive(Clone)]
pub struct CloudFrontInvalidator {
    client: Client,
    distribution_id: String,
}

impl CloudFrontInvalidator {
    pub fn new(distribution_id: &str, access_key: &str, secret_key: &str) -> Self {
        let credentials = Credentials::new(access_key, secret_key, None, None, "static");

        let config = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(CLOUDFRONT_REGION))
            .credentials_provider(credentials)
            .build();

        info!("✅ CloudFront client ready for distribution {}", distribution_id);

        Self {
            client: Client::from_conf(config),
            distribution_id: distribution_id.to_string(),
        }
    }
}

#[async_trait]
impl CdnInvalidator for CloudFrontInvalidator {
    async fn invalidate(&self, key: &str) -> StorageResult<()> {
        let paths = Paths::builder()
            .quantity(1)
            .items(format!("/{}", key))
            .build()
            .map_err(|e| StorageError::Cdn(e.to_string()))?;

        let batch = InvalidationBatch::builder()
            .caller_reference(key)
            .paths(paths)
            .build()
            .map_err(|e| StorageError::Cdn(e.to_string()))?;

        self.client
            .create_invalidation()
            .distribution_id(&self.distribution_id)
            .invalidation_batch(batch)
            .send()
            .await
            .map_err(|e| StorageError::Cdn(DisplayErrorContext(&e).to_string()))?;

        debug!("Invalidated CDN path /{}", key);
        Ok(())
    }
}
