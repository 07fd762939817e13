use super::{BlobStore, StorageError, StorageResult, StoredObject, UploadedFile};
use crate::common::mime::content_type_for;
use crate::common::upload::upload_stream;
use async_trait::async_trait;
use aws_sdk_s3::config::Builder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::{Client, config::BehaviorVersion, config::Credentials, config::Region};
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};
use url::Url;

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key: String,
    pub secret_key: String,
    pub cdn_domain: String,
}

#[derive(Clone)]
pub struct StorageService {
    pub client: Client,
    pub bucket: String,
    cdn_domain: String,
    http: reqwest::Client,
}

fn s3_error(e: impl std::error::Error) -> StorageError {
    StorageError::S3(DisplayErrorContext(&e).to_string())
}

impl StorageService {
    pub fn new(settings: &StorageSettings) -> Self {
        let credentials = Credentials::new(
            &settings.access_key,
            &settings.secret_key,
            None,
            None,
            "static",
        );

        let mut builder = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()))
            .credentials_provider(credentials);

        if let Some(endpoint) = &settings.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true); // MinIO
        }

        let client = Client::from_conf(builder.build());

        info!("✅ S3 client ready for bucket {}", settings.bucket);

        Self {
            client,
            bucket: settings.bucket.clone(),
            cdn_domain: settings.cdn_domain.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// Public CDN url for `key`.
    pub fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.cdn_domain, key)
    }

    pub async fn create_multipart_upload(&self, key: &str, content_type: &str) -> StorageResult<String> {
        let result = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(s3_error)?;

        result
            .upload_id
            .ok_or_else(|| StorageError::S3(format!("no upload id returned for {}", key)))
    }

    pub async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: bytes::Bytes,
    ) -> StorageResult<CompletedPart> {
        let result = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(aws_sdk_s3::primitives::ByteStream::from(body))
            .send()
            .await
            .map_err(s3_error)?;

        Ok(CompletedPart::builder()
            .set_e_tag(result.e_tag)
            .part_number(part_number)
            .build())
    }

    pub async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> StorageResult<()> {
        let completed_multipart_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed_multipart_upload)
            .send()
            .await
            .map_err(s3_error)?;

        Ok(())
    }

    pub async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> StorageResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(s3_error)?;

        Ok(())
    }

    pub async fn upload_file(&self, path: &Path, key: &str, content_type: &str) -> StorageResult<StoredObject> {
        let file = tokio::fs::File::open(path).await?;
        upload_stream(self, ReaderStream::new(file), key.to_string(), content_type, None).await
    }
}

/// Regular files under `dir`, as (absolute path, '/'-joined relative path), sorted.
async fn list_files(dir: &Path) -> StorageResult<Vec<(PathBuf, String)>> {
    let mut files = Vec::new();
    let mut pending = vec![(dir.to_path_buf(), String::new())];

    while let Some((current, relative)) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let relative_name = if relative.is_empty() {
                name
            } else {
                format!("{}/{}", relative, name)
            };

            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push((entry.path(), relative_name));
            } else if file_type.is_file() {
                files.push((entry.path(), relative_name));
            }
        }
    }

    files.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(files)
}

#[async_trait]
impl BlobStore for StorageService {
    async fn download_to_file(&self, url: &str, dest: &Path) -> StorageResult<u64> {
        let url = Url::parse(url).map_err(|e| StorageError::Download(format!("invalid url {}: {}", url, e)))?;

        let response = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| StorageError::Download(e.to_string()))?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut body = response.bytes_stream();
        let mut written = 0u64;

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| StorageError::Download(e.to_string()))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        debug!("Downloaded {} bytes to {}", written, dest.display());
        Ok(written)
    }

    async fn upload_folder(&self, dir: &Path, prefix: &str) -> StorageResult<Vec<UploadedFile>> {
        let mut uploaded = Vec::new();

        for (path, file_name) in list_files(dir).await? {
            let key = format!("{}/{}", prefix, file_name);
            let stored = self.upload_file(&path, &key, content_type_for(&path)).await?;
            uploaded.push(UploadedFile {
                url: stored.url,
                key: stored.key,
                file_name,
            });
        }

        info!("Uploaded {} files under {}", uploaded.len(), prefix);
        Ok(uploaded)
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(s3_error)?;

        Ok(())
    }
}
