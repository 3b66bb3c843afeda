//! S3-compatible storage backend using the AWS SDK.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ObjectMeta, ObjectStore};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use bytes::Bytes;
use tracing::instrument;

/// S3-compatible object store (AWS S3, MinIO, Backblaze B2, ...).
pub struct S3Backend {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: Option<String>,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl S3Backend {
    /// Create a new S3 backend.
    ///
    /// With explicit credentials the client is built directly; otherwise the
    /// ambient AWS credential chain (env vars, profile, IAM role) is used.
    pub async fn new(
        bucket: &str,
        endpoint: Option<String>,
        region: Option<String>,
        prefix: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        force_path_style: bool,
    ) -> StorageResult<Self> {
        if access_key_id.is_some() ^ secret_access_key.is_some() {
            return Err(StorageError::Config(
                "s3 config requires both access_key_id and secret_access_key when either is set"
                    .to_string(),
            ));
        }

        let resolved_region = region.unwrap_or_else(|| "us-east-1".to_string());
        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new(resolved_region.clone()))
            .force_path_style(force_path_style);

        if let (Some(key_id), Some(secret)) = (access_key_id, secret_access_key) {
            let credentials = aws_sdk_s3::config::Credentials::new(
                key_id,
                secret,
                None, // session token
                None, // expiration
                "lightbox-config",
            );
            builder = builder.credentials_provider(credentials);
        } else {
            let shared = aws_config::defaults(BehaviorVersion::latest())
                .region(aws_config::Region::new(resolved_region))
                .load()
                .await;
            if let Some(provider) = shared.credentials_provider() {
                builder = builder.credentials_provider(provider);
            }
        }

        if let Some(endpoint_url) = endpoint {
            // Handle bare host:port endpoints (e.g. "minio:9000").
            let endpoint_lower = endpoint_url.to_lowercase();
            let normalized = if endpoint_lower.starts_with("http://")
                || endpoint_lower.starts_with("https://")
            {
                endpoint_url
            } else {
                format!("http://{endpoint_url}")
            };
            builder = builder.endpoint_url(normalized);
        }

        Ok(Self {
            client: aws_sdk_s3::Client::from_conf(builder.build()),
            bucket: bucket.to_string(),
            prefix,
        })
    }

    /// Construct the full S3 key from a relative key.
    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), key),
            None => key.to_string(),
        }
    }

    /// Strip the configured prefix from an S3 key.
    fn relative_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => {
                let normalized = prefix.trim_end_matches('/');
                key.strip_prefix(normalized)
                    .and_then(|s| s.strip_prefix('/'))
                    .unwrap_or(key)
                    .to_string()
            }
            None => key.to_string(),
        }
    }

    fn parse_datetime(dt: &aws_sdk_s3::primitives::DateTime) -> Option<time::OffsetDateTime> {
        time::OffsetDateTime::from_unix_timestamp_nanos(dt.as_nanos()).ok()
    }
}

#[async_trait]
impl ObjectStore for S3Backend {
    #[instrument(skip(self), fields(backend = "s3"))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        match self.head(key).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let resp = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map(|s| s.is_not_found()) == Some(true) {
                    StorageError::NotFound(key.to_string())
                } else {
                    StorageError::S3(Box::new(e))
                }
            })?;

        Ok(ObjectMeta {
            size: resp.content_length().unwrap_or(0).max(0) as u64,
            last_modified: resp.last_modified().and_then(Self::parse_datetime),
            etag: resp.e_tag().map(|t| t.trim_matches('"').to_string()),
        })
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map(|s| s.is_no_such_key()) == Some(true) {
                    StorageError::NotFound(key.to_string())
                } else {
                    StorageError::S3(Box::new(e))
                }
            })?;

        let data = resp
            .body
            .collect()
            .await
            .map_err(|e| StorageError::S3(Box::new(e)))?;
        Ok(data.into_bytes())
    }

    #[instrument(skip(self, data), fields(backend = "s3", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .body(data.into())
            .send()
            .await
            .map_err(|e| StorageError::S3(Box::new(e)))?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| StorageError::S3(Box::new(e)))?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut results = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(self.full_key(prefix))
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| StorageError::S3(Box::new(e)))?;
            for object in page.contents() {
                if let Some(key) = object.key() {
                    results.push(self.relative_key(key));
                }
            }
        }

        Ok(results)
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn health_check(&self) -> StorageResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| StorageError::S3(Box::new(e)))?;
        Ok(())
    }
}
