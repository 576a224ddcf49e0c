// S3-compatible object storage client
// Works against AWS S3 as well as MinIO/LocalStack through a custom endpoint

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Credentials as AwsCredentials;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use aws_types::region::Region;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::object_store::{Credentials, ObjectPage, ObjectStorageClient, ObjectStoreError, UploadOptions};
use super::StoredArtifact;

/// Smallest part size S3 accepts for all but the last part
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Connection settings for an S3-compatible service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Settings {
    pub region: String,
    /// Custom endpoint for S3-compatible services
    pub endpoint_url: Option<String>,
    pub force_path_style: bool,
}

impl Default for S3Settings {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            endpoint_url: None,
            force_path_style: false,
        }
    }
}

/// [`ObjectStorageClient`] over the AWS SDK
#[derive(Debug, Clone)]
pub struct S3ObjectClient {
    client: Client,
}

fn service_error<E: std::error::Error>(context: &str, err: E) -> ObjectStoreError {
    ObjectStoreError::Service(format!("{}: {}", context, DisplayErrorContext(&err)))
}

impl S3ObjectClient {
    /// Build a client authenticating with `credentials`
    pub async fn connect(credentials: &Credentials, settings: &S3Settings) -> Self {
        let provider = match credentials {
            Credentials::SharedKey {
                access_key_id,
                secret_access_key,
            } => AwsCredentials::new(access_key_id, secret_access_key, None, None, "snapcoord-shared-key"),
            Credentials::DelegationToken {
                access_key_id,
                secret_access_key,
                session_token,
            } => AwsCredentials::new(
                access_key_id,
                secret_access_key,
                Some(session_token.clone()),
                None,
                "snapcoord-delegation-token",
            ),
        };

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()))
            .credentials_provider(provider);
        if let Some(endpoint) = &settings.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if settings.force_path_style {
            builder = builder.force_path_style(true);
        }

        Self {
            client: Client::from_conf(builder.build()),
        }
    }

    async fn upload_multipart(
        &self,
        bucket: &str,
        key: &str,
        source: &Path,
        size: u64,
        options: UploadOptions,
    ) -> Result<(), ObjectStoreError> {
        let part_size = options.block_size.max(MIN_PART_SIZE) as u64;
        let part_count = size.div_ceil(part_size);

        let created = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| service_error("create multipart upload", e))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| ObjectStoreError::Service("multipart upload returned no id".to_string()))?
            .to_string();
        debug!(key, parts = part_count, "Started multipart upload");

        let permits = Arc::new(Semaphore::new(options.parallelism.max(1)));
        let mut handles = Vec::with_capacity(part_count as usize);
        for index in 0..part_count {
            let permits = Arc::clone(&permits);
            let client = self.client.clone();
            let (bucket, key, upload_id) = (bucket.to_string(), key.to_string(), upload_id.clone());
            let source = source.to_path_buf();
            let offset = index * part_size;
            let length = part_size.min(size - offset) as usize;
            let part_number = (index + 1) as i32;

            handles.push(tokio::spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| ObjectStoreError::Service(e.to_string()))?;

                let mut file = tokio::fs::File::open(&source)
                    .await
                    .map_err(|e| ObjectStoreError::Service(format!("open {}: {}", source.display(), e)))?;
                file.seek(std::io::SeekFrom::Start(offset))
                    .await
                    .map_err(|e| ObjectStoreError::Service(e.to_string()))?;
                let mut buf = vec![0u8; length];
                file.read_exact(&mut buf)
                    .await
                    .map_err(|e| ObjectStoreError::Service(e.to_string()))?;

                let uploaded = client
                    .upload_part()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .part_number(part_number)
                    .body(ByteStream::from(buf))
                    .send()
                    .await
                    .map_err(|e| service_error("upload part", e))?;

                Ok::<CompletedPart, ObjectStoreError>(
                    CompletedPart::builder()
                        .set_e_tag(uploaded.e_tag().map(str::to_string))
                        .part_number(part_number)
                        .build(),
                )
            }));
        }

        let mut parts = Vec::with_capacity(handles.len());
        let mut failure = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(part)) => parts.push(part),
                Ok(Err(err)) => {
                    failure.get_or_insert(err);
                }
                Err(err) => {
                    failure.get_or_insert(ObjectStoreError::Service(format!("part task failed: {}", err)));
                }
            }
        }

        if let Some(err) = failure {
            if let Err(abort) = self
                .client
                .abort_multipart_upload()
                .bucket(bucket)
                .key(key)
                .upload_id(&upload_id)
                .send()
                .await
            {
                warn!(key, error = %DisplayErrorContext(&abort), "Failed to abort multipart upload");
            }
            return Err(err);
        }

        parts.sort_by_key(|part| part.part_number());
        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
            .send()
            .await
            .map_err(|e| service_error("complete multipart upload", e))?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStorageClient for S3ObjectClient {
    async fn create_container(&self, container: &str) -> Result<(), ObjectStoreError> {
        match self.client.create_bucket().bucket(container).send().await {
            Ok(_) => Ok(()),
            Err(err) => {
                let service = err.into_service_error();
                if service.is_bucket_already_exists() || service.is_bucket_already_owned_by_you() {
                    Err(ObjectStoreError::AlreadyExists)
                } else {
                    Err(service_error("create bucket", service))
                }
            }
        }
    }

    async fn upload(&self, container: &str, key: &str, source: &Path, options: UploadOptions) -> Result<(), ObjectStoreError> {
        let size = tokio::fs::metadata(source)
            .await
            .map_err(|e| ObjectStoreError::Service(format!("stat {}: {}", source.display(), e)))?
            .len();

        if size > options.block_size.max(MIN_PART_SIZE) as u64 {
            return self.upload_multipart(container, key, source, size, options).await;
        }

        let body = ByteStream::from_path(source)
            .await
            .map_err(|e| ObjectStoreError::Service(format!("read {}: {}", source.display(), e)))?;
        self.client
            .put_object()
            .bucket(container)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| service_error("put object", e))?;
        Ok(())
    }

    async fn list_page(&self, container: &str, prefix: &str, marker: Option<String>) -> Result<ObjectPage, ObjectStoreError> {
        let response = self
            .client
            .list_objects_v2()
            .bucket(container)
            .prefix(prefix)
            .set_continuation_token(marker)
            .send()
            .await
            .map_err(|e| service_error("list objects", e))?;

        let objects = response
            .contents()
            .iter()
            .filter_map(|object| {
                let key = object.key()?;
                let modified = object.last_modified()?;
                let last_modified = DateTime::<Utc>::from_timestamp(modified.secs(), modified.subsec_nanos())?;
                Some(StoredArtifact {
                    id: key.to_string(),
                    last_modified,
                })
            })
            .collect();

        let next_marker = if response.is_truncated().unwrap_or(false) {
            response.next_continuation_token().map(str::to_string)
        } else {
            None
        };

        Ok(ObjectPage { objects, next_marker })
    }

    async fn delete(&self, container: &str, key: &str) -> Result<(), ObjectStoreError> {
        self.client
            .delete_object()
            .bucket(container)
            .key(key)
            .send()
            .await
            .map_err(|e| service_error("delete object", e))?;
        Ok(())
    }
}
